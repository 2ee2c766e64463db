//! Last-value query plan.

use crate::error::{LastQueryError, Result};
use crate::filter::Filter;
use crate::series::{group_by_device, DataType, DeviceMeasurements, SeriesKey};
use std::collections::HashSet;

/// Physical plan of a `SELECT LAST` query.
#[derive(Debug, Clone)]
pub struct LastQueryPlan {
    series: Vec<SeriesKey>,
    data_types: Vec<DataType>,
    filter: Option<Filter>,
    device_measurements: DeviceMeasurements,
    ascending: bool,
}

impl LastQueryPlan {
    /// Creates a plan over `series` with their declared data types.
    ///
    /// The device/measurement grouping is derived from `series`; the plan is
    /// ascending (rows in input order) with no filter.
    pub fn new(series: Vec<SeriesKey>, data_types: Vec<DataType>) -> Self {
        let device_measurements = group_by_device(&series);
        Self {
            series,
            data_types,
            filter: None,
            device_measurements,
            ascending: true,
        }
    }

    /// Sets the global filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the output order. `false` sorts rows by timestamp descending.
    pub fn with_ascending(mut self, ascending: bool) -> Self {
        self.ascending = ascending;
        self
    }

    /// Overrides the device/measurement grouping used to scope readers.
    pub fn with_device_measurements(mut self, device_measurements: DeviceMeasurements) -> Self {
        self.device_measurements = device_measurements;
        self
    }

    /// Removes repeated series, keeping the first occurrence and its type.
    pub fn dedup(mut self) -> Self {
        let mut seen = HashSet::new();
        let mut series = Vec::with_capacity(self.series.len());
        let mut data_types = Vec::with_capacity(self.data_types.len());
        for (key, data_type) in self.series.into_iter().zip(self.data_types) {
            if seen.insert(key.clone()) {
                series.push(key);
                data_types.push(data_type);
            }
        }
        self.series = series;
        self.data_types = data_types;
        self
    }

    /// Returns the selected series in output position order.
    pub fn series(&self) -> &[SeriesKey] {
        &self.series
    }

    /// Returns the declared data types, aligned with [`LastQueryPlan::series`].
    pub fn data_types(&self) -> &[DataType] {
        &self.data_types
    }

    /// Returns the global filter.
    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    /// Returns the device/measurement grouping.
    pub fn device_measurements(&self) -> &DeviceMeasurements {
        &self.device_measurements
    }

    /// Returns true if rows keep input order.
    pub fn is_ascending(&self) -> bool {
        self.ascending
    }

    /// Checks the plan before any cache or storage access.
    ///
    /// # Errors
    ///
    /// Returns [`LastQueryError::InvalidPlan`] if series and data types differ
    /// in length, or [`LastQueryError::InvalidFilter`] for a malformed filter.
    pub fn validate(&self) -> Result<()> {
        if self.series.len() != self.data_types.len() {
            return Err(LastQueryError::InvalidPlan(format!(
                "{} series but {} data types",
                self.series.len(),
                self.data_types.len()
            )));
        }
        if let Some(filter) = &self.filter {
            filter.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_groups_by_device() {
        let plan = LastQueryPlan::new(
            vec![
                SeriesKey::new("root.sg.d1", "s1"),
                SeriesKey::new("root.sg.d1", "s2"),
            ],
            vec![DataType::Int32, DataType::Double],
        );
        assert!(plan.is_ascending());
        assert_eq!(plan.device_measurements()["root.sg.d1"].len(), 2);
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let plan = LastQueryPlan::new(
            vec![
                SeriesKey::new("root.sg.d1", "s1").with_ts_alias("first"),
                SeriesKey::new("root.sg.d1", "s2"),
                SeriesKey::new("root.sg.d1", "s1").with_ts_alias("second"),
            ],
            vec![DataType::Int32, DataType::Text, DataType::Int32],
        )
        .dedup();
        assert_eq!(plan.series().len(), 2);
        assert_eq!(plan.series()[0].ts_alias(), Some("first"));
        assert_eq!(plan.data_types(), &[DataType::Int32, DataType::Text]);
    }

    #[test]
    fn test_validate_length_mismatch() {
        let plan = LastQueryPlan::new(vec![SeriesKey::new("root.sg.d1", "s1")], vec![]);
        assert!(matches!(
            plan.validate(),
            Err(LastQueryError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_validate_filter() {
        let plan = LastQueryPlan::new(vec![], vec![]).with_filter(Filter::time_range(2, 1));
        assert!(matches!(
            plan.validate(),
            Err(LastQueryError::InvalidFilter(_))
        ));
    }
}
