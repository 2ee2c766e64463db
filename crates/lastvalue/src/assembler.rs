//! Conversion of resolved slots into output rows.

use crate::series::{LastSlot, SeriesKey, Timestamp};

/// Name of the time column.
pub const COLUMN_TIME: &str = "Time";

/// Name of the column holding the series label.
pub const COLUMN_TIMESERIES: &str = "timeseries";

/// Name of the column holding the rendered value.
pub const COLUMN_VALUE: &str = "value";

/// One output row of a last-value query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Timestamp of the last point.
    pub timestamp: Timestamp,
    /// Display label of the series.
    pub timeseries: String,
    /// Textual value, `None` for a point whose recorded value is null.
    pub value: Option<String>,
}

/// Rows of a last-value query with their column names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastQueryDataSet {
    /// Column names, time column first.
    pub columns: Vec<String>,
    /// Emitted rows.
    pub rows: Vec<Row>,
}

impl LastQueryDataSet {
    /// Wraps rows with the standard column header.
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            columns: vec![
                COLUMN_TIME.to_string(),
                COLUMN_TIMESERIES.to_string(),
                COLUMN_VALUE.to_string(),
            ],
            rows,
        }
    }

    /// Returns the number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if no row was emitted.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Returns the display label: query alias, then measurement alias, then full path.
pub fn display_label(key: &SeriesKey) -> String {
    if let Some(alias) = key.ts_alias() {
        return alias.to_string();
    }
    key.full_path_with_alias()
}

/// Builds rows from positional slots.
///
/// Empty slots emit no row. Ascending output keeps input order; descending
/// output is stably sorted by timestamp, newest first.
pub fn assemble(series: &[SeriesKey], slots: Vec<LastSlot>, ascending: bool) -> Vec<Row> {
    let mut rows: Vec<Row> = series
        .iter()
        .zip(slots)
        .filter_map(|(key, slot)| {
            slot.map(|pair| Row {
                timestamp: pair.timestamp,
                timeseries: display_label(key),
                value: pair.value.map(|value| value.to_string()),
            })
        })
        .collect();

    if !ascending {
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }
    rows
}
