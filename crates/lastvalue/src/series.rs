//! Series identifiers, typed values, and time/value pairs.

use crate::error::{LastQueryError, Result};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Timestamp type (milliseconds or nanoseconds, caller-defined).
pub type Timestamp = i64;

/// Outcome of resolving one series: `None` when no qualifying point exists.
pub type LastSlot = Option<TimeValuePair>;

/// Device path to the set of measurements queried on that device.
pub type DeviceMeasurements = HashMap<String, BTreeSet<String>>;

/// Path separator between device and measurement.
pub const PATH_SEPARATOR: char = '.';

/// Identifier of a single series: a device plus one of its measurements.
///
/// Two keys are equal when device and measurement match; display aliases
/// are ignored for equality and hashing.
#[derive(Debug, Clone)]
pub struct SeriesKey {
    device: String,
    measurement: String,
    measurement_alias: Option<String>,
    ts_alias: Option<String>,
}

impl SeriesKey {
    /// Creates a series key from a device path and measurement name.
    pub fn new(device: impl Into<String>, measurement: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            measurement: measurement.into(),
            measurement_alias: None,
            ts_alias: None,
        }
    }

    /// Parses a full path such as `root.sg.d1.s1`.
    ///
    /// The last component is the measurement, the rest is the device.
    ///
    /// # Errors
    ///
    /// Returns [`LastQueryError::InvalidPath`] if the path has no device part
    /// or contains empty components.
    pub fn parse(path: &str) -> Result<Self> {
        let (device, measurement) = path
            .rsplit_once(PATH_SEPARATOR)
            .ok_or_else(|| LastQueryError::InvalidPath(path.to_string()))?;
        if measurement.is_empty() || device.split(PATH_SEPARATOR).any(str::is_empty) {
            return Err(LastQueryError::InvalidPath(path.to_string()));
        }
        Ok(Self::new(device, measurement))
    }

    /// Sets the alias of the measurement (schema-level alias).
    pub fn with_measurement_alias(mut self, alias: impl Into<String>) -> Self {
        self.measurement_alias = Some(alias.into());
        self
    }

    /// Sets the alias given to the series in the query (`AS` clause).
    pub fn with_ts_alias(mut self, alias: impl Into<String>) -> Self {
        self.ts_alias = Some(alias.into());
        self
    }

    /// Returns the device path.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Returns the measurement name.
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Returns the measurement alias, if any.
    pub fn measurement_alias(&self) -> Option<&str> {
        self.measurement_alias.as_deref()
    }

    /// Returns the query-level alias, if any.
    pub fn ts_alias(&self) -> Option<&str> {
        self.ts_alias.as_deref()
    }

    /// Returns `device.measurement`.
    pub fn full_path(&self) -> String {
        format!("{}{}{}", self.device, PATH_SEPARATOR, self.measurement)
    }

    /// Returns `device.alias` when a measurement alias exists, else the full path.
    pub fn full_path_with_alias(&self) -> String {
        match &self.measurement_alias {
            Some(alias) => format!("{}{}{}", self.device, PATH_SEPARATOR, alias),
            None => self.full_path(),
        }
    }

    /// Returns true if the device is `prefix` or lies below it.
    pub fn is_under(&self, prefix: &str) -> bool {
        is_path_under(&self.device, prefix)
    }
}

impl PartialEq for SeriesKey {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device && self.measurement == other.measurement
    }
}

impl Eq for SeriesKey {}

impl Hash for SeriesKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.device.hash(state);
        self.measurement.hash(state);
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.device, PATH_SEPARATOR, self.measurement)
    }
}

/// Returns true if `path` equals `prefix` or is a descendant of it.
pub fn is_path_under(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with(PATH_SEPARATOR),
        None => false,
    }
}

/// Groups the measurements of a batch by device.
pub fn group_by_device(series: &[SeriesKey]) -> DeviceMeasurements {
    let mut grouped = DeviceMeasurements::new();
    for key in series {
        grouped
            .entry(key.device.clone())
            .or_default()
            .insert(key.measurement.clone());
    }
    grouped
}

/// Scalar kind of a series' values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    /// Boolean values.
    Boolean = 0,
    /// 32-bit signed integers.
    Int32 = 1,
    /// 64-bit signed integers.
    Int64 = 2,
    /// 32-bit floats.
    Float = 3,
    /// 64-bit floats.
    Double = 4,
    /// UTF-8 text.
    Text = 5,
}

impl DataType {
    /// Converts from the on-disk tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Boolean),
            1 => Some(Self::Int32),
            2 => Some(Self::Int64),
            3 => Some(Self::Float),
            4 => Some(Self::Double),
            5 => Some(Self::Text),
            _ => None,
        }
    }

    /// Returns the on-disk tag.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A single typed scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    /// Boolean value.
    Boolean(bool),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 text.
    Text(String),
}

impl TypedValue {
    /// Returns the data type of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Boolean(_) => DataType::Boolean,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Float(_) => DataType::Float,
            Self::Double(_) => DataType::Double,
            Self::Text(_) => DataType::Text,
        }
    }

    /// Widens numeric values to `f64`; `None` for boolean and text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(v) => Some(f64::from(*v)),
            Self::Int64(v) => Some(*v as f64),
            Self::Float(v) => Some(f64::from(*v)),
            Self::Double(v) => Some(*v),
            Self::Boolean(_) | Self::Text(_) => None,
        }
    }

    /// Returns true if this is a floating-point NaN.
    pub fn is_nan(&self) -> bool {
        match self {
            Self::Float(v) => v.is_nan(),
            Self::Double(v) => v.is_nan(),
            _ => false,
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Int32(v) => write!(f, "{}", v),
            Self::Int64(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// A timestamp with an optional value.
///
/// A pair whose `value` is `None` is a real point whose recorded value is
/// null. It is distinct from the absence of a point, which is modelled by
/// [`LastSlot`] being `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeValuePair {
    /// Timestamp of the point.
    pub timestamp: Timestamp,
    /// Recorded value, `None` for a null value.
    pub value: Option<TypedValue>,
}

impl TimeValuePair {
    /// Creates a pair with a present value.
    pub fn new(timestamp: Timestamp, value: TypedValue) -> Self {
        Self {
            timestamp,
            value: Some(value),
        }
    }

    /// Creates a pair whose recorded value is null.
    pub fn null(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            value: None,
        }
    }

    /// Returns the data type of the value, if present.
    pub fn data_type(&self) -> Option<DataType> {
        self.value.as_ref().map(TypedValue::data_type)
    }
}
