//! Global time/value filters for last-value queries.
//!
//! A filter applies uniformly to every series of a batch. It is only used to
//! decide whether a cached last point still qualifies; points produced by a
//! storage scan are returned unfiltered.

use crate::error::{LastQueryError, Result};
use crate::series::{TimeValuePair, Timestamp, TypedValue};
use std::cmp::Ordering;

/// Comparison operator used by time and value predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// Equal.
    Eq,
    /// Not equal.
    NotEq,
    /// Strictly greater.
    Gt,
    /// Greater or equal.
    GtEq,
    /// Strictly less.
    Lt,
    /// Less or equal.
    LtEq,
}

impl CompareOp {
    fn is_ordering(self) -> bool {
        matches!(self, Self::Gt | Self::GtEq | Self::Lt | Self::LtEq)
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::NotEq => ordering != Ordering::Equal,
            Self::Gt => ordering == Ordering::Greater,
            Self::GtEq => ordering != Ordering::Less,
            Self::Lt => ordering == Ordering::Less,
            Self::LtEq => ordering != Ordering::Greater,
        }
    }
}

/// Predicate over a point's timestamp and value.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `time <op> operand`.
    Time(CompareOp, Timestamp),
    /// `start <= time <= end`.
    TimeRange {
        /// Inclusive lower bound.
        start: Timestamp,
        /// Inclusive upper bound.
        end: Timestamp,
    },
    /// `value <op> operand`.
    Value(CompareOp, TypedValue),
    /// Both filters hold.
    And(Box<Filter>, Box<Filter>),
    /// Either filter holds.
    Or(Box<Filter>, Box<Filter>),
    /// The filter does not hold.
    Not(Box<Filter>),
}

impl Filter {
    /// `time > ts`.
    pub fn time_gt(ts: Timestamp) -> Self {
        Self::Time(CompareOp::Gt, ts)
    }

    /// `time >= ts`.
    pub fn time_gt_eq(ts: Timestamp) -> Self {
        Self::Time(CompareOp::GtEq, ts)
    }

    /// `time < ts`.
    pub fn time_lt(ts: Timestamp) -> Self {
        Self::Time(CompareOp::Lt, ts)
    }

    /// `time <= ts`.
    pub fn time_lt_eq(ts: Timestamp) -> Self {
        Self::Time(CompareOp::LtEq, ts)
    }

    /// `start <= time <= end`.
    pub fn time_range(start: Timestamp, end: Timestamp) -> Self {
        Self::TimeRange { start, end }
    }

    /// `value <op> operand`.
    pub fn value(op: CompareOp, operand: TypedValue) -> Self {
        Self::Value(op, operand)
    }

    /// Combines two filters with AND.
    pub fn and(self, other: Filter) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    /// Combines two filters with OR.
    pub fn or(self, other: Filter) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// Negates a filter.
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Validates the filter.
    ///
    /// # Errors
    ///
    /// Returns [`LastQueryError::InvalidFilter`] for an inverted time range,
    /// a NaN operand, or an ordering comparison against a boolean.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Time(_, _) => Ok(()),
            Self::TimeRange { start, end } => {
                if start > end {
                    return Err(LastQueryError::InvalidFilter(format!(
                        "time range start {} is after end {}",
                        start, end
                    )));
                }
                Ok(())
            }
            Self::Value(op, operand) => {
                if operand.is_nan() {
                    return Err(LastQueryError::InvalidFilter(
                        "NaN value operand".to_string(),
                    ));
                }
                if op.is_ordering() && matches!(operand, TypedValue::Boolean(_)) {
                    return Err(LastQueryError::InvalidFilter(format!(
                        "operator {:?} is not defined for boolean values",
                        op
                    )));
                }
                Ok(())
            }
            Self::And(left, right) | Self::Or(left, right) => {
                left.validate()?;
                right.validate()
            }
            Self::Not(inner) => inner.validate(),
        }
    }

    /// Evaluates the filter against one point.
    pub fn matches(&self, pair: &TimeValuePair) -> bool {
        match self {
            Self::Time(op, operand) => op.holds(pair.timestamp.cmp(operand)),
            Self::TimeRange { start, end } => pair.timestamp >= *start && pair.timestamp <= *end,
            Self::Value(op, operand) => match &pair.value {
                Some(value) => compare_values(value, operand).is_some_and(|ord| op.holds(ord)),
                None => false,
            },
            Self::And(left, right) => left.matches(pair) && right.matches(pair),
            Self::Or(left, right) => left.matches(pair) || right.matches(pair),
            Self::Not(inner) => !inner.matches(pair),
        }
    }
}

/// Returns true if `pair` qualifies under `filter`. An absent filter always qualifies.
pub fn satisfy(filter: Option<&Filter>, pair: &TimeValuePair) -> bool {
    filter.map_or(true, |filter| filter.matches(pair))
}

fn compare_values(value: &TypedValue, operand: &TypedValue) -> Option<Ordering> {
    use TypedValue::*;

    match (value, operand) {
        (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
        (Text(a), Text(b)) => Some(a.cmp(b)),
        (Int32(a), Int32(b)) => Some(a.cmp(b)),
        (Int64(a), Int64(b)) => Some(a.cmp(b)),
        (Int32(a), Int64(b)) => Some(i64::from(*a).cmp(b)),
        (Int64(a), Int32(b)) => Some(a.cmp(&i64::from(*b))),
        (Int64(a), Float(_) | Double(_)) => compare_i64_f64(*a, operand.as_f64()?),
        (Float(_) | Double(_), Int64(b)) => {
            compare_i64_f64(*b, value.as_f64()?).map(Ordering::reverse)
        }
        _ => {
            let a = value.as_f64()?;
            let b = operand.as_f64()?;
            a.partial_cmp(&b)
        }
    }
}

/// Compares without widening the integer, which loses precision past 2^53.
fn compare_i64_f64(a: i64, b: f64) -> Option<Ordering> {
    // 2^63, the first float above every i64.
    const I64_END: f64 = 9_223_372_036_854_775_808.0;

    if b.is_nan() {
        return None;
    }
    if b >= I64_END {
        return Some(Ordering::Less);
    }
    if b < -I64_END {
        return Some(Ordering::Greater);
    }
    let whole = b.trunc();
    match a.cmp(&(whole as i64)) {
        Ordering::Equal => 0.0f64.partial_cmp(&(b - whole)),
        other => Some(other),
    }
}
