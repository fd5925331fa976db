//! Ordering and equality for stored JSON values.
//!
//! Values of different kinds never satisfy a range filter. For sorting, kinds
//! order as null < bool < number < timestamp < string < array < object.
//! Strings that parse as RFC 3339 timestamps compare chronologically, since
//! serialized timestamps vary in fractional-second precision.

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use serde_json::Value;

fn timestamp(value: &Value) -> Option<DateTime<FixedOffset>> {
    value.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok())
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) if timestamp(value).is_some() => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

/// Returns `true` if both values are of a kind that range filters can compare.
pub(super) fn same_kind(a: &Value, b: &Value) -> bool {
    kind_rank(a) == kind_rank(b)
}

/// Total order used for sorting and cursors.
pub(super) fn compare(a: &Value, b: &Value) -> Ordering {
    let by_kind = kind_rank(a).cmp(&kind_rank(b));
    if by_kind != Ordering::Equal {
        return by_kind;
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => match (timestamp(a), timestamp(b)) {
            (Some(ta), Some(tb)) => ta.cmp(&tb),
            _ => x.cmp(y),
        },
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y) {
                let ord = compare(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => Ordering::Equal,
    }
}

/// Equality with numeric normalization (`1 == 1.0`).
pub(super) fn equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare(a, b) == Ordering::Equal,
        (Value::String(_), Value::String(_)) => {
            a == b || (same_kind(a, b) && compare(a, b) == Ordering::Equal)
        }
        _ => a == b,
    }
}
