use std::cmp::Ordering;

use crate::firestore::model::Timestamp;
use crate::firestore::value::server_timestamp::{is_server_timestamp, local_write_time};
use crate::firestore::value::{ArrayValue, FirestoreValue, MapValue, ValueKind};

/// Position of each value type in the cross-type sort order used by the
/// backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeOrder {
    Null = 0,
    Boolean = 1,
    Number = 2,
    Timestamp = 3,
    ServerTimestamp = 4,
    String = 5,
    Bytes = 6,
    Reference = 7,
    GeoPoint = 8,
    Array = 9,
    Map = 10,
}

pub fn type_order(value: &FirestoreValue) -> TypeOrder {
    match value.kind() {
        ValueKind::Null => TypeOrder::Null,
        ValueKind::Boolean(_) => TypeOrder::Boolean,
        ValueKind::Integer(_) | ValueKind::Double(_) => TypeOrder::Number,
        ValueKind::Timestamp(_) => TypeOrder::Timestamp,
        ValueKind::String(_) => TypeOrder::String,
        ValueKind::Bytes(_) => TypeOrder::Bytes,
        ValueKind::Reference(_) => TypeOrder::Reference,
        ValueKind::GeoPoint(_) => TypeOrder::GeoPoint,
        ValueKind::Array(_) => TypeOrder::Array,
        ValueKind::Map(map) => {
            if is_server_timestamp(map) {
                TypeOrder::ServerTimestamp
            } else {
                TypeOrder::Map
            }
        }
    }
}

pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    let left_type = type_order(left);
    if left_type != type_order(right) {
        return false;
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => true,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a == b,
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a == b,
        (ValueKind::Double(a), ValueKind::Double(b)) => {
            if a == b {
                a.is_sign_negative() == b.is_sign_negative()
            } else {
                a.is_nan() && b.is_nan()
            }
        }
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a == b,
        (ValueKind::String(a), ValueKind::String(b)) => a == b,
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a == b,
        (ValueKind::Reference(a), ValueKind::Reference(b)) => a == b,
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a == b,
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            a.values().len() == b.values().len()
                && a
                    .values()
                    .iter()
                    .zip(b.values().iter())
                    .all(|(l, r)| values_equal(l, r))
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            if left_type == TypeOrder::ServerTimestamp {
                return local_write_time(a) == local_write_time(b);
            }
            a.fields().len() == b.fields().len()
                && a.fields().iter().all(|(key, value)| {
                    b.fields()
                        .get(key)
                        .map(|other| values_equal(value, other))
                        .unwrap_or(false)
                })
        }
        _ => false,
    }
}

/// Total order over all values: first by [`TypeOrder`], then by the
/// type-specific comparator. Integers and doubles compare numerically; NaN
/// sorts before every other number.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_type = type_order(left);
    let right_type = type_order(right);
    if left_type != right_type {
        return left_type.cmp(&right_type);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => compare_references(a, b),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.cmp(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => compare_arrays(a, b),
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            if left_type == TypeOrder::ServerTimestamp {
                compare_server_timestamps(a, b)
            } else {
                compare_maps(a, b)
            }
        }
        _ => compare_numbers(left, right),
    }
}

fn compare_numbers(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    match (left.kind(), right.kind()) {
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_mixed(*a, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_mixed(*b, *a).reverse(),
        _ => Ordering::Equal,
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        // -0.0 and 0.0 compare equal here.
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    // Values beyond the exactly representable range are compared as doubles.
    if double < -9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    if double >= 9_223_372_036_854_775_808.0 {
        return Ordering::Less;
    }
    let truncated = double.trunc() as i64;
    match integer.cmp(&truncated) {
        Ordering::Equal => compare_doubles(0.0, double - double.trunc()),
        other => other,
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let mut left_segments = left.split('/');
    let mut right_segments = right.split('/');
    loop {
        match (left_segments.next(), right_segments.next()) {
            (Some(l), Some(r)) => match l.cmp(r) {
                Ordering::Equal => continue,
                other => return other,
            },
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
        }
    }
}

fn compare_arrays(left: &ArrayValue, right: &ArrayValue) -> Ordering {
    for (l, r) in left.values().iter().zip(right.values().iter()) {
        match compare_values(l, r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    left.values().len().cmp(&right.values().len())
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    let mut left_iter = left.fields().iter();
    let mut right_iter = right.fields().iter();
    loop {
        match (left_iter.next(), right_iter.next()) {
            (Some((lk, lv)), Some((rk, rv))) => {
                let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
        }
    }
}

fn compare_server_timestamps(left: &MapValue, right: &MapValue) -> Ordering {
    let left_time = local_write_time(left).unwrap_or(Timestamp::new(0, 0));
    let right_time = local_write_time(right).unwrap_or(Timestamp::new(0, 0));
    left_time.cmp(&right_time)
}

/// Stable string form of a value, used to build canonical target ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &FirestoreValue, out: &mut String) {
    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        ValueKind::Integer(i) => out.push_str(&i.to_string()),
        ValueKind::Double(d) => out.push_str(&format_double(*d)),
        ValueKind::Timestamp(t) => out.push_str(&format!("time({},{})", t.seconds, t.nanos)),
        ValueKind::String(s) => out.push_str(s),
        ValueKind::Bytes(b) => out.push_str(&b.to_base64()),
        ValueKind::Reference(r) => out.push_str(r),
        ValueKind::GeoPoint(g) => out.push_str(&format!(
            "geo({},{})",
            format_double(g.latitude()),
            format_double(g.longitude())
        )),
        ValueKind::Array(array) => {
            out.push('[');
            for (index, element) in array.values().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(element, out);
            }
            out.push(']');
        }
        ValueKind::Map(map) => {
            out.push('{');
            for (index, (key, element)) in map.fields().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical(element, out);
            }
            out.push('}');
        }
    }
}

fn format_double(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == 0.0 && value.is_sign_negative() {
        "-0".to_string()
    } else {
        format!("{value}")
    }
}
