//! Local representation of a pending server timestamp.
//!
//! Until the backend acknowledges the write, a `serverTimestamp()` transform is
//! stored as a map with a reserved `__type__` marker, the local write time and
//! the value the field held before the write.

use std::collections::BTreeMap;

use crate::firestore::model::Timestamp;
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

const TYPE_KEY: &str = "__type__";
const SERVER_TIMESTAMP_SENTINEL: &str = "server_timestamp";
const LOCAL_WRITE_TIME_KEY: &str = "__local_write_time__";
const PREVIOUS_VALUE_KEY: &str = "__previous_value__";

pub fn server_timestamp_value(
    local_write_time: Timestamp,
    previous_value: Option<FirestoreValue>,
) -> FirestoreValue {
    let mut fields = BTreeMap::new();
    fields.insert(
        TYPE_KEY.to_string(),
        FirestoreValue::from_string(SERVER_TIMESTAMP_SENTINEL),
    );
    fields.insert(
        LOCAL_WRITE_TIME_KEY.to_string(),
        FirestoreValue::from_timestamp(local_write_time),
    );
    // Nested pending timestamps collapse to the oldest real previous value.
    let previous_value = previous_value.and_then(|value| match value.kind() {
        ValueKind::Map(map) if is_server_timestamp(map) => previous_value_of(map).cloned(),
        _ => Some(value),
    });
    if let Some(previous) = previous_value {
        fields.insert(PREVIOUS_VALUE_KEY.to_string(), previous);
    }
    FirestoreValue::from_map(fields)
}

pub fn is_server_timestamp(map: &MapValue) -> bool {
    map.fields()
        .get(TYPE_KEY)
        .and_then(FirestoreValue::as_str)
        .map(|value| value == SERVER_TIMESTAMP_SENTINEL)
        .unwrap_or(false)
}

pub fn is_server_timestamp_value(value: &FirestoreValue) -> bool {
    value.as_map().map(is_server_timestamp).unwrap_or(false)
}

pub fn local_write_time(map: &MapValue) -> Option<Timestamp> {
    map.fields()
        .get(LOCAL_WRITE_TIME_KEY)
        .and_then(FirestoreValue::as_timestamp)
}

pub fn previous_value_of(map: &MapValue) -> Option<&FirestoreValue> {
    map.fields().get(PREVIOUS_VALUE_KEY)
}
