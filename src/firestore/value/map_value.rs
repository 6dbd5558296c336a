use std::collections::BTreeMap;

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Map of field name to value; also used as the root "object value" holding a
/// document's data.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Looks up a nested field. Intermediate segments must be maps.
    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            match current.kind() {
                ValueKind::Map(map) => current = map.fields.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Writes `value` at `path`, replacing any non-map intermediate value with
    /// a fresh map.
    pub fn set_field(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_at_segments(&mut self.fields, path.segments(), value);
    }

    /// Removes the value at `path` if present. Parent maps are kept even when
    /// they become empty.
    pub fn delete_field(&mut self, path: &FieldPath) {
        delete_at_segments(&mut self.fields, path.segments());
    }

    /// Applies a batch of writes where `None` deletes the field.
    pub fn set_all(&mut self, updates: impl IntoIterator<Item = (FieldPath, Option<FirestoreValue>)>) {
        for (path, value) in updates {
            match value {
                Some(value) => self.set_field(&path, value),
                None => self.delete_field(&path),
            }
        }
    }

    /// Returns every leaf field path, treating empty maps as leaves.
    pub fn leaf_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, &[], &mut paths);
        paths
    }
}

fn set_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let mut child = match fields.remove(first).map(FirestoreValue::into_kind) {
        Some(ValueKind::Map(map)) => map.into_fields(),
        _ => BTreeMap::new(),
    };
    set_at_segments(&mut child, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn delete_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    if let Some(ValueKind::Map(_)) = fields.get(first).map(FirestoreValue::kind) {
        if let Some(ValueKind::Map(map)) = fields.remove(first).map(FirestoreValue::into_kind) {
            let mut child = map.into_fields();
            delete_at_segments(&mut child, rest);
            fields.insert(first.clone(), FirestoreValue::from_map(child));
        }
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &[String],
    out: &mut Vec<FieldPath>,
) {
    for (name, value) in fields {
        let mut segments = prefix.to_vec();
        segments.push(name.clone());
        match value.kind() {
            ValueKind::Map(map) if !map.is_empty() => collect_leaf_paths(&map.fields, &segments, out),
            _ => {
                if let Ok(path) = FieldPath::new(segments) {
                    out.push(path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn stores_map_entries() {
        let mut map = BTreeMap::new();
        map.insert("foo".to_string(), FirestoreValue::from_integer(1));
        let value = MapValue::new(map.clone());
        assert_eq!(value.fields().get("foo"), map.get("foo"));
    }

    #[test]
    fn sets_nested_fields() {
        let mut map = MapValue::empty();
        map.set_field(&path("a.b.c"), FirestoreValue::from_integer(1));
        map.set_field(&path("a.d"), FirestoreValue::from_bool(true));
        assert_eq!(map.field(&path("a.b.c")), Some(&FirestoreValue::from_integer(1)));
        assert_eq!(map.field(&path("a.d")), Some(&FirestoreValue::from_bool(true)));
        assert_eq!(map.leaf_paths(), vec![path("a.b.c"), path("a.d")]);
    }

    #[test]
    fn overwrites_scalar_with_map() {
        let mut map = MapValue::empty();
        map.set_field(&path("a"), FirestoreValue::from_integer(1));
        map.set_field(&path("a.b"), FirestoreValue::from_integer(2));
        assert_eq!(map.field(&path("a.b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn deletes_nested_fields() {
        let mut map = MapValue::empty();
        map.set_field(&path("a.b"), FirestoreValue::from_integer(1));
        map.set_field(&path("a.c"), FirestoreValue::from_integer(2));
        map.delete_field(&path("a.b"));
        map.delete_field(&path("missing.path"));
        assert!(map.field(&path("a.b")).is_none());
        assert_eq!(map.field(&path("a.c")), Some(&FirestoreValue::from_integer(2)));
    }
}
