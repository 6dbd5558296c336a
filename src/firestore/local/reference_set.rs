use std::collections::BTreeSet;

use crate::firestore::model::DocumentKey;

/// Document references held by ids (target ids or batch ids), indexed both
/// ways so either side can be released in one call.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_key.insert((key.clone(), id));
        self.by_id.insert((id, key.clone()));
    }

    pub fn add_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key, id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_key.remove(&(key.clone(), id));
        self.by_id.remove(&(id, key.clone()));
    }

    pub fn remove_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the released keys.
    pub fn remove_references_for_id(&mut self, id: i32) -> BTreeSet<DocumentKey> {
        let released = self.references_for_id(id);
        for key in &released {
            self.remove_reference(key, id);
        }
        released
    }

    pub fn remove_all_references(&mut self) -> BTreeSet<DocumentKey> {
        let released = self.by_key.iter().map(|(key, _)| key.clone()).collect();
        self.by_key.clear();
        self.by_id.clear();
        released
    }

    pub fn references_for_id(&self, id: i32) -> BTreeSet<DocumentKey> {
        self.by_id
            .iter()
            .skip_while(|(entry_id, _)| *entry_id < id)
            .take_while(|(entry_id, _)| *entry_id == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .iter()
            .skip_while(|(entry_key, _)| entry_key < key)
            .take_while(|(entry_key, _)| entry_key == key)
            .next()
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::test_support::key;

    #[test]
    fn references_are_released_per_id() {
        let mut references = ReferenceSet::new();
        references.add_references([&key("rooms/a"), &key("rooms/b")], 1);
        references.add_reference(&key("rooms/a"), 2);

        assert!(references.contains_key(&key("rooms/a")));
        assert_eq!(references.references_for_id(2), [key("rooms/a")].into_iter().collect());

        let released = references.remove_references_for_id(1);
        assert_eq!(released.len(), 2);
        assert!(references.contains_key(&key("rooms/a")));
        assert!(!references.contains_key(&key("rooms/b")));

        references.remove_reference(&key("rooms/a"), 2);
        assert!(references.is_empty());
    }
}
