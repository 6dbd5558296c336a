use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::model::{Document, DocumentKey, DocumentSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeType {
    Removed,
    Added,
    Modified,
    /// Only the document's metadata (pending writes) changed.
    Metadata,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub doc: Document,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, doc: Document) -> Self {
        Self { change_type, doc }
    }
}

/// Collapses successive changes to the same document into one.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.doc.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => {
                Some(DocumentViewChange::new(old_type, change.doc))
            }
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.doc)),
            (Added, Modified) => Some(DocumentViewChange::new(Added, change.doc)),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange::new(Removed, old.doc.clone())),
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.doc)),
            (old_type, new_type) => {
                log::error!(
                    "unsupported document change combination {old_type:?} -> {new_type:?} for {key}"
                );
                Some(change)
            }
        };

        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Synced,
}

/// One raised result set of a query together with what changed since the
/// previous one.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
}

impl ViewSnapshot {
    /// Snapshot presenting every document as newly added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
    ) -> Self {
        let doc_changes = documents
            .iter()
            .map(|doc| DocumentViewChange::new(ChangeType::Added, doc.clone()))
            .collect();
        let old_docs = DocumentSet::new(documents.comparator());
        Self {
            query,
            docs: documents,
            old_docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}
