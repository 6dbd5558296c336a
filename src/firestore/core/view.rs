use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::firestore::core::types::OnlineState;
use crate::firestore::local::local_store::QueryResult;
use crate::firestore::model::{Document, DocumentKey, DocumentSet, MaybeDocument};
use crate::firestore::remote::remote_event::TargetChange;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimboChangeType {
    Added,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimboDocumentChange {
    pub change_type: LimboChangeType,
    pub key: DocumentKey,
}

impl LimboDocumentChange {
    fn added(key: DocumentKey) -> Self {
        Self {
            change_type: LimboChangeType::Added,
            key,
        }
    }

    fn removed(key: DocumentKey) -> Self {
        Self {
            change_type: LimboChangeType::Removed,
            key,
        }
    }
}

/// Result of [`View::compute_doc_changes`], not yet applied to the view.
#[derive(Clone)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    pub mutated_keys: BTreeSet<DocumentKey>,
    /// Set when a limit query dropped a document it cannot replace from the
    /// given changes alone; the caller must rerun the query against the
    /// local store and compute again.
    pub needs_refill: bool,
}

#[derive(Clone, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Client-side result set of one query.
///
/// Tracks which documents the backend confirmed for the target (`synced`)
/// and which ones the client only believes are in the result (limbo).
pub struct View {
    query: Query,
    current: bool,
    document_set: DocumentSet,
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
    sync_state: Option<SyncState>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let document_set = DocumentSet::new(query.comparator());
        Self {
            query,
            current: false,
            document_set,
            synced_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
            sync_state: None,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    /// Diffs `doc_changes` against the view, or against `previous` when
    /// recomputing after a refill.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &BTreeMap<DocumentKey, MaybeDocument>,
        previous: Option<&ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let mut change_set = previous
            .map(|previous| previous.change_set.clone())
            .unwrap_or_default();
        let old_document_set = previous
            .map(|previous| &previous.document_set)
            .unwrap_or(&self.document_set);
        let mut mutated_keys = previous
            .map(|previous| previous.mutated_keys.clone())
            .unwrap_or_else(|| self.mutated_keys.clone());
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit().map(|limit| limit as usize);
        let limit_is_full = limit == Some(old_document_set.len());
        let last_doc_in_limit = if self.query.has_limit_to_first() && limit_is_full {
            old_document_set.last().cloned()
        } else {
            None
        };
        let first_doc_in_limit = if self.query.has_limit_to_last() && limit_is_full {
            old_document_set.first().cloned()
        } else {
            None
        };
        let comparator = self.query.comparator();

        for (key, entry) in doc_changes {
            let old_doc = old_document_set.get(key);
            let new_doc = entry
                .as_document()
                .filter(|doc| self.query.matches(doc))
                .cloned();

            let old_doc_had_pending_mutations =
                old_doc.is_some() && self.mutated_keys.contains(key);
            let new_doc_has_pending_mutations = new_doc.as_ref().is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(key) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, &new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !Self::should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange::new(
                                ChangeType::Modified,
                                new_doc.clone(),
                            ));
                            change_applied = true;

                            let past_last = last_doc_in_limit.as_ref().is_some_and(|last| {
                                comparator(new_doc, last) == Ordering::Greater
                            });
                            let before_first = first_doc_in_limit.as_ref().is_some_and(|first| {
                                comparator(new_doc, first) == Ordering::Less
                            });
                            if past_last || before_first {
                                // The document moved outside the limit; another
                                // one may belong in its place.
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange::new(
                            ChangeType::Metadata,
                            new_doc.clone(),
                        ));
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new_doc.clone()));
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old_doc.clone()));
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        if new_doc_has_pending_mutations {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                        document_set.add(new_doc);
                    }
                    None => {
                        document_set.delete(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let overflow = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(overflow) = overflow else {
                    break;
                };
                document_set.delete(overflow.key());
                mutated_keys.remove(overflow.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, overflow));
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        }
    }

    /// A locally committed document is held back until the backend's
    /// version arrives, so the view does not flicker between the latency
    /// compensated and the acknowledged value.
    fn should_wait_for_synced_document(old_doc: &Document, new_doc: &Document) -> bool {
        old_doc.has_local_mutations()
            && new_doc.has_committed_mutations()
            && !new_doc.has_local_mutations()
    }

    /// Applies computed changes and raises a snapshot if anything visible
    /// changed. `target_change` carries the backend's membership updates.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let comparator = self.query.comparator();
        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            change_type_order(left.change_type)
                .cmp(&change_type_order(right.change_type))
                .then_with(|| comparator(&left.doc, &right.doc))
        });

        if let Some(target_change) = target_change {
            self.apply_target_change(target_change);
        }
        let limbo_changes = if update_limbo_documents {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                docs: self.document_set.clone(),
                old_docs,
                doc_changes: changes,
                mutated_keys: self.mutated_keys.clone(),
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
            }),
            limbo_changes,
        }
    }

    /// Going offline makes a current view stale: it raises a `from_cache`
    /// snapshot with no document changes.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            self.apply_changes(unchanged, false, None)
        } else {
            ViewChange::default()
        }
    }

    /// Resets the synced keys from storage and diffs the stored result
    /// against the view. Used when another client changed the target.
    pub fn synchronize_with_persisted_state(&mut self, query_result: QueryResult) -> ViewChange {
        self.synced_documents = query_result.remote_keys;
        self.limbo_documents.clear();
        let documents = query_result
            .documents
            .into_iter()
            .map(|(key, doc)| (key, MaybeDocument::from(doc)))
            .collect();
        let doc_changes = self.compute_doc_changes(&documents, None);
        self.apply_changes(doc_changes, true, None)
    }

    /// Snapshot of the established view as if it was just listened to.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
        )
    }

    fn apply_target_change(&mut self, target_change: &TargetChange) {
        for key in &target_change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &target_change.modified_documents {
            debug_assert!(
                self.synced_documents.contains(key),
                "modified document {key} is not synced"
            );
        }
        for key in &target_change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = target_change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let new_limbo: BTreeSet<DocumentKey> = self
            .document_set
            .iter()
            .filter(|doc| self.should_be_in_limbo(doc))
            .map(|doc| doc.key().clone())
            .collect();
        let old_limbo = std::mem::replace(&mut self.limbo_documents, new_limbo);

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::added),
        );
        changes
    }

    fn should_be_in_limbo(&self, doc: &Document) -> bool {
        // Documents the backend reported, or that only exist through local
        // writes, are never in limbo.
        !self.synced_documents.contains(doc.key()) && !doc.has_local_mutations()
    }
}

fn change_type_order(change_type: ChangeType) -> u8 {
    match change_type {
        ChangeType::Removed => 0,
        ChangeType::Added => 1,
        ChangeType::Modified | ChangeType::Metadata => 2,
    }
}
