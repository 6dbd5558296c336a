use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::types::TargetId;
use crate::firestore::model::{DocumentKey, MaybeDocument, SnapshotVersion};

/// Aggregated result of applying a batch of watch responses, up to one
/// consistent global snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match; they are re-listened
    /// without a resume token.
    pub target_mismatches: BTreeSet<TargetId>,
    pub document_updates: BTreeMap<DocumentKey, MaybeDocument>,
    /// Documents that only limbo-resolution targets touched.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    /// Event marking `target_id` as (not) current without any document
    /// changes; used by secondary clients replaying the primary's state.
    pub fn synthesized_for_current_change(target_id: TargetId, current: bool) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(
            target_id,
            TargetChange::synthesized_for_current_change(current),
        );
        Self {
            snapshot_version: SnapshotVersion::min(),
            target_changes,
            target_mismatches: BTreeSet::new(),
            document_updates: BTreeMap::new(),
            resolved_limbo_documents: BTreeSet::new(),
        }
    }
}

/// Per-target membership delta of a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the backend sent no new token.
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn synthesized_for_current_change(current: bool) -> Self {
        Self {
            current,
            ..Self::default()
        }
    }

    pub fn change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}
