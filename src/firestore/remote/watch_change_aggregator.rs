use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::firestore::core::types::TargetId;
use crate::firestore::core::view_snapshot::ChangeType;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{DocumentKey, MaybeDocument, NoDocument, SnapshotVersion};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, WatchTargetChange,
};

/// What the aggregator needs to know about targets it does not own: which
/// documents the client already associates with a target, and the target's
/// metadata while it is being listened to.
pub trait TargetMetadataProvider: Send + Sync {
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// `None` once the target is no longer listened to.
    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

/// Accumulates watch changes between two global snapshots.
#[derive(Debug)]
struct TargetState {
    /// Add/remove requests sent but not yet acknowledged. Changes for a
    /// target with pending responses are ignored.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    /// Starts out true so the first snapshot always reports the target.
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => change.added_documents.insert(key.clone()),
                ChangeType::Modified | ChangeType::Metadata => {
                    change.modified_documents.insert(key.clone())
                }
                ChangeType::Removed => change.removed_documents.insert(key.clone()),
            };
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Turns the stream of watch changes into [`RemoteEvent`]s, one per
/// consistent global snapshot.
pub struct WatchChangeAggregator {
    metadata: Arc<dyn TargetMetadataProvider>,
    target_states: HashMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MaybeDocument>,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeSet<TargetId>,
}

impl WatchChangeAggregator {
    pub fn new(metadata: Arc<dyn TargetMetadataProvider>) -> Self {
        Self {
            metadata,
            target_states: HashMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeSet::new(),
        }
    }

    pub fn handle_document_change(&mut self, change: DocumentWatchChange) {
        for target_id in &change.updated_target_ids {
            match &change.new_doc {
                Some(MaybeDocument::Document(doc)) => {
                    self.add_document_to_target(*target_id, MaybeDocument::Document(doc.clone()))
                }
                other => self.remove_document_from_target(*target_id, &change.key, other.clone()),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, &change.key, change.new_doc.clone());
        }
    }

    pub fn handle_target_change(&mut self, change: &WatchTargetChange) {
        for target_id in self.affected_targets(change) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        // A fresh add; anything accumulated belonged to an
                        // earlier incarnation of the target.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id) {
                        self.reset_target(target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn affected_targets(&self, change: &WatchTargetChange) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        let mut ids: Vec<TargetId> = self
            .target_states
            .keys()
            .copied()
            .filter(|id| self.is_active_target(*id))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Compares the backend's document count with the client's. A mismatch
    /// resets the target and flags it for a re-listen without resume token.
    pub fn handle_existence_filter(&mut self, change: ExistenceFilterChange) {
        let target_id = change.target_id;
        let Some(target_data) = self.target_data_for_active_target(target_id) else {
            return;
        };

        if target_data.target.is_document_target() {
            if change.count == 0 {
                // The document is gone. Synthesize a delete so limbo
                // resolution sees a definitive answer.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let deleted = NoDocument::new(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(target_id, &key, Some(deleted.into()));
                }
            } else if change.count != 1 {
                log::error!(
                    "single document existence filter for target {target_id} reported count {}",
                    change.count
                );
            }
        } else if self.current_document_count_for_target(target_id) != change.count {
            log::debug!(
                "existence filter mismatch for target {target_id}; expected {} documents",
                change.count
            );
            self.reset_target(target_id);
            self.pending_target_resets.insert(target_id);
        }
    }

    /// Converts everything accumulated so far into a remote event at
    /// `snapshot_version` and starts a new accumulation.
    pub fn create_remote_event(&mut self, snapshot_version: SnapshotVersion) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();

        let mut target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        target_ids.sort_unstable();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);

            if current && target_data.target.is_document_target() {
                // A current document target without the document means the
                // document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(target_id, &key)
                    {
                        let deleted = NoDocument::new(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(deleted.into()));
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let event = RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates: std::mem::take(&mut self.pending_document_updates),
            resolved_limbo_documents,
        };
        self.pending_document_target_mapping.clear();
        event
    }

    /// Counts a request whose acknowledgement (an Added or Removed target
    /// change) is still outstanding.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target(&mut self, target_id: TargetId, doc: MaybeDocument) {
        if !self.is_active_target(target_id) {
            return;
        }
        let key = doc.key().clone();
        let change_type = if self.target_contains_document(target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), doc);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// `updated` is `None` when only the membership changed.
    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated: Option<MaybeDocument>,
    ) {
        if !self.is_active_target(target_id) {
            return;
        }
        let contained = self.target_contains_document(target_id, key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Entered and left before a snapshot was raised.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(doc) = updated {
            self.pending_document_updates.insert(key.clone(), doc);
        }
    }

    fn current_document_count_for_target(&mut self, target_id: TargetId) -> usize {
        let change = self.ensure_target_state(target_id).to_target_change();
        let remote = self.metadata.remote_keys_for_target(target_id).len();
        (remote + change.added_documents.len()).saturating_sub(change.removed_documents.len())
    }

    /// Drops accumulated changes and synthesizes removals for every
    /// document the client associates with the target; watch re-adds the
    /// ones that still match before the next snapshot.
    fn reset_target(&mut self, target_id: TargetId) {
        self.target_states.insert(target_id, TargetState::new());
        for key in self.metadata.remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None);
        }
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, target_id: TargetId) -> bool {
        let active = self.target_data_for_active_target(target_id).is_some();
        if !active {
            log::debug!("detected inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target(&self, target_id: TargetId) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => self.metadata.target_data_for_target(target_id),
        }
    }

    fn target_contains_document(&self, target_id: TargetId, key: &DocumentKey) -> bool {
        self.metadata.remote_keys_for_target(target_id).contains(key)
    }
}
