use crate::firestore::core::listen_sequence::ListenSequenceNumber;
use crate::firestore::core::target::Target;
use crate::firestore::core::types::TargetId;
use crate::firestore::model::SnapshotVersion;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TargetPurpose {
    /// A user listen.
    Listen,
    /// A re-listen after an existence filter mismatch; sent without a resume
    /// token.
    ExistenceFilterMismatch,
    /// A single-document target resolving a limbo document.
    LimboResolution,
}

/// Everything the client knows about an active or cached target.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Version of the last remote event that included this target.
    pub snapshot_version: SnapshotVersion,
    /// Version at which the target's result set was last free of limbo
    /// documents; the query engine only trusts cached results up to here.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque watch cursor. Empty means "no token".
    pub resume_token: Vec<u8>,
    /// Number of documents the client believes match when resuming; lets
    /// the backend detect a stale cache. Never persisted.
    pub expected_count: Option<usize>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: usize) -> Self {
        Self {
            expected_count: Some(expected_count),
            ..self.clone()
        }
    }

    pub fn with_purpose(&self, purpose: TargetPurpose) -> Self {
        Self {
            purpose,
            ..self.clone()
        }
    }
}
