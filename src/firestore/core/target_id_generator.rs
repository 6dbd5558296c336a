use crate::firestore::core::types::TargetId;

const RESERVED_BITS: TargetId = 1;

/// Hands out target ids in two disjoint spaces: even ids for targets stored
/// in the target cache, odd ids for the sync engine's limbo resolution
/// targets, which are never persisted.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    /// Generator continuing after `highest_target_id`, the largest id the
    /// target cache has handed out so far.
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        Self {
            last_id: highest_target_id,
        }
    }

    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    pub fn next(&mut self) -> TargetId {
        self.last_id += 1 << RESERVED_BITS;
        self.last_id
    }
}
