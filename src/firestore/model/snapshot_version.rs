use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::model::Timestamp;

/// Version of a document or of a consistent backend snapshot.
///
/// `SnapshotVersion::min()` stands for "never synced" and sorts before every
/// real version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    pub fn min() -> Self {
        Self {
            timestamp: Timestamp::new(0, 0),
        }
    }

    /// Sentinel used by the LRU collector's comparisons and by the read-time
    /// index when a range must include everything.
    pub fn max() -> Self {
        Self {
            timestamp: Timestamp::new(253_402_300_799, 999_999_999),
        }
    }

    pub fn from_micros(micros: i64) -> Self {
        let seconds = micros.div_euclid(1_000_000);
        let nanos = (micros.rem_euclid(1_000_000) * 1_000) as i32;
        Self::new(Timestamp::new(seconds, nanos))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn to_micros(&self) -> i64 {
        self.timestamp.to_micros()
    }
}

impl Default for SnapshotVersion {
    fn default() -> Self {
        Self::min()
    }
}

impl From<Timestamp> for SnapshotVersion {
    fn from(timestamp: Timestamp) -> Self {
        Self::new(timestamp)
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({})", self.timestamp)
    }
}
