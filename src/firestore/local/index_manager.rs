use serde::{Deserialize, Serialize};

use crate::firestore::error::FirestoreResult;
use crate::firestore::local::kv_store::{composite_key, KvTransaction, COLLECTION_PARENTS, KEY_SEPARATOR};
use crate::firestore::local::local_serializer::{decode_path, encode_path};
use crate::firestore::model::ResourcePath;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DbCollectionParent {
    collection_id: String,
    parent: String,
}

/// Remembers every parent path under which a collection id was seen, so
/// collection group queries can be expanded into collection queries.
#[derive(Clone, Debug, Default)]
pub struct IndexManager;

impl IndexManager {
    pub fn new() -> Self {
        Self
    }

    /// Records the parent of `collection_path`. Paths of even length are
    /// document paths and are ignored.
    pub fn add_to_collection_parent_index(
        &self,
        txn: &mut KvTransaction<'_>,
        collection_path: &ResourcePath,
    ) -> FirestoreResult<()> {
        if collection_path.len() % 2 != 1 {
            return Ok(());
        }
        let Some(collection_id) = collection_path.last_segment() else {
            return Ok(());
        };
        let parent = encode_path(&collection_path.without_last());
        let row_key = composite_key([collection_id, parent.as_str()]);
        if txn.contains(COLLECTION_PARENTS, &row_key) {
            return Ok(());
        }
        txn.put(
            COLLECTION_PARENTS,
            row_key,
            &DbCollectionParent {
                collection_id: collection_id.to_string(),
                parent,
            },
        )
    }

    /// Parent paths of every collection named `collection_id`, in path order.
    pub fn get_collection_parents(
        &self,
        txn: &KvTransaction<'_>,
        collection_id: &str,
    ) -> FirestoreResult<Vec<ResourcePath>> {
        let mut prefix = collection_id.to_string();
        prefix.push(KEY_SEPARATOR);
        Ok(txn
            .scan_prefix::<DbCollectionParent>(COLLECTION_PARENTS, &prefix)?
            .into_iter()
            .map(|(_, row)| decode_path(&row.parent))
            .collect())
    }
}
