use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, MaybeDocument, Mutation, MutationResult, SnapshotVersion, Timestamp,
};

/// Sentinel batch id meaning "no batch"; real ids start at 1.
pub const BATCH_ID_UNKNOWN: i32 = -1;

/// A group of mutations written atomically by one user call.
///
/// `base_mutations` hold the values non-idempotent transforms started from
/// when the batch was written; they are applied to the local view only and
/// are never sent to the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: i32,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    /// Applies the acknowledged writes for `key` on top of the remote document.
    pub fn apply_to_remote_document(
        &self,
        key: &DocumentKey,
        maybe_doc: Option<MaybeDocument>,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        if let Some(doc) = &maybe_doc {
            if doc.key() != key {
                return Err(internal_error(format!(
                    "apply_to_remote_document: key {key} does not match document key {}",
                    doc.key()
                )));
            }
        }
        let mut current = maybe_doc;
        for (mutation, result) in self
            .mutations
            .iter()
            .zip(batch_result.mutation_results.iter())
        {
            if mutation.key() == key {
                current = Some(mutation.apply_to_remote_document(current, result)?);
            }
        }
        Ok(current)
    }

    /// Computes the latency-compensated view of `key` after this batch.
    pub fn apply_to_local_view(
        &self,
        key: &DocumentKey,
        maybe_doc: Option<MaybeDocument>,
    ) -> Option<MaybeDocument> {
        let mut current = maybe_doc;
        for mutation in self.base_mutations.iter().filter(|m| m.key() == key) {
            let base = current.clone();
            current = mutation.apply_to_local_view(current, base.as_ref(), self.local_write_time);
        }

        let base_doc = current.clone();
        for mutation in self.mutations.iter().filter(|m| m.key() == key) {
            current =
                mutation.apply_to_local_view(current, base_doc.as_ref(), self.local_write_time);
        }
        current
    }

    /// Applies the batch to every document it touches in `docs`.
    pub fn apply_to_local_document_set(
        &self,
        docs: &mut BTreeMap<DocumentKey, Option<MaybeDocument>>,
    ) {
        for key in self.keys() {
            let existing = docs.get(&key).cloned().flatten();
            let updated = self.apply_to_local_view(&key, existing);
            docs.insert(key, updated);
        }
    }
}

/// A mutation batch together with the backend's acknowledgement.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each written document reached; transforms report the commit
    /// version, everything else the per-write update time.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{
        Document, FieldPath, FieldTransform, TransformOperation,
    };
    use crate::firestore::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(field: &str, value: i64) -> MapValue {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), FirestoreValue::from_integer(value));
        MapValue::new(fields)
    }

    #[test]
    fn local_view_applies_only_matching_mutations() {
        let batch = MutationBatch::new(
            1,
            Timestamp::new(1, 0),
            Vec::new(),
            vec![
                Mutation::set(key("c/a"), data("v", 1)),
                Mutation::set(key("c/b"), data("v", 2)),
            ],
        );
        let view = batch.apply_to_local_view(&key("c/a"), None).unwrap();
        assert_eq!(view.as_document().unwrap().data(), &data("v", 1));
        assert_eq!(batch.keys().len(), 2);
    }

    #[test]
    fn base_mutations_seed_increment() {
        let field = FieldPath::from_dot_separated("n").unwrap();
        let batch = MutationBatch::new(
            1,
            Timestamp::new(1, 0),
            vec![Mutation::patch(key("c/a"), data("n", 10))],
            vec![Mutation::transform(
                key("c/a"),
                vec![FieldTransform::new(
                    field.clone(),
                    TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)),
                )],
            )],
        );
        let remote: MaybeDocument = Document::new(
            key("c/a"),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data("n", 3),
        )
        .into();
        let view = batch.apply_to_local_view(&key("c/a"), Some(remote)).unwrap();
        assert_eq!(
            view.as_document().unwrap().field(&field),
            Some(&FirestoreValue::from_integer(11))
        );
    }

    #[test]
    fn result_requires_matching_counts() {
        let batch = MutationBatch::new(
            3,
            Timestamp::new(1, 0),
            Vec::new(),
            vec![Mutation::delete(key("c/a"))],
        );
        assert!(MutationBatchResult::from(batch, SnapshotVersion::min(), Vec::new(), Vec::new()).is_err());
    }
}
