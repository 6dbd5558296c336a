use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::firestore::error::{failed_precondition, not_found, FirestoreResult};
use crate::firestore::model::{
    Document, DocumentKey, MaybeDocument, Mutation, MutationResult, NoDocument, Precondition,
    SnapshotVersion, TransformOperation,
};
use crate::firestore::value::{FirestoreValue, MapValue};

use super::Datastore;

#[derive(Default)]
struct BackendState {
    documents: BTreeMap<DocumentKey, Document>,
    last_version_micros: i64,
}

/// Backend simulation answering lookups and commits from memory with the
/// backend's precondition rules. Used for transactions without a server.
#[derive(Clone, Default)]
pub struct InMemoryDatastore {
    state: Arc<Mutex<BackendState>>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn document(&self, key: &DocumentKey) -> Option<Document> {
        self.lock().documents.get(key).cloned()
    }

    /// Writes a document as if another client had committed it.
    pub fn put_document(&self, key: DocumentKey, data: MapValue) -> SnapshotVersion {
        let mut state = self.lock();
        let version = next_version(&mut state);
        state
            .documents
            .insert(key.clone(), Document::new(key, version, data));
        version
    }
}

fn next_version(state: &mut BackendState) -> SnapshotVersion {
    let now = chrono::Utc::now().timestamp_micros();
    state.last_version_micros = now.max(state.last_version_micros + 1);
    SnapshotVersion::from_micros(state.last_version_micros)
}

fn server_transform_results(
    mutation: &Mutation,
    current: Option<&Document>,
    commit_version: SnapshotVersion,
) -> Option<Vec<FirestoreValue>> {
    let Mutation::Transform {
        field_transforms, ..
    } = mutation
    else {
        return None;
    };
    Some(
        field_transforms
            .iter()
            .map(|transform| {
                let previous = current.and_then(|doc| doc.field(transform.field()));
                match transform.operation() {
                    TransformOperation::ServerTimestamp => {
                        FirestoreValue::from_timestamp(commit_version.timestamp())
                    }
                    operation => operation.apply_to_local_view(previous, commit_version.timestamp()),
                }
            })
            .collect(),
    )
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Datastore for InMemoryDatastore {
    async fn lookup(&self, keys: Vec<DocumentKey>) -> FirestoreResult<Vec<MaybeDocument>> {
        let mut state = self.lock();
        let read_time = next_version(&mut state);
        Ok(keys
            .into_iter()
            .map(|key| match state.documents.get(&key) {
                Some(doc) => doc.clone().into(),
                None => NoDocument::new(key, read_time).into(),
            })
            .collect())
    }

    async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<Vec<MutationResult>> {
        let mut state = self.lock();
        let commit_version = next_version(&mut state);
        let mut documents = state.documents.clone();
        let mut results = Vec::with_capacity(mutations.len());

        for mutation in &mutations {
            let key = mutation.key().clone();
            let current: Option<MaybeDocument> = documents.get(&key).cloned().map(Into::into);
            let precondition = mutation.precondition();
            if !precondition.is_valid_for(current.as_ref()) {
                return Err(match (mutation, &precondition) {
                    (Mutation::Patch { .. }, Precondition::Exists(true)) => {
                        not_found(format!("No document to update: {key}"))
                    }
                    _ => failed_precondition(format!("Precondition failed for {key}")),
                });
            }
            if let Mutation::Verify { .. } = mutation {
                results.push(MutationResult::new(commit_version, None));
                continue;
            }

            let transform_results = server_transform_results(
                mutation,
                current.as_ref().and_then(MaybeDocument::as_document),
                commit_version,
            );
            let result = MutationResult::new(commit_version, transform_results);
            match mutation.apply_to_remote_document(current, &result)? {
                MaybeDocument::Document(doc) => {
                    documents.insert(key.clone(), Document::new(key, commit_version, doc.into_data()));
                }
                _ => {
                    documents.remove(&key);
                }
            }
            results.push(result);
        }

        state.documents = documents;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::FieldTransform;
    use crate::firestore::test_support::{field, key, map};

    #[tokio::test]
    async fn commit_then_lookup() {
        let datastore = InMemoryDatastore::new();
        let results = datastore
            .commit(vec![Mutation::set(key("rooms/a"), map(&[("n", 1i64.into())]))])
            .await
            .unwrap();
        assert_eq!(results.len(), 1);

        let docs = datastore
            .lookup(vec![key("rooms/a"), key("rooms/b")])
            .await
            .unwrap();
        let found = docs[0].as_document().unwrap();
        assert_eq!(found.field(&field("n")), Some(&1i64.into()));
        assert_eq!(found.version(), results[0].version);
        assert!(docs[1].is_no_document());
    }

    #[tokio::test]
    async fn failed_precondition_rolls_back_whole_commit() {
        let datastore = InMemoryDatastore::new();
        let err = datastore
            .commit(vec![
                Mutation::set(key("rooms/a"), map(&[])),
                Mutation::patch(key("rooms/missing"), map(&[("n", 1i64.into())])),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::NotFound);
        assert!(datastore.document(&key("rooms/a")).is_none());
    }

    #[tokio::test]
    async fn verify_checks_update_time() {
        let datastore = InMemoryDatastore::new();
        let version = datastore.put_document(key("rooms/a"), map(&[]));
        datastore
            .commit(vec![Mutation::verify(key("rooms/a"), Precondition::UpdateTime(version))])
            .await
            .unwrap();

        datastore.put_document(key("rooms/a"), map(&[("n", 2i64.into())]));
        let err = datastore
            .commit(vec![Mutation::verify(key("rooms/a"), Precondition::UpdateTime(version))])
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    }

    #[tokio::test]
    async fn transforms_report_server_values() {
        let datastore = InMemoryDatastore::new();
        datastore.put_document(key("rooms/a"), map(&[("n", 1i64.into())]));
        let results = datastore
            .commit(vec![Mutation::transform(
                key("rooms/a"),
                vec![FieldTransform::new(
                    field("n"),
                    TransformOperation::NumericIncrement(2i64.into()),
                )],
            )])
            .await
            .unwrap();
        assert_eq!(
            results[0].transform_results.as_deref(),
            Some(&[FirestoreValue::from_integer(3)][..])
        );
        let doc = datastore.document(&key("rooms/a")).unwrap();
        assert_eq!(doc.field(&field("n")), Some(&3i64.into()));
    }
}
