//! Builders and fakes shared by the unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::firestore::core::filter::{Filter, FilterOperator};
use crate::firestore::core::query::Query;
use crate::firestore::core::types::TargetId;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DatabaseId, Document, DocumentKey, FieldPath, MaybeDocument, NoDocument, ResourcePath,
    SnapshotVersion, User,
};
use crate::firestore::remote::datastore::{
    StreamingDatastore, StreamingDatastoreImpl, TokenProvider, UserChangeListener,
};
use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
use crate::firestore::value::{FirestoreValue, MapValue};
use crate::platform::runtime;

pub fn path(path: &str) -> ResourcePath {
    ResourcePath::from_segments(path.split('/').filter(|segment| !segment.is_empty()))
}

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn field(path: &str) -> FieldPath {
    FieldPath::from_dot_separated(path).unwrap()
}

pub fn version(micros: i64) -> SnapshotVersion {
    SnapshotVersion::from_micros(micros)
}

pub fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
    MapValue::new(
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect(),
    )
}

/// A document at `path` with update time `version` micros.
pub fn doc(path: &str, version_micros: i64, fields: &[(&str, FirestoreValue)]) -> Document {
    Document::new(key(path), version(version_micros), map(fields))
}

pub fn deleted(path: &str, version_micros: i64) -> MaybeDocument {
    NoDocument::new(key(path), version(version_micros)).into()
}

/// Field filter such as `filter("n", ">=", 2i64.into())`.
pub fn filter(path: &str, op: &str, value: FirestoreValue) -> Filter {
    Filter::field(field(path), FilterOperator::parse(op).unwrap(), value).unwrap()
}

pub fn query(path_str: &str) -> Query {
    Query::new(path(path_str))
}

pub fn target_data(target_id: TargetId, query: &Query, sequence_number: i64) -> TargetData {
    TargetData::new(query.to_target(), target_id, TargetPurpose::Listen, sequence_number)
}

/// A streaming datastore wired to an in-memory peer. The returned connection
/// is the server side; tests `accept()` the streams the client opens.
pub fn connected_datastore() -> (Arc<dyn StreamingDatastore>, Arc<MultiplexedConnection>, DatabaseId) {
    let (client_transport, server_transport) = InMemoryTransport::pair();
    let client = Arc::new(MultiplexedConnection::new(client_transport));
    let server = Arc::new(MultiplexedConnection::new(server_transport));
    let database_id = DatabaseId::new("project", "(default)");
    let datastore: Arc<dyn StreamingDatastore> =
        Arc::new(StreamingDatastoreImpl::new(client, database_id.clone()));
    (datastore, server, database_id)
}

/// Polls `condition` until it holds; panics after five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        runtime::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

/// Token provider whose user can be switched from a test.
#[derive(Default)]
pub struct FakeAuth {
    user: Mutex<Option<User>>,
    listener: Mutex<Option<UserChangeListener>>,
    invalidations: Mutex<usize>,
}

impl FakeAuth {
    pub fn signed_in(uid: &str) -> Self {
        Self {
            user: Mutex::new(Some(User::new(uid))),
            ..Self::default()
        }
    }

    pub fn switch_user(&self, user: User) {
        *self.user.lock().unwrap() = Some(user.clone());
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener(user);
        }
    }

    pub fn invalidations(&self) -> usize {
        *self.invalidations.lock().unwrap()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl TokenProvider for FakeAuth {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        let user = self.user.lock().unwrap().clone();
        Ok(user.and_then(|user| user.uid().map(|uid| format!("token-{uid}"))))
    }

    fn invalidate_token(&self) {
        *self.invalidations.lock().unwrap() += 1;
    }

    fn set_user_change_listener(&self, listener: UserChangeListener) {
        let user = self
            .user
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(User::unauthenticated);
        *self.listener.lock().unwrap() = Some(Arc::clone(&listener));
        listener(user);
    }
}
