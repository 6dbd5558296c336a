use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::firestore::core::listen_sequence::ListenSequenceNumber;
use crate::firestore::core::target::Target;
use crate::firestore::core::types::{BatchId, TargetId};
use crate::firestore::error::{data_loss, FirestoreResult};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DocumentKey, MaybeDocument, MutationBatch, NoDocument, ResourcePath, SnapshotVersion,
    Timestamp, UnknownDocument,
};
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// Separates path segments inside encoded keys. Sorts after the composite
/// key separator and before every printable character.
const PATH_SEPARATOR: char = '\u{1}';

pub fn encode_path(path: &ResourcePath) -> String {
    path.as_vec().join(&PATH_SEPARATOR.to_string())
}

pub fn decode_path(encoded: &str) -> ResourcePath {
    if encoded.is_empty() {
        return ResourcePath::root();
    }
    ResourcePath::from_segments(encoded.split(PATH_SEPARATOR))
}

/// Prefix shared by the encoded paths of everything below `path`.
pub fn encode_child_prefix(path: &ResourcePath) -> String {
    if path.is_empty() {
        return String::new();
    }
    let mut prefix = encode_path(path);
    prefix.push(PATH_SEPARATOR);
    prefix
}

pub fn decode_key(encoded: &str) -> FirestoreResult<DocumentKey> {
    DocumentKey::from_path(decode_path(encoded))
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMutationQueue {
    pub user_id: String,
    pub last_acknowledged_batch_id: BatchId,
    /// Base64 write stream token.
    pub last_stream_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMutationBatch {
    pub user_id: String,
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    #[serde(default)]
    pub base_mutations: Vec<JsonValue>,
    pub mutations: Vec<JsonValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbVersionedKey {
    pub path: String,
    pub version_micros: i64,
}

/// One entry of the remote document cache. Exactly one of `document`,
/// `no_document` and `unknown_document` is set.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbRemoteDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_document: Option<DbVersionedKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unknown_document: Option<DbVersionedKey>,
    #[serde(default)]
    pub has_committed_mutations: bool,
    /// Version of the remote event (or acknowledgement) that wrote the entry.
    pub read_time_micros: i64,
    /// Encoded collection path, for collection scans by read time.
    pub parent_path: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbRemoteDocumentGlobal {
    pub byte_size: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTarget {
    pub target_id: TargetId,
    pub canonical_id: String,
    pub read_time_micros: i64,
    /// Base64 resume token.
    pub resume_token: String,
    pub last_listen_sequence_number: ListenSequenceNumber,
    pub last_limbo_free_snapshot_version_micros: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents: Option<JsonValue>,
}

/// Row of the target-document association. Target id 0 is a sentinel row
/// carrying the document's last access sequence number.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTargetDocument {
    pub target_id: TargetId,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<ListenSequenceNumber>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTargetGlobal {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version_micros: i64,
    pub target_count: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbClientMetadata {
    pub client_id: String,
    pub update_time_ms: i64,
    pub network_enabled: bool,
    pub in_foreground: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbPrimaryClient {
    pub owner_id: String,
    pub allow_tab_synchronization: bool,
    pub lease_timestamp_ms: i64,
}

/// Converts between model types and their persisted records.
#[derive(Clone)]
pub struct LocalSerializer {
    remote: JsonProtoSerializer,
}

impl LocalSerializer {
    pub fn new(remote: JsonProtoSerializer) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> &JsonProtoSerializer {
        &self.remote
    }

    pub fn to_db_remote_document(
        &self,
        maybe_doc: &MaybeDocument,
        read_time: SnapshotVersion,
    ) -> DbRemoteDocument {
        let parent_path = encode_path(&maybe_doc.key().collection_path());
        let mut record = DbRemoteDocument {
            document: None,
            no_document: None,
            unknown_document: None,
            has_committed_mutations: maybe_doc.has_committed_mutations(),
            read_time_micros: read_time.to_micros(),
            parent_path,
        };
        let versioned = DbVersionedKey {
            path: encode_path(maybe_doc.key().path()),
            version_micros: maybe_doc.version().to_micros(),
        };
        match maybe_doc {
            MaybeDocument::Document(doc) => record.document = Some(self.remote.encode_document(doc)),
            MaybeDocument::NoDocument(_) => record.no_document = Some(versioned),
            MaybeDocument::Unknown(_) => record.unknown_document = Some(versioned),
        }
        record
    }

    pub fn from_db_remote_document(&self, record: &DbRemoteDocument) -> FirestoreResult<MaybeDocument> {
        if let Some(document) = &record.document {
            let doc = self.remote.decode_document(document)?;
            let doc = if record.has_committed_mutations {
                doc.with_committed_mutations()
            } else {
                doc
            };
            return Ok(doc.into());
        }
        if let Some(no_document) = &record.no_document {
            let doc = NoDocument::new(
                decode_key(&no_document.path)?,
                SnapshotVersion::from_micros(no_document.version_micros),
            );
            let doc = if record.has_committed_mutations {
                doc.with_committed_mutations()
            } else {
                doc
            };
            return Ok(doc.into());
        }
        if let Some(unknown) = &record.unknown_document {
            return Ok(UnknownDocument::new(
                decode_key(&unknown.path)?,
                SnapshotVersion::from_micros(unknown.version_micros),
            )
            .into());
        }
        Err(data_loss("Remote document record holds no document"))
    }

    pub fn to_db_mutation_batch(&self, user_id: &str, batch: &MutationBatch) -> DbMutationBatch {
        DbMutationBatch {
            user_id: user_id.to_string(),
            batch_id: batch.batch_id,
            local_write_time: batch.local_write_time,
            base_mutations: batch
                .base_mutations
                .iter()
                .map(|mutation| self.remote.encode_mutation(mutation))
                .collect(),
            mutations: batch
                .mutations
                .iter()
                .map(|mutation| self.remote.encode_mutation(mutation))
                .collect(),
        }
    }

    pub fn from_db_mutation_batch(&self, record: &DbMutationBatch) -> FirestoreResult<MutationBatch> {
        let base_mutations = record
            .base_mutations
            .iter()
            .map(|mutation| self.remote.decode_mutation(mutation))
            .collect::<FirestoreResult<Vec<_>>>()?;
        let mutations = record
            .mutations
            .iter()
            .map(|mutation| self.remote.decode_mutation(mutation))
            .collect::<FirestoreResult<Vec<_>>>()?;
        Ok(MutationBatch::new(
            record.batch_id,
            record.local_write_time,
            base_mutations,
            mutations,
        ))
    }

    pub fn to_db_target(&self, target_data: &TargetData) -> DbTarget {
        let encoded = self.remote.encode_target(target_data);
        DbTarget {
            target_id: target_data.target_id,
            canonical_id: target_data.target.canonical_id(),
            read_time_micros: target_data.snapshot_version.to_micros(),
            resume_token: self.remote.encode_bytes(&target_data.resume_token),
            last_listen_sequence_number: target_data.sequence_number,
            last_limbo_free_snapshot_version_micros: target_data
                .last_limbo_free_snapshot_version
                .to_micros(),
            query: encoded.get("query").cloned(),
            documents: encoded.get("documents").cloned(),
        }
    }

    pub fn from_db_target(&self, record: &DbTarget) -> FirestoreResult<TargetData> {
        let target = self.decode_db_target_definition(record)?;
        let resume_token = self
            .remote
            .decode_bytes(&JsonValue::String(record.resume_token.clone()))?;
        Ok(TargetData::new(
            target,
            record.target_id,
            TargetPurpose::Listen,
            record.last_listen_sequence_number,
        )
        .with_resume_token(
            resume_token,
            SnapshotVersion::from_micros(record.read_time_micros),
        )
        .with_last_limbo_free_snapshot_version(SnapshotVersion::from_micros(
            record.last_limbo_free_snapshot_version_micros,
        )))
    }

    pub fn decode_db_target_definition(&self, record: &DbTarget) -> FirestoreResult<Target> {
        if let Some(documents) = &record.documents {
            return self.remote.decode_documents_target(documents);
        }
        if let Some(query) = &record.query {
            return self.remote.decode_query_target(query);
        }
        Err(data_loss(format!(
            "Target {} has neither a query nor documents",
            record.target_id
        )))
    }
}
