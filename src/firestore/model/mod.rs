mod database_id;
mod document;
mod document_key;
mod document_set;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod resource_path;
mod snapshot_version;
mod timestamp;
mod user;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{Document, MaybeDocument, NoDocument, UnknownDocument};
pub use document_key::DocumentKey;
pub use document_set::{key_order_comparator, DocumentComparator, DocumentSet};
pub use field_path::{FieldPath, IntoFieldPath, DOCUMENT_KEY_NAME};
pub use geo_point::GeoPoint;
pub use mutation::{
    validate_increment_operand, FieldMask, FieldTransform, Mutation, MutationResult, Precondition,
    TransformOperation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult, BATCH_ID_UNKNOWN};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
pub use user::User;
