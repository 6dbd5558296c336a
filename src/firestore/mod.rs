pub mod async_queue;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod settings;
pub mod value;

#[cfg(test)]
pub mod test_support;

pub use self::core::{ClientComponents, FirestoreClient, ListenOptions, ListenerRegistration};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use settings::{ClientConfig, SyncSettings};
