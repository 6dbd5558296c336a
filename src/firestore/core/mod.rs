pub mod event_manager;
pub mod filter;
pub mod firestore_client;
pub mod listen_sequence;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod target_id_generator;
pub mod transaction;
pub mod types;
pub mod view;
pub mod view_snapshot;

#[doc(inline)]
pub use event_manager::{EventManager, ListenOptions, QueryListener, SnapshotCallback};
#[doc(inline)]
pub use firestore_client::{ClientComponents, FirestoreClient, ListenerRegistration};
pub use filter::{Filter, FilterOperator};
pub use query::{LimitType, Query};
pub use sync_engine::{SyncEngine, SyncEngineListener};
pub use target::Target;
pub use transaction::Transaction;
pub use types::{BatchId, OnlineState, OnlineStateSource, TargetId};
pub use view::View;
pub use view_snapshot::{ChangeType, DocumentViewChange, SyncState, ViewSnapshot};
