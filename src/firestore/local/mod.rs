pub mod index_manager;
pub mod kv_store;
pub mod local_documents_view;
pub mod local_serializer;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod shared_client_state;
pub mod target_cache;
pub mod target_data;

#[doc(inline)]
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult};
#[doc(inline)]
pub use lru_garbage_collector::{LruResults, LruScheduler};
#[doc(inline)]
pub use persistence::Persistence;
#[doc(inline)]
pub use shared_client_state::{
    InMemorySharedStorage, MemorySharedClientState, MutationBatchState, QueryTargetState,
    SharedClientState, SharedClientStateSyncer, SharedStorage, StorageSharedClientState,
};
#[doc(inline)]
pub use target_data::{TargetData, TargetPurpose};
