pub mod datastore;
pub mod network;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod serializer;
pub mod stream;
pub mod streams;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use datastore::{
    Datastore, InMemoryDatastore, NoopTokenProvider, StreamingDatastore, StreamingDatastoreImpl,
    TokenProvider, TokenProviderArc,
};
pub use network::{NetworkLayer, NetworkLayerBuilder, StreamCredentialProvider};
pub use online_state_tracker::OnlineStateTracker;
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use serializer::JsonProtoSerializer;
pub use stream::{InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamTransport};
pub use watch_change::WatchChange;
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
