use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::firestore::async_queue::AsyncQueue;
use crate::firestore::error::FirestoreResult;
use crate::firestore::remote::datastore::{NoopTokenProvider, StreamingDatastore, TokenProviderArc};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::streams::{
    ListenStream, WatchStreamListener, WriteStream, WriteStreamListener,
};
use crate::firestore::settings::SyncSettings;
use crate::util::backoff::BackoffConfig;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCredentials {
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
    pub heartbeat_header: Option<String>,
}

/// Collects the tokens attached to every stream that is opened.
#[derive(Clone)]
pub struct StreamCredentialProvider {
    auth_provider: TokenProviderArc,
    app_check_provider: TokenProviderArc,
    heartbeat_provider: Option<TokenProviderArc>,
}

impl StreamCredentialProvider {
    pub fn new(
        auth_provider: TokenProviderArc,
        app_check_provider: TokenProviderArc,
        heartbeat_provider: Option<TokenProviderArc>,
    ) -> Self {
        Self {
            auth_provider,
            app_check_provider,
            heartbeat_provider,
        }
    }

    pub fn auth_provider(&self) -> &TokenProviderArc {
        &self.auth_provider
    }

    pub async fn fetch(&self) -> FirestoreResult<StreamCredentials> {
        let auth_token = self.auth_provider.get_token().await?;
        let app_check_token = self.app_check_provider.get_token().await?;
        let heartbeat_header = match &self.heartbeat_provider {
            Some(provider) => provider.heartbeat_header().await?,
            None => None,
        };

        Ok(StreamCredentials {
            auth_token,
            app_check_token,
            heartbeat_header,
        })
    }

    /// Forces fresh tokens on the next `fetch`.
    pub fn invalidate(&self) {
        self.auth_provider.invalidate_token();
        self.app_check_provider.invalidate_token();
    }
}

/// Builds the listen and write streams of one client over a shared
/// datastore, queue and set of credentials.
#[derive(Clone)]
pub struct NetworkLayer {
    datastore: Arc<dyn StreamingDatastore>,
    credentials: StreamCredentialProvider,
    queue: AsyncQueue,
    serializer: JsonProtoSerializer,
    backoff: BackoffConfig,
    idle_timeout: Duration,
}

impl NetworkLayer {
    pub fn builder(
        datastore: Arc<dyn StreamingDatastore>,
        auth_provider: TokenProviderArc,
        queue: AsyncQueue,
        serializer: JsonProtoSerializer,
    ) -> NetworkLayerBuilder {
        NetworkLayerBuilder::new(datastore, auth_provider, queue, serializer)
    }

    pub fn credentials(&self) -> &StreamCredentialProvider {
        &self.credentials
    }

    pub fn serializer(&self) -> &JsonProtoSerializer {
        &self.serializer
    }

    pub fn listen_stream(&self, listener: Weak<dyn WatchStreamListener>) -> ListenStream {
        ListenStream::new(
            self.queue.clone(),
            Arc::clone(&self.datastore),
            self.credentials.clone(),
            self.serializer.clone(),
            self.backoff,
            self.idle_timeout,
            listener,
        )
    }

    pub fn write_stream(&self, listener: Weak<dyn WriteStreamListener>) -> WriteStream {
        WriteStream::new(
            self.queue.clone(),
            Arc::clone(&self.datastore),
            self.credentials.clone(),
            self.serializer.clone(),
            self.backoff,
            self.idle_timeout,
            listener,
        )
    }
}

pub struct NetworkLayerBuilder {
    datastore: Arc<dyn StreamingDatastore>,
    auth_provider: TokenProviderArc,
    queue: AsyncQueue,
    serializer: JsonProtoSerializer,
    app_check_provider: Option<TokenProviderArc>,
    heartbeat_provider: Option<TokenProviderArc>,
    settings: SyncSettings,
}

impl NetworkLayerBuilder {
    fn new(
        datastore: Arc<dyn StreamingDatastore>,
        auth_provider: TokenProviderArc,
        queue: AsyncQueue,
        serializer: JsonProtoSerializer,
    ) -> Self {
        Self {
            datastore,
            auth_provider,
            queue,
            serializer,
            app_check_provider: None,
            heartbeat_provider: None,
            settings: SyncSettings::default(),
        }
    }

    pub fn with_app_check_provider(mut self, provider: TokenProviderArc) -> Self {
        self.app_check_provider = Some(provider);
        self
    }

    pub fn with_heartbeat_provider(mut self, provider: TokenProviderArc) -> Self {
        self.heartbeat_provider = Some(provider);
        self
    }

    pub fn with_settings(mut self, settings: &SyncSettings) -> Self {
        self.settings = settings.clone();
        self
    }

    pub fn build(self) -> NetworkLayer {
        let app_check = self
            .app_check_provider
            .unwrap_or_else(|| Arc::new(NoopTokenProvider) as TokenProviderArc);
        let heartbeat_provider = self
            .heartbeat_provider
            .or_else(|| Some(Arc::clone(&app_check)));
        let credentials = StreamCredentialProvider::new(
            Arc::clone(&self.auth_provider),
            app_check,
            heartbeat_provider,
        );
        NetworkLayer {
            datastore: self.datastore,
            credentials,
            queue: self.queue,
            serializer: self.serializer,
            backoff: self.settings.backoff_config(),
            idle_timeout: self.settings.idle_stream_timeout(),
        }
    }
}
