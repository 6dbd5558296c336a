use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::firestore::model::DatabaseId;
use crate::util::backoff::BackoffConfig;

/// Cache size value that turns LRU garbage collection off.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;

/// Tunable thresholds of the sync engine. Defaults match the production
/// behaviour of the hosted client SDKs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// A resume token is persisted at most this often unless documents
    /// changed in between.
    pub resume_token_max_age_micros: i64,
    pub max_concurrent_limbo_resolutions: usize,
    /// Write pipeline cap.
    pub max_pending_writes: usize,
    /// Clients whose metadata was not refreshed for this long are ignored
    /// and eventually removed.
    pub max_client_age_millis: i64,
    pub primary_lease_millis: i64,
    pub client_metadata_refresh_millis: u64,
    pub lru_percentile_to_collect: u8,
    pub lru_max_sequence_numbers_to_collect: usize,
    pub lru_initial_collection_delay_millis: u64,
    pub lru_regular_collection_delay_millis: u64,
    /// Byte size the cache may grow to before GC runs.
    /// [`CACHE_SIZE_UNLIMITED`] disables collection.
    pub cache_size_bytes: i64,
    pub idle_stream_timeout_millis: u64,
    pub online_state_timeout_millis: u64,
    pub max_watch_stream_failures: u32,
    pub max_transaction_attempts: u32,
    pub backoff_initial_delay_millis: u64,
    pub backoff_factor: f64,
    pub backoff_max_delay_millis: u64,
    /// Lets a client without the primary lease keep running (as a
    /// secondary) instead of failing start-up.
    pub allow_tab_synchronization: bool,
}

impl SyncSettings {
    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay_millis: self.backoff_initial_delay_millis,
            backoff_factor: self.backoff_factor,
            max_delay_millis: self.backoff_max_delay_millis,
        }
    }

    pub fn idle_stream_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_stream_timeout_millis)
    }

    pub fn online_state_timeout(&self) -> Duration {
        Duration::from_millis(self.online_state_timeout_millis)
    }

    pub fn client_metadata_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.client_metadata_refresh_millis)
    }

    pub fn gc_enabled(&self) -> bool {
        self.cache_size_bytes != CACHE_SIZE_UNLIMITED
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            resume_token_max_age_micros: 5 * 60 * 1_000_000,
            max_concurrent_limbo_resolutions: 100,
            max_pending_writes: 10,
            max_client_age_millis: 30 * 60 * 1_000,
            primary_lease_millis: 5_000,
            client_metadata_refresh_millis: 4_000,
            lru_percentile_to_collect: 10,
            lru_max_sequence_numbers_to_collect: 1_000,
            lru_initial_collection_delay_millis: 60 * 1_000,
            lru_regular_collection_delay_millis: 5 * 60 * 1_000,
            cache_size_bytes: 40 * 1024 * 1024,
            idle_stream_timeout_millis: 60 * 1_000,
            online_state_timeout_millis: 10 * 1_000,
            max_watch_stream_failures: 1,
            max_transaction_attempts: 5,
            backoff_initial_delay_millis: 1_000,
            backoff_factor: 1.5,
            backoff_max_delay_millis: 60 * 1_000,
            allow_tab_synchronization: false,
        }
    }
}

/// Identity of one client instance.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    pub database_id: DatabaseId,
    /// Namespaces persisted and cross-tab state. Clients sharing a key share
    /// a cache.
    pub persistence_key: String,
    pub client_id: String,
    /// Whether this client is in the foreground. Foreground clients win
    /// primary lease ties.
    pub in_foreground: bool,
    pub settings: SyncSettings,
}

impl ClientConfig {
    pub fn new(database_id: DatabaseId, persistence_key: impl Into<String>) -> Self {
        Self {
            database_id,
            persistence_key: persistence_key.into(),
            client_id: generate_client_id(),
            in_foreground: true,
            settings: SyncSettings::default(),
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_foreground(mut self, in_foreground: bool) -> Self {
        self.in_foreground = in_foreground;
        self
    }
}

/// Random 20-character alphanumeric id.
pub fn generate_client_id() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}
