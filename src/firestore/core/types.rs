pub type TargetId = i32;
pub type BatchId = i32;

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum OnlineState {
    /// Not yet known; raised snapshots still wait for the server.
    Unknown,
    Online,
    /// Listeners get `from_cache` snapshots without waiting.
    Offline,
}

/// Where an online state change originated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineStateSource {
    RemoteStore,
    SharedClientState,
}
