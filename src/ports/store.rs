use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Errors surfaced at the store boundary.
///
/// The sync engine's reconnection policy is keyed off these variants:
/// `Unavailable` is transient and retried from the last cursor,
/// `IndexCleared` forces a full resync, and `Protocol` aborts the current
/// sync attempt.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// The requested key does not exist (store errorCode 100).
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The key already exists (store errorCode 105); benign for mkdir races.
    #[error("key already exists: {0}")]
    AlreadyExists(String),

    /// The requested watch index has been compacted away (store errorCode
    /// 401); the only recovery is a fresh full fetch.
    #[error("watch index outdated; store history has been cleared")]
    IndexCleared,

    /// The store could not be reached or the connection was dropped.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something we cannot interpret.
    #[error("unexpected store response: {0}")]
    Protocol(String),
}

/// One node of the store's hierarchical namespace, as returned by a read.
///
/// Directory nodes carry `nodes` (possibly empty) and no `value`; leaf nodes
/// carry a `value`. `modified_index` identifies the change that produced the
/// node's current state.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreNode {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub nodes: Vec<StoreNode>,
    #[serde(default)]
    pub modified_index: u64,
}

/// A full read of a subtree plus the change index the read was served at.
///
/// The index seeds the watch cursor: watching from `index + 1` observes
/// exactly the changes not yet reflected in `node`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub node: StoreNode,
    pub index: u64,
}

/// The kind of change a watch observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Create,
    Set,
    Update,
    Delete,
    Expire,
}

impl WatchAction {
    /// Whether this action removes the key rather than (re)writing it.
    pub fn removes(self) -> bool {
        matches!(self, WatchAction::Delete | WatchAction::Expire)
    }
}

/// A single change under the watched prefix.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub action: WatchAction,
    /// Absolute key the change applies to.
    pub key: String,
    /// New value for write actions; `None` for removals and directory creation.
    pub value: Option<String>,
    /// Whether the affected node is a directory.
    pub dir: bool,
    /// Change index of this event; the next watch resumes after it.
    pub index: u64,
}

/// Port over the external hierarchical key-value store.
///
/// All operations are plain awaitable futures; dropping an in-flight future
/// cancels the underlying request, which is how the sync engine bounds
/// staleness on silently dead watch streams.
#[async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    /// Read the node at `path`, recursively when asked.
    async fn get(&self, path: &str, recursive: bool) -> Result<Snapshot, StoreError>;

    /// Create a directory at `path`, failing with `AlreadyExists` if present.
    async fn mkdir(&self, path: &str) -> Result<(), StoreError>;

    /// Block until the next change strictly after `after_index` under `path`.
    async fn watch(
        &self,
        path: &str,
        after_index: u64,
        recursive: bool,
    ) -> Result<WatchEvent, StoreError>;
}
