//! Continuous synchronization of the routing tree with the external store.
//!
//! The engine is the sole writer of the shared [`ConfigTree`]: it performs a
//! full recursive fetch, publishes a fresh snapshot, then applies watch
//! deltas one at a time, republishing after each. Request handling only ever
//! loads published snapshots, so it always sees the last-good tree no matter
//! what the store is doing.
use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use eyre::{Result, WrapErr};
use tokio::time::{sleep, timeout};

use crate::{
    core::tree::{ConfigTree, relative_key},
    ports::store::{ConfigStore, Snapshot, StoreError, WatchEvent},
};

/// Shared handle to the latest published routing tree. Every resolution
/// loads one snapshot; the engine swaps in a new one after each mutation.
pub type SharedRoutes = Arc<ArcSwap<ConfigTree>>;

/// Create an empty shared routing tree handle.
pub fn shared_routes() -> SharedRoutes {
    Arc::new(ArcSwap::from_pointee(ConfigTree::default()))
}

const INITIAL_FETCH_ATTEMPTS: u32 = 5;
const BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Fetching,
    Watching,
    Resyncing,
    Failed,
}

/// Outcome of one watch step, as data so the loop stays testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Stay,
    ToResyncing,
}

struct Backoff {
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay: BACKOFF_INITIAL,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.delay = BACKOFF_INITIAL;
    }
}

/// Maintains the shared routing tree as an eventually-fresh mirror of the
/// store namespace rooted at `root`.
pub struct SyncEngine {
    store: Arc<dyn ConfigStore>,
    root: String,
    shared: SharedRoutes,
    tree: ConfigTree,
    cursor: u64,
    state: SyncState,
    watch_idle: Duration,
    backoff: Backoff,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        root: impl Into<String>,
        shared: SharedRoutes,
        watch_idle: Duration,
    ) -> Self {
        let mut root = root.into();
        if !root.starts_with('/') {
            root.insert(0, '/');
        }
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        Self {
            store,
            root,
            shared,
            tree: ConfigTree::default(),
            cursor: 0,
            state: SyncState::Fetching,
            watch_idle,
            backoff: Backoff::new(),
        }
    }

    /// Current engine state (diagnostics and tests).
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Last observed change index.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Perform the initial full fetch, creating the root directory when the
    /// namespace has not been initialized yet. Transient unavailability is
    /// retried a bounded number of times; anything else is fatal at startup.
    pub async fn start(&mut self) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            let result = self.fetch_once().await;
            match result {
                Ok(()) => {
                    self.state = SyncState::Watching;
                    tracing::info!(
                        root = %self.root,
                        index = self.cursor,
                        "routing table loaded from store"
                    );
                    return Ok(());
                }
                Err(StoreError::Unavailable(reason)) if attempts < INITIAL_FETCH_ATTEMPTS => {
                    attempts += 1;
                    let delay = self.backoff.next();
                    tracing::warn!(
                        %reason,
                        attempt = attempts,
                        "store unavailable during initial fetch; retrying in {delay:?}"
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    self.state = SyncState::Failed;
                    return Err(e).wrap_err_with(|| {
                        format!("initial fetch of routing table at {} failed", self.root)
                    });
                }
            }
        }
    }

    /// Drive the watch loop forever. Must be called after a successful
    /// [`start`](Self::start); sync errors never escape this loop.
    pub async fn run(mut self) {
        loop {
            match self.state {
                SyncState::Watching => {
                    let transition = self.watch_once().await;
                    if transition == Transition::ToResyncing {
                        self.state = SyncState::Resyncing;
                    }
                }
                SyncState::Fetching | SyncState::Resyncing => {
                    let result = self.fetch_once().await;
                    match result {
                        Ok(()) => {
                            self.backoff.reset();
                            self.state = SyncState::Watching;
                            tracing::info!(index = self.cursor, "routing table resynchronized");
                        }
                        Err(e) => {
                            let delay = self.backoff.next();
                            tracing::warn!(error = %e, "resync failed; retrying in {delay:?}");
                            sleep(delay).await;
                        }
                    }
                }
                SyncState::Failed => return,
            }
        }
    }

    /// One full recursive read of the root, replacing the tree wholesale.
    async fn fetch_once(&mut self) -> Result<(), StoreError> {
        let snapshot = match self.store.get(&self.root, true).await {
            Ok(snapshot) => snapshot,
            Err(StoreError::KeyNotFound(_)) => {
                // Another actor may create the directory concurrently; both
                // outcomes leave it in place.
                match self.store.mkdir(&self.root).await {
                    Ok(()) | Err(StoreError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e),
                }
                self.store.get(&self.root, true).await?
            }
            Err(e) => return Err(e),
        };
        self.install_snapshot(&snapshot);
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: &Snapshot) {
        self.tree = ConfigTree::from_snapshot(&snapshot.node, &self.root);
        self.cursor = snapshot.index;
        self.publish();
    }

    /// One long-poll watch step, bounded by the idle timeout so a silently
    /// dead stream can never stall the mirror indefinitely.
    async fn watch_once(&mut self) -> Transition {
        let result = {
            let watch = self.store.watch(&self.root, self.cursor + 1, true);
            timeout(self.watch_idle, watch).await
        };
        match result {
            Err(_) => {
                // Dropping the future cancels the in-flight request.
                tracing::debug!(
                    idle = ?self.watch_idle,
                    cursor = self.cursor,
                    "watch idle timeout; re-issuing"
                );
                self.backoff.reset();
                Transition::Stay
            }
            Ok(Ok(event)) => {
                self.apply_event(&event);
                self.backoff.reset();
                Transition::Stay
            }
            Ok(Err(StoreError::IndexCleared)) => {
                tracing::warn!(
                    cursor = self.cursor,
                    "watch index cleared by store; forcing full resync"
                );
                Transition::ToResyncing
            }
            Ok(Err(StoreError::Unavailable(reason))) => {
                // The watch index makes re-issuing from the same cursor safe.
                let delay = self.backoff.next();
                tracing::warn!(%reason, "watch disconnected; retrying in {delay:?}");
                sleep(delay).await;
                Transition::Stay
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "watch failed; forcing full resync");
                Transition::ToResyncing
            }
        }
    }

    /// Merge one watch delta into the tree and publish the new snapshot.
    fn apply_event(&mut self, event: &WatchEvent) {
        let rel = relative_key(&event.key, &self.root).to_string();
        if event.action.removes() {
            tracing::debug!(key = %event.key, action = ?event.action, "removing route entry");
            self.tree.remove(&rel);
        } else if event.dir {
            self.tree.mkdir(&rel);
        } else {
            tracing::debug!(key = %event.key, action = ?event.action, "updating route entry");
            self.tree.set(&rel, event.value.clone().unwrap_or_default());
        }
        self.cursor = self.cursor.max(event.index);
        self.publish();
    }

    fn publish(&self) {
        self.shared.store(Arc::new(self.tree.clone()));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::ports::store::{StoreNode, WatchAction};

    /// Store double that replays a script of responses.
    #[derive(Default)]
    struct ScriptedStore {
        gets: Mutex<VecDeque<Result<Snapshot, StoreError>>>,
        mkdirs: Mutex<VecDeque<Result<(), StoreError>>>,
        watches: Mutex<VecDeque<WatchScript>>,
    }

    enum WatchScript {
        Event(WatchEvent),
        Fail(StoreError),
        Hang,
    }

    #[async_trait]
    impl ConfigStore for ScriptedStore {
        async fn get(&self, _path: &str, _recursive: bool) -> Result<Snapshot, StoreError> {
            self.gets
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(StoreError::Unavailable("script exhausted".into())))
        }

        async fn mkdir(&self, _path: &str) -> Result<(), StoreError> {
            self.mkdirs
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(StoreError::Unavailable("script exhausted".into())))
        }

        async fn watch(
            &self,
            _path: &str,
            _after_index: u64,
            _recursive: bool,
        ) -> Result<WatchEvent, StoreError> {
            let entry = self.watches.lock().await.pop_front();
            match entry {
                Some(WatchScript::Event(event)) => Ok(event),
                Some(WatchScript::Fail(e)) => Err(e),
                Some(WatchScript::Hang) | None => {
                    sleep(Duration::from_secs(3600)).await;
                    Err(StoreError::Unavailable("hung".into()))
                }
            }
        }
    }

    fn snapshot_with_alias(index: u64) -> Snapshot {
        Snapshot {
            node: StoreNode {
                key: "/routes".into(),
                dir: true,
                nodes: vec![StoreNode {
                    key: "/routes/domains".into(),
                    dir: true,
                    nodes: vec![StoreNode {
                        key: "/routes/domains/example.com".into(),
                        dir: true,
                        nodes: vec![StoreNode {
                            key: "/routes/domains/example.com/alias".into(),
                            value: Some("other.com:80".into()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            },
            index,
        }
    }

    fn engine_with(store: ScriptedStore) -> (SyncEngine, SharedRoutes) {
        let shared = shared_routes();
        let engine = SyncEngine::new(
            Arc::new(store),
            "/routes",
            shared.clone(),
            Duration::from_millis(50),
        );
        (engine, shared)
    }

    #[tokio::test]
    async fn start_installs_snapshot_and_cursor() {
        let store = ScriptedStore::default();
        store
            .gets
            .lock()
            .await
            .push_back(Ok(snapshot_with_alias(7)));

        let (mut engine, shared) = engine_with(store);
        engine.start().await.unwrap();

        assert_eq!(engine.state(), SyncState::Watching);
        assert_eq!(engine.cursor(), 7);
        let tree = shared.load();
        assert_eq!(
            tree.get("domains/example.com/alias").and_then(|n| n.value()),
            Some("other.com:80")
        );
    }

    #[tokio::test]
    async fn start_creates_missing_root_and_tolerates_race() {
        let store = ScriptedStore::default();
        store
            .gets
            .lock()
            .await
            .push_back(Err(StoreError::KeyNotFound("/routes".into())));
        store
            .mkdirs
            .lock()
            .await
            .push_back(Err(StoreError::AlreadyExists("/routes".into())));
        store
            .gets
            .lock()
            .await
            .push_back(Ok(snapshot_with_alias(3)));

        let (mut engine, _shared) = engine_with(store);
        engine.start().await.unwrap();
        assert_eq!(engine.cursor(), 3);
    }

    #[tokio::test]
    async fn start_fails_fast_on_protocol_error() {
        let store = ScriptedStore::default();
        store
            .gets
            .lock()
            .await
            .push_back(Err(StoreError::Protocol("bogus body".into())));

        let (mut engine, _shared) = engine_with(store);
        assert!(engine.start().await.is_err());
        assert_eq!(engine.state(), SyncState::Failed);
    }

    #[tokio::test]
    async fn watch_event_updates_tree_and_cursor() {
        let store = ScriptedStore::default();
        store
            .gets
            .lock()
            .await
            .push_back(Ok(snapshot_with_alias(7)));
        store.watches.lock().await.push_back(WatchScript::Event(WatchEvent {
            action: WatchAction::Set,
            key: "/routes/domains/example.com/ports/80/targets/10.0.0.1".into(),
            value: Some("2".into()),
            dir: false,
            index: 8,
        }));

        let (mut engine, shared) = engine_with(store);
        engine.start().await.unwrap();
        assert_eq!(engine.watch_once().await, Transition::Stay);
        assert_eq!(engine.cursor(), 8);
        assert_eq!(
            shared
                .load()
                .get("domains/example.com/ports/80/targets/10.0.0.1")
                .and_then(|n| n.value()),
            Some("2")
        );
    }

    #[tokio::test]
    async fn delete_event_keeps_empty_parent() {
        let store = ScriptedStore::default();
        store
            .gets
            .lock()
            .await
            .push_back(Ok(snapshot_with_alias(7)));
        store.watches.lock().await.push_back(WatchScript::Event(WatchEvent {
            action: WatchAction::Delete,
            key: "/routes/domains/example.com/alias".into(),
            value: None,
            dir: false,
            index: 9,
        }));

        let (mut engine, shared) = engine_with(store);
        engine.start().await.unwrap();
        engine.watch_once().await;

        let tree = shared.load();
        assert!(tree.get("domains/example.com/alias").is_none());
        assert!(tree.get("domains/example.com").is_some());
    }

    #[tokio::test]
    async fn index_cleared_forces_resync() {
        let store = ScriptedStore::default();
        store
            .gets
            .lock()
            .await
            .push_back(Ok(snapshot_with_alias(7)));
        store
            .watches
            .lock()
            .await
            .push_back(WatchScript::Fail(StoreError::IndexCleared));

        let (mut engine, _shared) = engine_with(store);
        engine.start().await.unwrap();
        assert_eq!(engine.watch_once().await, Transition::ToResyncing);
    }

    #[tokio::test]
    async fn idle_timeout_reissues_watch_without_resync() {
        let store = ScriptedStore::default();
        store
            .gets
            .lock()
            .await
            .push_back(Ok(snapshot_with_alias(7)));
        store.watches.lock().await.push_back(WatchScript::Hang);

        let (mut engine, _shared) = engine_with(store);
        engine.start().await.unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(engine.watch_once().await, Transition::Stay);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(engine.cursor(), 7);
    }

    #[tokio::test]
    async fn unavailable_watch_keeps_cursor() {
        let store = ScriptedStore::default();
        store
            .gets
            .lock()
            .await
            .push_back(Ok(snapshot_with_alias(7)));
        store
            .watches
            .lock()
            .await
            .push_back(WatchScript::Fail(StoreError::Unavailable(
                "connection reset".into(),
            )));

        let (mut engine, _shared) = engine_with(store);
        engine.start().await.unwrap();
        assert_eq!(engine.watch_once().await, Transition::Stay);
        assert_eq!(engine.cursor(), 7);
    }
}
