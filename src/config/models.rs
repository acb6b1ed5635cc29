//! Configuration data structures for the proxy process.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files.
//! They are intentionally serde-friendly and include defaults so that minimal
//! configs remain concise. Routing configuration itself lives in the store,
//! not here; this file only describes the process: where to listen, how to
//! reach the store, and how to shut down.
use serde::{Deserialize, Serialize};

fn default_addresses() -> Vec<String> {
    vec!["0.0.0.0".to_string()]
}

fn default_ports() -> Vec<u16> {
    vec![8080]
}

/// Top-level process configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Addresses to bind listeners on; one listener per address × port pair.
    #[serde(default = "default_addresses")]
    pub addresses: Vec<String>,
    /// Ports to bind listeners on.
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    /// TLS material and the subset of ports it applies to.
    #[serde(default)]
    pub ssl: Option<SslConfig>,
    /// Connection to the external routing store.
    #[serde(default)]
    pub store: StoreConfig,
    /// Backend selection strategy.
    #[serde(default)]
    pub selection: SelectionConfig,
    /// Graceful shutdown behavior.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addresses: default_addresses(),
            ports: default_ports(),
            ssl: None,
            store: StoreConfig::default(),
            selection: SelectionConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

/// TLS listener configuration. Ports listed here must also appear in the
/// top-level `ports` list; they are served with the certificate material
/// below, the rest stay plain.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SslConfig {
    #[serde(default)]
    pub ports: Vec<u16>,
    /// PEM certificate chain path.
    pub cert: String,
    /// PEM PKCS#8 private key path.
    pub key: String,
    /// Additional PEM chain files appended to the presented chain.
    #[serde(default)]
    pub ca: Vec<String>,
}

/// Connection settings for the external routing store.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the store's HTTP API.
    pub endpoint: String,
    /// Root directory holding this proxy's routing namespace.
    pub directory: String,
    /// Idle seconds after which a silent watch is closed and re-issued.
    pub watch_idle_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:4001".to_string(),
            directory: "/junction".to_string(),
            watch_idle_secs: 60,
        }
    }
}

/// Backend selection strategies
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Deterministic client-IP hashing; keeps a client pinned to one backend
    /// while the target set is unchanged.
    IpHash,
    /// Weight-proportional random selection.
    WeightedRandom,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::IpHash
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default)]
#[serde(default)]
pub struct SelectionConfig {
    pub strategy: SelectionStrategy,
}

/// Graceful shutdown settings.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Watchdog seconds before a stuck drain is forcibly terminated.
    pub grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_secs: 10 }
    }
}
