//! Junction - a dynamic host-routing reverse proxy.
//!
//! Junction accepts HTTP and WebSocket connections on configurable
//! address × port pairs and forwards each to a backend chosen by resolving
//! the request hostname against a routing table kept continuously
//! synchronized with an external distributed key-value store (etcd v2 API).
//!
//! # Features
//! - Continuous config sync: full fetch + incremental watch, with automatic
//!   resync on disconnects, watch expiry and store errors
//! - Hostname resolution with wildcard subdomains, aliases and redirects
//! - Sticky (client-IP hash) or weighted-random backend selection
//! - HTTP and raw WebSocket upgrade forwarding with forwarded-for headers
//! - Optional TLS listeners from PEM material on disk
//! - Graceful shutdown: reverse-order listener drain under a watchdog
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations)
//! while keeping routing logic inside `core`. The request path only ever
//! reads published routing snapshots; the sync engine is the sole writer.
//!
//! # Error Handling
//! Fallible APIs return either `eyre::Result<T>` or a domain specific error
//! type. Sync-layer errors never propagate to request handling, which always
//! serves the last-good routing table.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{EtcdClient, HttpClientAdapter, HttpHandler},
    core::{SelectorFactory, SharedRoutes, SyncEngine, shared_routes},
    ports::{http_client::HttpClient, store::ConfigStore},
    utils::ShutdownCoordinator,
};
