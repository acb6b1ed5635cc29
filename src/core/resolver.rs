//! Pure routing resolution over a [`ConfigTree`] snapshot.
//!
//! Resolution maps `(hostname, port)` to either a target set or a redirect,
//! honoring the tie-break contract: exact subdomain first, then progressively
//! wider wildcards, then failure. Aliases restart resolution from the top and
//! are cycle-checked.
use std::collections::{BTreeMap, HashSet};

use thiserror::Error;

use crate::core::tree::{ConfigNode, ConfigTree};

/// Resolution misses. These are terminal per request (never retried) and are
/// converted to user-visible error responses by the dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("domain {0} is not configured")]
    DomainNotConfigured(String),

    #[error("no subdomain entry matches {0}")]
    SubdomainNotConfigured(String),

    #[error("no route for {host}:{port}")]
    NoMatch { host: String, port: u16 },

    #[error("record for {0} has no alias, redirect or targets")]
    EmptyRecord(String),

    #[error("alias chain starting at {0} does not terminate")]
    AliasCycle(String),
}

/// A successful resolution: either a set of weighted backend addresses to
/// pick from, or a redirect to emit as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Targets(BTreeMap<String, u32>),
    Redirect(String),
}

/// The action a record prescribes. Exactly one applies at resolution time;
/// the variants make a record holding several shapes unrepresentable past
/// this point.
enum RouteAction {
    Alias(String),
    Redirect(String),
    Targets(BTreeMap<String, u32>),
}

/// Resolve `hostname:port` against a tree snapshot.
pub fn resolve(tree: &ConfigTree, hostname: &str, port: u16) -> Result<Resolved, ResolveError> {
    let mut visited = HashSet::new();
    resolve_host(tree, hostname, port, &mut visited)
}

fn resolve_host(
    tree: &ConfigTree,
    hostname: &str,
    port: u16,
    visited: &mut HashSet<(String, u16)>,
) -> Result<Resolved, ResolveError> {
    let host = hostname
        .split(':')
        .next()
        .unwrap_or(hostname)
        .to_ascii_lowercase();
    if !visited.insert((host.clone(), port)) {
        return Err(ResolveError::AliasCycle(host));
    }

    let domain = registrable_domain(&host);
    let domain_node = tree
        .get(&format!("domains/{domain}"))
        .ok_or_else(|| ResolveError::DomainNotConfigured(domain.clone()))?;

    let record = if host == domain {
        domain_node
    } else {
        let subdomains = domain_node.child("subdomains");
        subdomain_patterns(&host)
            .into_iter()
            .find_map(|pattern| subdomains.and_then(|s| s.child(&pattern)))
            .ok_or_else(|| ResolveError::SubdomainNotConfigured(host.clone()))?
    };

    resolve_record(tree, record, &host, port, visited)
}

fn resolve_record(
    tree: &ConfigTree,
    record: &ConfigNode,
    host: &str,
    port: u16,
    visited: &mut HashSet<(String, u16)>,
) -> Result<Resolved, ResolveError> {
    match record_action(record, host)? {
        Some(RouteAction::Alias(alias)) => {
            let (alias_host, alias_port) = split_alias(&alias, port);
            resolve_host(tree, &alias_host, alias_port, visited)
        }
        Some(RouteAction::Redirect(url)) => Ok(Resolved::Redirect(url)),
        Some(RouteAction::Targets(targets)) => Ok(Resolved::Targets(targets)),
        None => {
            let port_record = record
                .child("ports")
                .and_then(|p| p.child(&port.to_string()))
                .ok_or(ResolveError::NoMatch {
                    host: host.to_string(),
                    port,
                })?;
            match record_action(port_record, host)? {
                Some(RouteAction::Alias(alias)) => {
                    let (alias_host, alias_port) = split_alias(&alias, port);
                    resolve_host(tree, &alias_host, alias_port, visited)
                }
                Some(RouteAction::Redirect(url)) => Ok(Resolved::Redirect(url)),
                Some(RouteAction::Targets(targets)) => Ok(Resolved::Targets(targets)),
                None => Err(ResolveError::EmptyRecord(host.to_string())),
            }
        }
    }
}

/// Interpret a record node: alias wins over redirect, redirect over targets.
fn record_action(record: &ConfigNode, host: &str) -> Result<Option<RouteAction>, ResolveError> {
    if let Some(alias) = record.child("alias").and_then(|n| n.value()) {
        return Ok(Some(RouteAction::Alias(alias.to_string())));
    }
    if let Some(url) = record.child("redirect").and_then(|n| n.value()) {
        return Ok(Some(RouteAction::Redirect(url.to_string())));
    }
    if let Some(targets_node) = record.child("targets") {
        let Some(children) = targets_node.children() else {
            return Err(ResolveError::EmptyRecord(host.to_string()));
        };
        let mut targets = BTreeMap::new();
        for (address, node) in children {
            let weight = node
                .value()
                .and_then(|v| v.trim().parse::<u32>().ok())
                .ok_or_else(|| ResolveError::EmptyRecord(host.to_string()))?;
            targets.insert(address.clone(), weight);
        }
        return Ok(Some(RouteAction::Targets(targets)));
    }
    Ok(None)
}

/// Last two labels of a hostname (registrable-domain heuristic; no
/// public-suffix-list awareness, so `foo.co.uk` maps to `co.uk`).
pub fn registrable_domain(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        host.to_string()
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

/// Ordered subdomain match patterns, most to least specific.
///
/// `foo.bar.example.com` yields `["foo.bar", "*.bar", "*"]`;
/// `bar.example.com` yields `["bar", "*"]`; a bare domain yields nothing.
pub fn subdomain_patterns(host: &str) -> Vec<String> {
    let labels: Vec<&str> = host.split('.').collect();
    let n = labels.len();
    if n <= 2 {
        return Vec::new();
    }

    let mut patterns = vec![labels[..n - 2].join(".")];
    for i in 1..n - 1 {
        let mut parts = vec!["*"];
        parts.extend(&labels[i..n - 2]);
        patterns.push(parts.join("."));
    }
    patterns
}

/// Split a `host[:port]` alias value, inheriting `current` when the alias
/// carries no usable port.
fn split_alias(alias: &str, current: u16) -> (String, u16) {
    match alias.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (alias.to_string(), current),
        },
        None => (alias.to_string(), current),
    }
}
