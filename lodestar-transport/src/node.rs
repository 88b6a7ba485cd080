//! Cluster node identity and liveness state
//!
//! A `Node` is shared between concurrently executing pipelines; all mutable
//! state sits behind atomics or a lock so `mark_alive`/`mark_dead` may race
//! freely. Role flags are fixed per instance: sniffing replaces the whole
//! node set rather than mutating roles in place.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Result, TransportError};

const DEFAULT_PORT: u16 = 9200;

/// Cap on backoff doublings so the multiply cannot overflow
const MAX_BACKOFF_DOUBLINGS: u32 = 16;

/// A single cluster endpoint with liveness and role state.
#[derive(Debug)]
pub struct Node {
    scheme: String,
    host: String,
    port: u16,
    id: Option<String>,
    name: Option<String>,
    cluster_manager_eligible: bool,
    holds_data: bool,
    /// Always true for pooled nodes; http-disabled nodes are dropped at reseed
    http_enabled: bool,
    settings: HashMap<String, String>,
    publish_address: Option<String>,
    alive: AtomicBool,
    dead_until: RwLock<Option<Instant>>,
    failed_attempts: AtomicU32,
}

impl Node {
    /// Seed node. Roles stay optimistic until a sniff narrows them.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_roles(url, true, true)
    }

    /// Seed node with known roles, for pools built from explicit topology.
    pub fn with_roles(url: &str, cluster_manager_eligible: bool, holds_data: bool) -> Result<Self> {
        let (scheme, host, port) = parse_url(url)?;
        Ok(Self {
            scheme,
            host,
            port,
            id: None,
            name: None,
            cluster_manager_eligible,
            holds_data,
            http_enabled: true,
            settings: HashMap::new(),
            publish_address: None,
            alive: AtomicBool::new(true),
            dead_until: RwLock::new(None),
            failed_attempts: AtomicU32::new(0),
        })
    }

    /// Node discovered by a sniff.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn sniffed(
        scheme: &str,
        host: &str,
        port: u16,
        id: Option<String>,
        name: Option<String>,
        cluster_manager_eligible: bool,
        holds_data: bool,
        settings: HashMap<String, String>,
        publish_address: Option<String>,
    ) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            id,
            name,
            cluster_manager_eligible,
            holds_data,
            http_enabled: true,
            settings,
            publish_address,
            alive: AtomicBool::new(true),
            dead_until: RwLock::new(None),
            failed_attempts: AtomicU32::new(0),
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn cluster_manager_eligible(&self) -> bool {
        self.cluster_manager_eligible
    }

    pub fn holds_data(&self) -> bool {
        self.holds_data
    }

    pub fn http_enabled(&self) -> bool {
        self.http_enabled
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        &self.settings
    }

    pub fn publish_address(&self) -> Option<&str> {
        self.publish_address.as_deref()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts.load(Ordering::Acquire)
    }

    pub fn dead_until(&self) -> Option<Instant> {
        *self.dead_until.read()
    }

    /// Reset the node to healthy. Idempotent.
    pub fn mark_alive(&self) {
        self.failed_attempts.store(0, Ordering::Release);
        *self.dead_until.write() = None;
        self.alive.store(true, Ordering::Release);
    }

    /// Take the node out of rotation until its backoff window elapses.
    ///
    /// The window doubles with each consecutive failure and is capped at
    /// `max_dead_timeout`.
    pub fn mark_dead(&self, now: Instant, dead_timeout: Duration, max_dead_timeout: Duration) {
        let attempts = self.failed_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        *self.dead_until.write() = Some(now + backoff(dead_timeout, max_dead_timeout, attempts));
        self.alive.store(false, Ordering::Release);
    }

    /// A dead node past its backoff window: revalidate via ping before use.
    pub fn is_resurrected(&self, now: Instant) -> bool {
        !self.is_alive() && self.dead_until().map(|until| until <= now).unwrap_or(true)
    }

    /// Alive, or dead but past its backoff window.
    pub fn is_reachable(&self, now: Instant) -> bool {
        self.is_alive() || self.is_resurrected(now)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.scheme == other.scheme && self.host == other.host && self.port == other.port
    }
}

impl Eq for Node {}

fn backoff(dead_timeout: Duration, max_dead_timeout: Duration, attempts: u32) -> Duration {
    let doublings = attempts.saturating_sub(1).min(MAX_BACKOFF_DOUBLINGS);
    dead_timeout
        .saturating_mul(1u32 << doublings)
        .min(max_dead_timeout)
}

fn parse_url(url: &str) -> Result<(String, String, u16)> {
    let trimmed = url.trim().trim_end_matches('/');
    let (scheme, rest) = match trimmed.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("http", trimmed),
    };
    if scheme != "http" && scheme != "https" {
        return Err(TransportError::Config(format!(
            "unsupported scheme '{scheme}' in node url '{url}'"
        )));
    }

    let (host, port) = if let Some(rest) = rest.strip_prefix('[') {
        // Bracketed IPv6 literal
        let end = rest.find(']').ok_or_else(|| {
            TransportError::Config(format!("unterminated ipv6 literal in node url '{url}'"))
        })?;
        let host = format!("[{}]", &rest[..end]);
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(port) => parse_port(port, url)?,
            None => DEFAULT_PORT,
        };
        (host, port)
    } else if let Some((host, port)) = rest.rsplit_once(':') {
        (host.to_string(), parse_port(port, url)?)
    } else {
        (rest.to_string(), DEFAULT_PORT)
    };

    if host.is_empty() {
        return Err(TransportError::Config(format!("missing host in node url '{url}'")));
    }
    Ok((scheme.to_string(), host, port))
}

fn parse_port(port: &str, url: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| TransportError::Config(format!("invalid port '{port}' in node url '{url}'")))
}
