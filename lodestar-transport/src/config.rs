//! Transport configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::node::Node;

/// Predicate deciding whether a node may serve ordinary API traffic.
///
/// Never consulted when picking sniff targets: topology discovery must be
/// able to reach nodes the predicate excludes from normal traffic.
#[derive(Clone)]
pub struct NodePredicate(Arc<dyn Fn(&Node) -> bool + Send + Sync>);

impl NodePredicate {
    pub fn new(predicate: impl Fn(&Node) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    pub fn matches(&self, node: &Node) -> bool {
        (self.0)(node)
    }
}

impl fmt::Debug for NodePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NodePredicate")
    }
}

/// Transport-wide settings snapshot handed to every pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Ping probe timeout in milliseconds
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,

    /// Base backoff before a dead node is retried, in milliseconds
    #[serde(default = "default_dead_timeout")]
    pub dead_timeout_ms: u64,

    /// Upper bound on the dead-node backoff, in milliseconds
    #[serde(default = "default_max_dead_timeout")]
    pub max_dead_timeout_ms: u64,

    /// Overall budget across retries; falls back to the request timeout
    #[serde(default)]
    pub max_retry_timeout_ms: Option<u64>,

    /// How long sniffed topology stays fresh; `None` disables staleness sniffs
    #[serde(default)]
    pub sniff_lifespan_ms: Option<u64>,

    /// Retry cap; `None` means bounded only by the pool size
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Sniff once before the first request is dispatched
    #[serde(default = "default_true")]
    pub sniff_on_startup: bool,

    /// Sniff after any failed call
    #[serde(default = "default_true")]
    pub sniff_on_connection_fault: bool,

    /// Never ping, not even resurrected nodes
    #[serde(default)]
    pub disable_pings: bool,

    /// Filters nodes for API-call selection; sniff targets are never filtered
    #[serde(skip)]
    pub node_predicate: Option<NodePredicate>,
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_ping_timeout() -> u64 {
    2_000
}

fn default_dead_timeout() -> u64 {
    60_000
}

fn default_max_dead_timeout() -> u64 {
    300_000
}

fn default_true() -> bool {
    true
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            ping_timeout_ms: default_ping_timeout(),
            dead_timeout_ms: default_dead_timeout(),
            max_dead_timeout_ms: default_max_dead_timeout(),
            max_retry_timeout_ms: None,
            sniff_lifespan_ms: None,
            max_retries: None,
            sniff_on_startup: default_true(),
            sniff_on_connection_fault: default_true(),
            disable_pings: false,
            node_predicate: None,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn dead_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_timeout_ms)
    }

    pub fn max_dead_timeout(&self) -> Duration {
        Duration::from_millis(self.max_dead_timeout_ms)
    }

    /// Overall retry budget; the request timeout when not set explicitly.
    pub fn max_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.max_retry_timeout_ms.unwrap_or(self.request_timeout_ms))
    }

    pub fn sniff_lifespan(&self) -> Option<Duration> {
        self.sniff_lifespan_ms.map(Duration::from_millis)
    }
}

/// Per-request overrides.
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    /// Pin execution to one node, disabling retries for this request
    pub force_node: Option<String>,

    /// Overrides the transport-wide request timeout
    pub request_timeout: Option<Duration>,

    /// Overrides the transport-wide retry cap
    pub max_retries: Option<u32>,

    /// Non-2xx statuses treated as a successful transport-level outcome
    /// (e.g. 404 for an exists check)
    pub allowed_status_codes: Vec<u16>,
}
