//! Per-request audit trail
//!
//! Every pipeline owns exactly one trail. Events are appended synchronously
//! within that request's control flow and the finished trail is attached
//! read-only to the response or the terminal error.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Kinds of events recorded while executing one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    SniffOnStartup,
    SniffOnFail,
    SniffOnStaleCluster,
    SniffSuccess,
    SniffFailure,
    PingSuccess,
    PingFailure,
    Resurrection,
    HealthyResponse,
    BadResponse,
    BadRequest,
    CancellationRequested,
    NoNodesAttempted,
}

impl AuditEvent {
    /// Event name as a string for metrics labeling
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::SniffOnStartup => "sniff_on_startup",
            AuditEvent::SniffOnFail => "sniff_on_fail",
            AuditEvent::SniffOnStaleCluster => "sniff_on_stale_cluster",
            AuditEvent::SniffSuccess => "sniff_success",
            AuditEvent::SniffFailure => "sniff_failure",
            AuditEvent::PingSuccess => "ping_success",
            AuditEvent::PingFailure => "ping_failure",
            AuditEvent::Resurrection => "resurrection",
            AuditEvent::HealthyResponse => "healthy_response",
            AuditEvent::BadResponse => "bad_response",
            AuditEvent::BadRequest => "bad_request",
            AuditEvent::CancellationRequested => "cancellation_requested",
            AuditEvent::NoNodesAttempted => "no_nodes_attempted",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One timestamped entry in the audit trail.
#[derive(Debug, Clone)]
pub struct Audit {
    pub event: AuditEvent,
    /// URL of the node involved, when the event concerns one
    pub node: Option<String>,
    /// Path of the request or probe that produced the event
    pub path: Option<String>,
    pub started: Instant,
    pub ended: Instant,
    /// Rendered error for failure events
    pub error: Option<String>,
}

/// Append-only sequence of audit entries for one logical request.
#[derive(Debug, Clone, Default)]
pub struct AuditTrail {
    events: Vec<Audit>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, audit: Audit) {
        self.events.push(audit);
    }

    /// Append an event, closing its window at the current instant.
    pub(crate) fn record(
        &mut self,
        event: AuditEvent,
        node: Option<String>,
        path: Option<String>,
        started: Instant,
        error: Option<String>,
    ) {
        self.add(Audit {
            event,
            node,
            path,
            started,
            ended: Instant::now(),
            error,
        });
    }

    pub fn events(&self) -> &[Audit] {
        &self.events
    }

    pub fn last(&self) -> Option<&Audit> {
        self.events.last()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl fmt::Display for AuditTrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, audit) in self.events.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            match &audit.node {
                Some(node) => write!(f, "{}({})", audit.event, node)?,
                None => write!(f, "{}", audit.event)?,
            }
        }
        Ok(())
    }
}
