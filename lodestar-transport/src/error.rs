//! Transport error types and the pipeline failure taxonomy

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::AuditTrail;
use crate::types::HttpMethod;

/// Terminal failure kinds a request pipeline can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineFailure {
    /// The transport never produced a response
    BadRequest,
    /// A response arrived but was unusable
    BadResponse,
    /// The server rejected the credentials (401)
    BadAuthentication,
    PingFailure,
    SniffFailure,
    /// The startup sniff gate could not be acquired in time
    CouldNotStartSniffOnStartup,
    MaxTimeoutReached,
    MaxRetriesReached,
    /// The pool yielded no candidates at all
    NoNodesAttempted,
    Unexpected,
}

impl PipelineFailure {
    /// Failure kind as a string for metrics labeling
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineFailure::BadRequest => "bad_request",
            PipelineFailure::BadResponse => "bad_response",
            PipelineFailure::BadAuthentication => "bad_authentication",
            PipelineFailure::PingFailure => "ping_failure",
            PipelineFailure::SniffFailure => "sniff_failure",
            PipelineFailure::CouldNotStartSniffOnStartup => "could_not_start_sniff_on_startup",
            PipelineFailure::MaxTimeoutReached => "max_timeout_reached",
            PipelineFailure::MaxRetriesReached => "max_retries_reached",
            PipelineFailure::NoNodesAttempted => "no_nodes_attempted",
            PipelineFailure::Unexpected => "unexpected",
        }
    }
}

/// Error raised by a `Connection` implementation when no response was
/// received at all. A response carrying a failure status is not a
/// `ConnectionError`; the pipeline classifies that on its own.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("connection failed: {0}")]
    Failed(String),

    #[error("request timed out: {0}")]
    Timeout(String),
}

/// One failed sniff attempt, kept for aggregation into the terminal error.
#[derive(Debug, Clone)]
pub struct SniffAttempt {
    pub node: String,
    pub error: String,
}

/// The terminal, caller-facing error for a failed request.
///
/// Carries the full audit history of every node attempted, not just the
/// last failure.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct PipelineError {
    /// Which terminal failure the pipeline ended in
    pub failure: PipelineFailure,
    /// Human-readable summary including the attempted resource
    pub message: String,
    /// HTTP method of the original request
    pub method: HttpMethod,
    /// Path of the original request
    pub path: String,
    /// Status code of the last response, when one was received
    pub status: Option<u16>,
    /// True when the request failed over every currently-reachable node
    pub failed_over_all_nodes: bool,
    /// Everything that happened while executing the request
    pub audit_trail: AuditTrail,
}

impl PipelineError {
    /// Multi-line rendering with the audit trail, for post-hoc debugging.
    pub fn diagnostics(&self) -> String {
        format!("{}\naudit trail: {}", self.message, self.audit_trail)
    }
}

/// Errors surfaced by the transport layer.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A request ran out of options; carries the full audit history
    #[error(transparent)]
    Pipeline(#[from] Box<PipelineError>),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<PipelineError> for TransportError {
    fn from(err: PipelineError) -> Self {
        TransportError::Pipeline(Box::new(err))
    }
}

impl TransportError {
    /// The pipeline failure kind, when this is a pipeline error.
    pub fn pipeline_failure(&self) -> Option<PipelineFailure> {
        match self {
            TransportError::Pipeline(err) => Some(err.failure),
            TransportError::Config(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
