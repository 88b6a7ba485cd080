//! Terminal failure classification
//!
//! Once a request cannot proceed, the pipeline's final state is folded into
//! a single `PipelineError`. Precedence: running out of time beats running
//! out of retries beats whatever the last individual attempt reported.

use serde_json::Value;

use crate::audit::AuditTrail;
use crate::error::{PipelineError, PipelineFailure, SniffAttempt};
use crate::metrics;
use crate::types::RequestData;

/// What a single failed attempt left behind.
#[derive(Debug, Clone)]
pub(crate) struct FailureContext {
    pub failure: PipelineFailure,
    pub message: String,
    pub status: Option<u16>,
}

/// Fold terminal pipeline state into the caller-facing error.
pub(crate) fn classify(
    request: &RequestData,
    trail: AuditTrail,
    taking_too_long: bool,
    retried: u32,
    max_retries: u32,
    reachable_nodes: usize,
    last: Option<FailureContext>,
) -> PipelineError {
    let (failure, status, inner, failed_over_all_nodes) = if taking_too_long {
        let status = last.as_ref().and_then(|ctx| ctx.status);
        (PipelineFailure::MaxTimeoutReached, status, last.map(|ctx| ctx.message), false)
    } else if max_retries > 0 && retried >= max_retries {
        let failed_over_all = retried as usize >= reachable_nodes;
        let status = last.as_ref().and_then(|ctx| ctx.status);
        (
            PipelineFailure::MaxRetriesReached,
            status,
            last.map(|ctx| ctx.message),
            failed_over_all,
        )
    } else if let Some(ctx) = last {
        (ctx.failure, ctx.status, Some(ctx.message), false)
    } else {
        (PipelineFailure::Unexpected, None, None, false)
    };

    build(request, trail, failure, status, inner.as_deref(), failed_over_all_nodes)
}

/// Build the terminal error straight from one decisive failure, bypassing
/// the retry/timeout precedence (startup gate, 401, cancellation).
pub(crate) fn from_context(
    request: &RequestData,
    trail: AuditTrail,
    ctx: FailureContext,
) -> PipelineError {
    build(request, trail, ctx.failure, ctx.status, Some(&ctx.message), false)
}

fn build(
    request: &RequestData,
    trail: AuditTrail,
    failure: PipelineFailure,
    status: Option<u16>,
    inner: Option<&str>,
    failed_over_all_nodes: bool,
) -> PipelineError {
    metrics::record_pipeline_failure(failure.as_str());
    PipelineError {
        failure,
        message: compose_message(request, failure, status, inner, failed_over_all_nodes),
        method: request.method,
        path: request.path.clone(),
        status,
        failed_over_all_nodes,
        audit_trail: trail,
    }
}

fn compose_message(
    request: &RequestData,
    failure: PipelineFailure,
    status: Option<u16>,
    inner: Option<&str>,
    failed_over_all_nodes: bool,
) -> String {
    let mut message = format!(
        "{}, attempted {} {}",
        describe(failure),
        request.method,
        request.path
    );
    if let Some(status) = status {
        message.push_str(&format!(" (status {status})"));
    }
    if failed_over_all_nodes {
        message.push_str(", failed over all known alive nodes");
    }
    if let Some(inner) = inner {
        message.push_str(": ");
        message.push_str(inner);
    }
    message
}

fn describe(failure: PipelineFailure) -> &'static str {
    match failure {
        PipelineFailure::BadRequest => "the request could not be sent",
        PipelineFailure::BadResponse => "a node returned an unusable response",
        PipelineFailure::BadAuthentication => "the server rejected the credentials",
        PipelineFailure::PingFailure => "a node failed its liveness probe",
        PipelineFailure::SniffFailure => "topology discovery failed on every candidate node",
        PipelineFailure::CouldNotStartSniffOnStartup => "could not begin the startup sniff",
        PipelineFailure::MaxTimeoutReached => "the request ran out of time",
        PipelineFailure::MaxRetriesReached => "the retry budget was exhausted",
        PipelineFailure::NoNodesAttempted => "no nodes were available to attempt",
        PipelineFailure::Unexpected => "the request failed unexpectedly",
    }
}

/// Aggregate every failed sniff attempt into one failure context.
pub(crate) fn sniff_failure_context(attempts: &[SniffAttempt]) -> FailureContext {
    let message = if attempts.is_empty() {
        "no sniff targets were available".to_string()
    } else {
        attempts
            .iter()
            .map(|a| format!("{}: {}", a.node, a.error))
            .collect::<Vec<_>>()
            .join("; ")
    };
    FailureContext { failure: PipelineFailure::SniffFailure, message, status: None }
}

/// Server-reported error reason, when the body is parseable as one.
/// Understands `{"error": {"reason": ".."}}` and `{"error": ".."}`.
pub(crate) fn server_error_reason(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match value.get("error")? {
        Value::String(reason) => Some(reason.clone()),
        Value::Object(map) => map
            .get("reason")
            .and_then(|reason| reason.as_str())
            .map(String::from),
        _ => None,
    }
}
