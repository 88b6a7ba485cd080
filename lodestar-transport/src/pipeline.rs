//! Per-request orchestration
//!
//! One `RequestPipeline` exists per logical request and never outlives it.
//! The pipeline walks the pool's candidate view, pings resurrected nodes,
//! delegates the call to the `Connection`, and folds terminal state into a
//! classified error. There is no background work: startup sniffs, staleness
//! sniffs, failure sniffs, pings and retries all run inside the calling
//! request's control flow.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::{AuditEvent, AuditTrail};
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::error::{PipelineFailure, Result};
use crate::failure::{self, FailureContext};
use crate::metrics;
use crate::node::Node;
use crate::pool::NodePool;
use crate::sniff::SniffService;
use crate::types::{HttpMethod, RawResponse, RequestData, TransportResponse};

/// Upper bound on view passes so refresh loops cannot spin forever
const MAX_VIEW_PASSES: usize = 5;

/// A request is out of time once this share of its budget is spent, so a
/// retry cannot blow past the caller-visible timeout while in flight
const SOFT_TIMEOUT_MARGIN_PERCENT: u32 = 98;

/// Entry point bound to a shared pool; builds one pipeline per call.
#[derive(Clone)]
pub struct Transport {
    pool: Arc<NodePool>,
    connection: Arc<dyn Connection>,
    config: Arc<TransportConfig>,
}

impl Transport {
    pub fn new(
        pool: Arc<NodePool>,
        connection: Arc<dyn Connection>,
        config: Arc<TransportConfig>,
    ) -> Self {
        Self { pool, connection, config }
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    pub async fn execute(&self, request: RequestData) -> Result<TransportResponse> {
        self.pipeline().execute(request).await
    }

    pub async fn execute_with_cancellation(
        &self,
        request: RequestData,
        token: CancellationToken,
    ) -> Result<TransportResponse> {
        self.pipeline().execute_with_cancellation(request, token).await
    }

    fn pipeline(&self) -> RequestPipeline {
        RequestPipeline::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.connection),
            Arc::clone(&self.config),
        )
    }
}

/// Outcome of one node attempt.
enum Attempt {
    Success(RawResponse, String),
    Failed(FailureContext),
    /// Decisive failure that must not be retried on other nodes
    ShortCircuit(FailureContext),
    Cancelled,
}

/// Why a pre-flight step could not complete.
enum PipelineStop {
    Failure(FailureContext),
    Cancelled,
}

/// One logical request's state machine. Cheap, request-scoped, never shared.
pub struct RequestPipeline {
    pool: Arc<NodePool>,
    connection: Arc<dyn Connection>,
    config: Arc<TransportConfig>,
    sniffer: SniffService,
    started_on: Instant,
    retried: u32,
    refresh: bool,
    trail: AuditTrail,
}

impl RequestPipeline {
    pub fn new(
        pool: Arc<NodePool>,
        connection: Arc<dyn Connection>,
        config: Arc<TransportConfig>,
    ) -> Self {
        let sniffer = SniffService::new(
            Arc::clone(&pool),
            Arc::clone(&connection),
            Arc::clone(&config),
        );
        Self {
            pool,
            connection,
            config,
            sniffer,
            started_on: Instant::now(),
            retried: 0,
            refresh: false,
            trail: AuditTrail::new(),
        }
    }

    /// Number of `mark_dead` calls caused by this request so far.
    pub fn retried(&self) -> u32 {
        self.retried
    }

    pub async fn execute(self, request: RequestData) -> Result<TransportResponse> {
        self.run(request, None).await
    }

    /// Identical decisions to `execute`; additionally observes the token at
    /// every suspension point, surfacing the partial audit trail when the
    /// request is aborted.
    pub async fn execute_with_cancellation(
        self,
        request: RequestData,
        token: CancellationToken,
    ) -> Result<TransportResponse> {
        self.run(request, Some(token)).await
    }

    async fn run(
        mut self,
        request: RequestData,
        token: Option<CancellationToken>,
    ) -> Result<TransportResponse> {
        let token = token.as_ref();
        let request_timeout = request
            .config
            .request_timeout
            .unwrap_or_else(|| self.config.request_timeout());

        debug!(
            request_id = %request.request_id,
            method = %request.method,
            path = %request.path,
            "executing request"
        );

        if self.startup_sniff_required() {
            if let Err(stop) = self.first_pool_usage(request_timeout, token).await {
                return Err(self.stopped(&request, stop));
            }
        }
        if self.stale_sniff_required() {
            if let Err(stop) = self.sniff_on_stale_cluster(token).await {
                return Err(self.stopped(&request, stop));
            }
        }

        // A force-node override pins the request to one node, no retries.
        if let Some(force) = request.config.force_node.clone() {
            let node = Arc::new(Node::new(&force)?);
            return match self.try_node(&node, &request, request_timeout, token).await {
                Attempt::Success(raw, served_by) => Ok(self.success(raw, served_by, &request)),
                Attempt::ShortCircuit(ctx) => Err(self.stopped(&request, PipelineStop::Failure(ctx))),
                Attempt::Failed(ctx) => Err(self.classified(&request, 0, request_timeout, Some(ctx))),
                Attempt::Cancelled => Err(self.stopped(&request, PipelineStop::Cancelled)),
            };
        }

        let max_retries = self.max_retries(&request);
        let mut attempted = 0usize;
        let mut last_failure: Option<FailureContext> = None;

        'passes: for _ in 0..MAX_VIEW_PASSES {
            let view = self.pool.create_view(self.pool.next_view_seed());
            let candidates: Vec<Arc<Node>> = match &self.config.node_predicate {
                Some(predicate) => view.into_iter().filter(|n| predicate.matches(n)).collect(),
                None => view,
            };

            let mut refreshed = false;
            for node in candidates {
                if self.depleted_retries(max_retries, request_timeout) {
                    break 'passes;
                }
                attempted += 1;
                match self.try_node(&node, &request, request_timeout, token).await {
                    Attempt::Success(raw, served_by) => {
                        return Ok(self.success(raw, served_by, &request))
                    }
                    Attempt::ShortCircuit(ctx) => {
                        return Err(self.stopped(&request, PipelineStop::Failure(ctx)))
                    }
                    Attempt::Failed(ctx) => last_failure = Some(ctx),
                    Attempt::Cancelled => return Err(self.stopped(&request, PipelineStop::Cancelled)),
                }
                // A successful sniff invalidated the current view; restart
                // against the fresh topology instead of finishing the pass.
                if self.refresh {
                    self.refresh = false;
                    refreshed = true;
                    break;
                }
            }
            if !refreshed {
                break;
            }
        }

        let depleted = self.depleted_retries(max_retries, request_timeout);
        if attempted == 0 && !depleted {
            // Nothing was ever yielded: empty pool or a predicate that
            // excludes every node. Distinct from exhausting a real view.
            self.trail.record(
                AuditEvent::NoNodesAttempted,
                None,
                Some(request.path.clone()),
                Instant::now(),
                None,
            );
            let ctx = FailureContext {
                failure: PipelineFailure::NoNodesAttempted,
                message: "the node pool yielded no candidates for this request".into(),
                status: None,
            };
            return Err(self.stopped(&request, PipelineStop::Failure(ctx)));
        }

        Err(self.classified(&request, max_retries, request_timeout, last_failure))
    }

    // ========================================
    // Pre-flight sniffing
    // ========================================

    fn startup_sniff_required(&self) -> bool {
        self.config.sniff_on_startup
            && self.pool.supports_reseeding()
            && !self.pool.sniffed_on_startup()
    }

    fn stale_sniff_required(&self) -> bool {
        let Some(lifespan) = self.config.sniff_lifespan() else {
            return false;
        };
        self.pool.supports_reseeding() && self.pool.last_update().elapsed() > lifespan
    }

    /// Gate the one-time startup sniff behind the pool-wide semaphore so
    /// racing first callers cannot double-sniff. A waiter that finds the
    /// sniff already done proceeds without sniffing again.
    async fn first_pool_usage(
        &mut self,
        request_timeout: Duration,
        token: Option<&CancellationToken>,
    ) -> std::result::Result<(), PipelineStop> {
        let pool = Arc::clone(&self.pool);
        let started = Instant::now();

        let acquired = wait_cancellable(
            token,
            tokio::time::timeout(request_timeout, pool.startup_gate().acquire()),
        )
        .await;
        let permit = match acquired {
            None => {
                self.trail
                    .record(AuditEvent::CancellationRequested, None, None, started, None);
                return Err(PipelineStop::Cancelled);
            }
            Some(Err(_elapsed)) => {
                let message = format!(
                    "could not acquire the startup sniff gate within {:?}",
                    request_timeout
                );
                self.trail.record(
                    AuditEvent::SniffOnStartup,
                    None,
                    None,
                    started,
                    Some(message.clone()),
                );
                return Err(PipelineStop::Failure(FailureContext {
                    failure: PipelineFailure::CouldNotStartSniffOnStartup,
                    message,
                    status: None,
                }));
            }
            Some(Ok(Err(_closed))) => {
                return Err(PipelineStop::Failure(FailureContext {
                    failure: PipelineFailure::CouldNotStartSniffOnStartup,
                    message: "the startup sniff gate is no longer available".into(),
                    status: None,
                }));
            }
            Some(Ok(Ok(permit))) => permit,
        };

        if self.pool.sniffed_on_startup() {
            drop(permit);
            return Ok(());
        }

        self.trail
            .record(AuditEvent::SniffOnStartup, None, None, started, None);
        let outcome = wait_cancellable(token, self.sniffer.sniff(&mut self.trail)).await;
        drop(permit);
        match outcome {
            None => {
                self.trail.record(
                    AuditEvent::CancellationRequested,
                    None,
                    None,
                    Instant::now(),
                    None,
                );
                Err(PipelineStop::Cancelled)
            }
            Some(Ok(_count)) => {
                self.pool.latch_sniffed_on_startup();
                self.refresh = false;
                Ok(())
            }
            Some(Err(attempts)) => {
                Err(PipelineStop::Failure(failure::sniff_failure_context(&attempts)))
            }
        }
    }

    async fn sniff_on_stale_cluster(
        &mut self,
        token: Option<&CancellationToken>,
    ) -> std::result::Result<(), PipelineStop> {
        let started = Instant::now();
        self.trail
            .record(AuditEvent::SniffOnStaleCluster, None, None, started, None);
        match wait_cancellable(token, self.sniffer.sniff(&mut self.trail)).await {
            None => {
                self.trail.record(
                    AuditEvent::CancellationRequested,
                    None,
                    None,
                    Instant::now(),
                    None,
                );
                Err(PipelineStop::Cancelled)
            }
            Some(Ok(_count)) => {
                self.refresh = false;
                Ok(())
            }
            Some(Err(attempts)) => {
                Err(PipelineStop::Failure(failure::sniff_failure_context(&attempts)))
            }
        }
    }

    /// Sniff after a failed call. Discovery failures here are absorbed into
    /// the audit trail; the request keeps failing over.
    async fn maybe_sniff_on_fail(
        &mut self,
        token: Option<&CancellationToken>,
    ) -> std::result::Result<(), ()> {
        if !(self.config.sniff_on_connection_fault && self.pool.supports_reseeding()) {
            return Ok(());
        }
        let started = Instant::now();
        self.trail
            .record(AuditEvent::SniffOnFail, None, None, started, None);
        match wait_cancellable(token, self.sniffer.sniff(&mut self.trail)).await {
            None => {
                self.trail.record(
                    AuditEvent::CancellationRequested,
                    None,
                    None,
                    Instant::now(),
                    None,
                );
                Err(())
            }
            Some(Ok(_count)) => {
                self.refresh = true;
                Ok(())
            }
            Some(Err(_attempts)) => Ok(()),
        }
    }

    // ========================================
    // Node iteration
    // ========================================

    async fn try_node(
        &mut self,
        node: &Arc<Node>,
        request: &RequestData,
        request_timeout: Duration,
        token: Option<&CancellationToken>,
    ) -> Attempt {
        let now = Instant::now();
        let resurrected = node.is_resurrected(now);
        if resurrected {
            self.trail
                .record(AuditEvent::Resurrection, Some(node.url()), None, now, None);
            debug!(node = %node.url(), "trying a dead node past its backoff window");
        }

        // Healthy nodes are never pinged; only a resurrected node has to
        // prove itself before carrying the real request.
        if self.should_ping(resurrected) {
            match self.ping(node, token).await {
                PingOutcome::Ok => {}
                PingOutcome::Cancelled => return Attempt::Cancelled,
                PingOutcome::Failed(message) => {
                    self.mark_node_dead(node, request);
                    if self.maybe_sniff_on_fail(token).await.is_err() {
                        return Attempt::Cancelled;
                    }
                    return Attempt::Failed(FailureContext {
                        failure: PipelineFailure::PingFailure,
                        message,
                        status: None,
                    });
                }
            }
        }

        let started = Instant::now();
        let mut call = request.clone();
        call.timeout = Some(request_timeout);
        match wait_cancellable(token, self.connection.request(node, &call)).await {
            None => {
                self.trail.record(
                    AuditEvent::CancellationRequested,
                    Some(node.url()),
                    Some(call.path.clone()),
                    started,
                    None,
                );
                Attempt::Cancelled
            }
            Some(Ok(response)) => {
                if response.status == 401 {
                    // Bad credentials cannot be fixed by failing over.
                    let message = format!("unauthorized response from {}", node.url());
                    self.trail.record(
                        AuditEvent::BadResponse,
                        Some(node.url()),
                        Some(call.path.clone()),
                        started,
                        Some(message.clone()),
                    );
                    return Attempt::ShortCircuit(FailureContext {
                        failure: PipelineFailure::BadAuthentication,
                        message,
                        status: Some(response.status),
                    });
                }

                let allowed = response.is_success()
                    || request.config.allowed_status_codes.contains(&response.status);
                metrics::record_request(request.method.as_str(), response.status, started.elapsed());
                if allowed {
                    node.mark_alive();
                    self.trail.record(
                        AuditEvent::HealthyResponse,
                        Some(node.url()),
                        Some(call.path.clone()),
                        started,
                        None,
                    );
                    Attempt::Success(response, node.url())
                } else {
                    let message = match failure::server_error_reason(&response.body) {
                        Some(reason) => format!(
                            "node {} returned status {}: {}",
                            node.url(),
                            response.status,
                            reason
                        ),
                        None => format!("node {} returned status {}", node.url(), response.status),
                    };
                    self.trail.record(
                        AuditEvent::BadResponse,
                        Some(node.url()),
                        Some(call.path.clone()),
                        started,
                        Some(message.clone()),
                    );
                    self.mark_node_dead(node, request);
                    if self.maybe_sniff_on_fail(token).await.is_err() {
                        return Attempt::Cancelled;
                    }
                    Attempt::Failed(FailureContext {
                        failure: PipelineFailure::BadResponse,
                        message,
                        status: Some(response.status),
                    })
                }
            }
            Some(Err(e)) => {
                // The transport never produced a response.
                let message =
                    format!("request to {} failed before a response was received: {e}", node.url());
                self.trail.record(
                    AuditEvent::BadRequest,
                    Some(node.url()),
                    Some(call.path.clone()),
                    started,
                    Some(message.clone()),
                );
                self.mark_node_dead(node, request);
                if self.maybe_sniff_on_fail(token).await.is_err() {
                    return Attempt::Cancelled;
                }
                Attempt::Failed(FailureContext {
                    failure: PipelineFailure::BadRequest,
                    message,
                    status: None,
                })
            }
        }
    }

    fn should_ping(&self, resurrected: bool) -> bool {
        !self.config.disable_pings && self.pool.supports_pinging() && resurrected
    }

    /// HEAD against the node root with the ping timeout.
    async fn ping(&mut self, node: &Arc<Node>, token: Option<&CancellationToken>) -> PingOutcome {
        let started = Instant::now();
        let mut probe = RequestData::new(HttpMethod::Head, "");
        probe.timeout = Some(self.config.ping_timeout());
        match wait_cancellable(token, self.connection.request(node, &probe)).await {
            None => {
                self.trail.record(
                    AuditEvent::CancellationRequested,
                    Some(node.url()),
                    None,
                    started,
                    None,
                );
                PingOutcome::Cancelled
            }
            Some(Ok(response)) if response.is_success() => {
                self.trail
                    .record(AuditEvent::PingSuccess, Some(node.url()), None, started, None);
                metrics::record_ping(true, started.elapsed());
                PingOutcome::Ok
            }
            Some(Ok(response)) => {
                let message = format!("ping of {} returned status {}", node.url(), response.status);
                self.trail.record(
                    AuditEvent::PingFailure,
                    Some(node.url()),
                    None,
                    started,
                    Some(message.clone()),
                );
                metrics::record_ping(false, started.elapsed());
                PingOutcome::Failed(message)
            }
            Some(Err(e)) => {
                let message = format!("ping of {} failed: {e}", node.url());
                self.trail.record(
                    AuditEvent::PingFailure,
                    Some(node.url()),
                    None,
                    started,
                    Some(message.clone()),
                );
                metrics::record_ping(false, started.elapsed());
                PingOutcome::Failed(message)
            }
        }
    }

    fn mark_node_dead(&mut self, node: &Node, request: &RequestData) {
        node.mark_dead(
            Instant::now(),
            self.config.dead_timeout(),
            self.config.max_dead_timeout(),
        );
        self.retried += 1;
        metrics::record_node_dead(node.failed_attempts());
        warn!(
            node = %node.url(),
            request_id = %request.request_id,
            failed_attempts = node.failed_attempts(),
            "marked node dead"
        );
    }

    // ========================================
    // Budgets
    // ========================================

    fn max_retries(&self, request: &RequestData) -> u32 {
        if request.config.force_node.is_some() {
            return 0;
        }
        request
            .config
            .max_retries
            .or(self.config.max_retries)
            .unwrap_or(u32::MAX)
            .min(self.pool.max_retries())
    }

    fn effective_budget(&self, request_timeout: Duration) -> Duration {
        self.config.max_retry_timeout().min(request_timeout)
    }

    fn is_taking_too_long(&self, request_timeout: Duration) -> bool {
        let budget = self.effective_budget(request_timeout);
        let margin = budget.mul_f64(f64::from(SOFT_TIMEOUT_MARGIN_PERCENT) / 100.0);
        self.started_on.elapsed() >= margin
    }

    fn depleted_retries(&self, max_retries: u32, request_timeout: Duration) -> bool {
        self.retried >= max_retries.saturating_add(1) || self.is_taking_too_long(request_timeout)
    }

    // ========================================
    // Terminal assembly
    // ========================================

    fn success(
        &mut self,
        raw: RawResponse,
        served_by: String,
        request: &RequestData,
    ) -> TransportResponse {
        let success = raw.is_success();
        TransportResponse {
            status: raw.status,
            headers: raw.headers,
            body: raw.body,
            node: served_by,
            success,
            success_or_known_error: success
                || request.config.allowed_status_codes.contains(&raw.status),
            audit_trail: std::mem::take(&mut self.trail),
        }
    }

    fn stopped(&mut self, request: &RequestData, stop: PipelineStop) -> crate::error::TransportError {
        let ctx = match stop {
            PipelineStop::Failure(ctx) => ctx,
            PipelineStop::Cancelled => FailureContext {
                failure: PipelineFailure::Unexpected,
                message: "the request was cancelled before completion".into(),
                status: None,
            },
        };
        let trail = std::mem::take(&mut self.trail);
        failure::from_context(request, trail, ctx).into()
    }

    fn classified(
        &mut self,
        request: &RequestData,
        max_retries: u32,
        request_timeout: Duration,
        last: Option<FailureContext>,
    ) -> crate::error::TransportError {
        let now = Instant::now();
        let reachable = self
            .pool
            .nodes()
            .iter()
            .filter(|n| n.is_reachable(now))
            .count();
        let taking_too_long = self.is_taking_too_long(request_timeout);
        let trail = std::mem::take(&mut self.trail);
        failure::classify(
            request,
            trail,
            taking_too_long,
            self.retried,
            max_retries,
            reachable,
            last,
        )
        .into()
    }
}

enum PingOutcome {
    Ok,
    Failed(String),
    Cancelled,
}

/// Await `fut` unless the cancellation token fires first. Cancellation wins
/// deterministically when both are ready.
async fn wait_cancellable<F>(token: Option<&CancellationToken>, fut: F) -> Option<F::Output>
where
    F: Future,
{
    match token {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                output = fut => Some(output),
            }
        }
        None => Some(fut.await),
    }
}
