//! End-to-end failover tests for the request pipeline.
//!
//! Each test drives a real `Transport` over a scripted `Connection` that
//! answers per node and per request kind (API call, ping probe, sniff),
//! then asserts on the audit trail, the pool state and the wire calls.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lodestar_transport::{
    AuditEvent, AuditTrail, Connection, ConnectionError, HttpMethod, Node, NodePool,
    NodePredicate, PipelineError, PipelineFailure, RawResponse, RequestData, Transport,
    TransportConfig, TransportError, SNIFF_PATH,
};

#[derive(Clone)]
enum Scripted {
    Respond(u16, &'static str),
    Fail(&'static str),
}

/// Connection double that answers from per-port scripts. Unscripted calls
/// answer `200 {}` so healthy-path traffic needs no setup.
#[derive(Default)]
struct ScriptedConnection {
    api: Mutex<HashMap<u16, VecDeque<Scripted>>>,
    ping: Mutex<HashMap<u16, VecDeque<Scripted>>>,
    sniff: Mutex<HashMap<u16, VecDeque<Scripted>>>,
    calls: Mutex<Vec<(u16, String, String)>>,
}

impl ScriptedConnection {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script_api(&self, port: u16, result: Scripted) {
        self.api.lock().entry(port).or_default().push_back(result);
    }

    fn script_ping(&self, port: u16, result: Scripted) {
        self.ping.lock().entry(port).or_default().push_back(result);
    }

    fn script_sniff(&self, port: u16, result: Scripted) {
        self.sniff.lock().entry(port).or_default().push_back(result);
    }

    fn calls(&self) -> Vec<(u16, String, String)> {
        self.calls.lock().clone()
    }

    fn sniff_calls(&self) -> Vec<u16> {
        self.calls()
            .into_iter()
            .filter(|(_, _, path)| path == SNIFF_PATH)
            .map(|(port, _, _)| port)
            .collect()
    }

    fn ping_calls(&self) -> Vec<u16> {
        self.calls()
            .into_iter()
            .filter(|(_, method, _)| method == "HEAD")
            .map(|(port, _, _)| port)
            .collect()
    }

    fn api_calls(&self) -> Vec<u16> {
        self.calls()
            .into_iter()
            .filter(|(_, method, path)| path != SNIFF_PATH && method != "HEAD")
            .map(|(port, _, _)| port)
            .collect()
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn request(
        &self,
        node: &Node,
        request: &RequestData,
    ) -> Result<RawResponse, ConnectionError> {
        let port = node.port();
        self.calls
            .lock()
            .push((port, request.method.to_string(), request.path.clone()));

        let scripted = if request.path == SNIFF_PATH {
            self.sniff.lock().get_mut(&port).and_then(|q| q.pop_front())
        } else if request.method == HttpMethod::Head && request.path.is_empty() {
            self.ping.lock().get_mut(&port).and_then(|q| q.pop_front())
        } else {
            self.api.lock().get_mut(&port).and_then(|q| q.pop_front())
        };

        match scripted.unwrap_or(Scripted::Respond(200, "{}")) {
            Scripted::Respond(status, body) => Ok(RawResponse {
                status,
                headers: HashMap::new(),
                body: Bytes::from_static(body.as_bytes()),
            }),
            Scripted::Fail(message) => Err(ConnectionError::Failed(message.into())),
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn events(trail: &AuditTrail) -> Vec<AuditEvent> {
    trail.events().iter().map(|a| a.event).collect()
}

fn event_ports(trail: &AuditTrail) -> Vec<Option<u16>> {
    trail
        .events()
        .iter()
        .map(|a| {
            a.node
                .as_deref()
                .and_then(|url| url.rsplit(':').next())
                .and_then(|port| port.parse().ok())
        })
        .collect()
}

fn pipeline_error(err: TransportError) -> PipelineError {
    match err {
        TransportError::Pipeline(err) => *err,
        other => panic!("expected pipeline error, got {other:?}"),
    }
}

fn pool_ports(pool: &NodePool) -> Vec<u16> {
    pool.nodes().iter().map(|n| n.port()).collect()
}

fn get(path: &str) -> RequestData {
    RequestData::new(HttpMethod::Get, path)
}

/// Nodes-info document for a three-node cluster on 9210-9212, managers on
/// 9210 and 9211.
const THREE_NODE_DOC: &str = r#"{
    "cluster_name": "search-cluster",
    "nodes": {
        "n1": {"name": "one", "roles": ["cluster_manager", "data"], "http": {"publish_address": "127.0.0.1:9210"}},
        "n2": {"name": "two", "roles": ["cluster_manager", "data"], "http": {"publish_address": "127.0.0.1:9211"}},
        "n3": {"name": "three", "roles": ["data"], "http": {"publish_address": "127.0.0.1:9212"}}
    }
}"#;

#[tokio::test]
async fn test_sniff_adopts_returned_topology() {
    init_tracing();
    let conn = ScriptedConnection::new();
    conn.script_sniff(9200, Scripted::Respond(200, THREE_NODE_DOC));

    let pool = Arc::new(NodePool::sniffing(["http://127.0.0.1:9200"]).unwrap());
    let config = Arc::new(TransportConfig {
        sniff_on_connection_fault: false,
        disable_pings: true,
        ..Default::default()
    });
    let transport = Transport::new(Arc::clone(&pool), conn.clone(), config);

    let response = transport.execute(get("_cluster/health")).await.unwrap();

    // One seed sniffed once, the pool now holds exactly the reported set
    assert_eq!(conn.sniff_calls(), vec![9200]);
    assert_eq!(pool.len(), 3);
    assert_eq!(pool_ports(&pool), vec![9210, 9211, 9212]);

    // The very next node contacted came from the new set
    assert_eq!(conn.api_calls(), vec![9210]);
    assert_eq!(
        events(&response.audit_trail),
        vec![AuditEvent::SniffOnStartup, AuditEvent::SniffSuccess, AuditEvent::HealthyResponse]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_startup_sniff_happens_exactly_once_across_concurrent_requests() {
    let conn = ScriptedConnection::new();
    conn.script_sniff(9200, Scripted::Respond(200, THREE_NODE_DOC));

    let pool = Arc::new(NodePool::sniffing(["http://127.0.0.1:9200"]).unwrap());
    let config = Arc::new(TransportConfig {
        sniff_on_connection_fault: false,
        disable_pings: true,
        ..Default::default()
    });
    let transport = Transport::new(Arc::clone(&pool), conn.clone(), config);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let transport = transport.clone();
        handles.push(tokio::spawn(async move {
            transport.execute(get("_cluster/health")).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(conn.sniff_calls(), vec![9200]);
    assert!(pool.sniffed_on_startup());

    // Later requests skip the gate entirely
    transport.execute(get("_cluster/health")).await.unwrap();
    assert_eq!(conn.sniff_calls(), vec![9200]);
}

#[tokio::test]
async fn test_sniff_prefers_cluster_managers_with_fallback() {
    let conn = ScriptedConnection::new();
    conn.script_sniff(9202, Scripted::Fail("connection refused"));
    conn.script_sniff(9203, Scripted::Fail("connection refused"));
    conn.script_sniff(9200, Scripted::Respond(200, THREE_NODE_DOC));

    let nodes = vec![
        Node::with_roles("http://127.0.0.1:9200", false, true).unwrap(),
        Node::with_roles("http://127.0.0.1:9202", true, true).unwrap(),
        Node::with_roles("http://127.0.0.1:9203", true, true).unwrap(),
    ];
    let pool = Arc::new(NodePool::sniffing_from_nodes(nodes).unwrap());
    let config = Arc::new(TransportConfig {
        sniff_on_connection_fault: false,
        disable_pings: true,
        ..Default::default()
    });
    let transport = Transport::new(Arc::clone(&pool), conn.clone(), config);

    transport.execute(get("_cluster/health")).await.unwrap();

    // Manager-eligible targets first (ascending port), then the data node
    assert_eq!(conn.sniff_calls(), vec![9202, 9203, 9200]);
    assert_eq!(pool.len(), 3);
}

#[tokio::test]
async fn test_startup_sniff_failure_aggregates_every_attempt() {
    let conn = ScriptedConnection::new();
    conn.script_sniff(9200, Scripted::Fail("connection refused"));
    conn.script_sniff(9201, Scripted::Fail("connection reset"));

    let pool =
        Arc::new(NodePool::sniffing(["http://127.0.0.1:9200", "http://127.0.0.1:9201"]).unwrap());
    let config = Arc::new(TransportConfig {
        sniff_on_connection_fault: false,
        disable_pings: true,
        ..Default::default()
    });
    let transport = Transport::new(pool, conn.clone(), config);

    let err = pipeline_error(transport.execute(get("_search")).await.unwrap_err());

    assert_eq!(err.failure, PipelineFailure::SniffFailure);
    assert!(err.message.contains("http://127.0.0.1:9200"));
    assert!(err.message.contains("http://127.0.0.1:9201"));
    assert_eq!(
        events(&err.audit_trail),
        vec![AuditEvent::SniffOnStartup, AuditEvent::SniffFailure, AuditEvent::SniffFailure]
    );
    assert!(conn.api_calls().is_empty());
}

#[tokio::test]
async fn test_predicate_scopes_api_calls_but_not_sniffing() {
    let conn = ScriptedConnection::new();
    conn.script_sniff(9200, Scripted::Respond(200, THREE_NODE_DOC));

    let pool = Arc::new(NodePool::sniffing(["http://127.0.0.1:9200"]).unwrap());
    let config = Arc::new(TransportConfig {
        sniff_on_connection_fault: false,
        disable_pings: true,
        node_predicate: Some(NodePredicate::new(|_| false)),
        ..Default::default()
    });
    let transport = Transport::new(Arc::clone(&pool), conn.clone(), config);

    let err = pipeline_error(transport.execute(get("_search")).await.unwrap_err());

    // The startup sniff still reached a node the predicate rejects
    assert_eq!(conn.sniff_calls(), vec![9200]);
    assert_eq!(pool.len(), 3);

    // ...but no API call was ever attempted
    assert_eq!(err.failure, PipelineFailure::NoNodesAttempted);
    assert!(conn.api_calls().is_empty());
    assert!(events(&err.audit_trail).contains(&AuditEvent::NoNodesAttempted));
}

#[tokio::test]
async fn test_healthy_nodes_are_never_pinged() {
    let conn = ScriptedConnection::new();
    let pool = Arc::new(NodePool::static_pool(["http://127.0.0.1:9200"]).unwrap());
    let config = Arc::new(TransportConfig {
        sniff_on_startup: false,
        sniff_on_connection_fault: false,
        ..Default::default()
    });
    let transport = Transport::new(pool, conn.clone(), config);

    transport.execute(get("_search")).await.unwrap();
    transport.execute(get("_search")).await.unwrap();

    assert!(conn.ping_calls().is_empty());
    assert_eq!(conn.api_calls().len(), 2);
}

#[tokio::test]
async fn test_resurrected_node_is_pinged_exactly_once() {
    let conn = ScriptedConnection::new();
    let pool = Arc::new(NodePool::static_pool(["http://127.0.0.1:9200"]).unwrap());

    // Dead with a zero-length window, so the backoff has already elapsed
    pool.nodes()[0].mark_dead(Instant::now(), Duration::ZERO, Duration::ZERO);

    let config = Arc::new(TransportConfig {
        sniff_on_startup: false,
        sniff_on_connection_fault: false,
        ..Default::default()
    });
    let transport = Transport::new(Arc::clone(&pool), conn.clone(), config);

    let response = transport.execute(get("_search")).await.unwrap();
    assert_eq!(conn.ping_calls(), vec![9200]);
    assert_eq!(
        events(&response.audit_trail),
        vec![AuditEvent::Resurrection, AuditEvent::PingSuccess, AuditEvent::HealthyResponse]
    );

    // The node proved itself; its next use is not pinged again
    transport.execute(get("_search")).await.unwrap();
    assert_eq!(conn.ping_calls(), vec![9200]);
    assert_eq!(conn.api_calls().len(), 2);
}

#[tokio::test]
async fn test_failed_ping_fails_over_to_next_resurrected_node() {
    let conn = ScriptedConnection::new();
    conn.script_ping(9200, Scripted::Fail("connection refused"));

    let pool = Arc::new(
        NodePool::static_pool(["http://127.0.0.1:9200", "http://127.0.0.1:9201"]).unwrap(),
    );
    for node in pool.nodes().iter() {
        node.mark_dead(Instant::now(), Duration::ZERO, Duration::ZERO);
    }

    let config = Arc::new(TransportConfig {
        sniff_on_startup: false,
        sniff_on_connection_fault: false,
        ..Default::default()
    });
    let transport = Transport::new(pool, conn.clone(), config);

    let response = transport.execute(get("_search")).await.unwrap();

    assert_eq!(conn.ping_calls(), vec![9200, 9201]);
    assert_eq!(conn.api_calls(), vec![9201]);
    assert_eq!(
        events(&response.audit_trail),
        vec![
            AuditEvent::Resurrection,
            AuditEvent::PingFailure,
            AuditEvent::Resurrection,
            AuditEvent::PingSuccess,
            AuditEvent::HealthyResponse
        ]
    );
}

#[tokio::test]
async fn test_stale_topology_sniffs_before_dispatch() {
    let conn = ScriptedConnection::new();
    conn.script_sniff(9200, Scripted::Respond(200, THREE_NODE_DOC));

    let pool = Arc::new(NodePool::sniffing(["http://127.0.0.1:9200"]).unwrap());
    let config = Arc::new(TransportConfig {
        sniff_on_startup: false,
        sniff_on_connection_fault: false,
        sniff_lifespan_ms: Some(0),
        disable_pings: true,
        ..Default::default()
    });
    let transport = Transport::new(Arc::clone(&pool), conn.clone(), config);

    let response = transport.execute(get("_search")).await.unwrap();

    assert_eq!(pool.len(), 3);
    assert_eq!(
        events(&response.audit_trail),
        vec![
            AuditEvent::SniffOnStaleCluster,
            AuditEvent::SniffSuccess,
            AuditEvent::HealthyResponse
        ]
    );
}

/// Observed end-to-end scenario: a five-node pool with managers on
/// 9202-9204, pings and startup sniffing disabled. The first request lands
/// healthy on 9200. The second fails once on 9201, sniffs on failure via
/// 9202, adopts a three-node cluster, and completes on 9200.
#[tokio::test]
async fn test_sniff_on_fail_reseeds_and_completes() {
    init_tracing();
    const SCENARIO_DOC: &str = r#"{
        "cluster_name": "search-cluster",
        "nodes": {
            "m1": {"name": "m1", "roles": ["cluster_manager", "data"], "http": {"publish_address": "127.0.0.1:9202"}},
            "m2": {"name": "m2", "roles": ["cluster_manager", "data"], "http": {"publish_address": "127.0.0.1:9203"}},
            "d1": {"name": "d1", "roles": ["data"], "http": {"publish_address": "127.0.0.1:9200"}}
        }
    }"#;

    let conn = ScriptedConnection::new();
    conn.script_api(9201, Scripted::Respond(500, "{}"));
    conn.script_sniff(9202, Scripted::Respond(200, SCENARIO_DOC));

    let nodes = vec![
        Node::with_roles("http://127.0.0.1:9200", false, true).unwrap(),
        Node::with_roles("http://127.0.0.1:9201", false, true).unwrap(),
        Node::with_roles("http://127.0.0.1:9202", true, true).unwrap(),
        Node::with_roles("http://127.0.0.1:9203", true, true).unwrap(),
        Node::with_roles("http://127.0.0.1:9204", true, true).unwrap(),
    ];
    let pool = Arc::new(NodePool::sniffing_from_nodes(nodes).unwrap());
    assert_eq!(pool.len(), 5);

    let config = Arc::new(TransportConfig {
        sniff_on_startup: false,
        sniff_on_connection_fault: true,
        disable_pings: true,
        ..Default::default()
    });
    let transport = Transport::new(Arc::clone(&pool), conn.clone(), config);

    let first = transport.execute(get("_search")).await.unwrap();
    assert_eq!(events(&first.audit_trail), vec![AuditEvent::HealthyResponse]);
    assert_eq!(event_ports(&first.audit_trail), vec![Some(9200)]);

    let second = transport.execute(get("_search")).await.unwrap();
    assert_eq!(
        events(&second.audit_trail),
        vec![
            AuditEvent::BadResponse,
            AuditEvent::SniffOnFail,
            AuditEvent::SniffSuccess,
            AuditEvent::HealthyResponse
        ]
    );
    assert_eq!(
        event_ports(&second.audit_trail),
        vec![Some(9201), None, Some(9202), Some(9200)]
    );

    assert_eq!(pool.len(), 3);
    assert_eq!(pool_ports(&pool), vec![9202, 9203, 9200]);
}
