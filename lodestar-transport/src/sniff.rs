//! Topology discovery ("sniffing")
//!
//! Queries the cluster's nodes-info API on candidate nodes until one
//! answers, then reseeds the pool with the reported topology. Targets are
//! tried cluster-manager-eligible first so discovery prefers nodes that
//! actually coordinate the cluster, but falls back to any node.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::address;
use crate::audit::{AuditEvent, AuditTrail};
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::error::SniffAttempt;
use crate::metrics;
use crate::node::Node;
use crate::pool::NodePool;
use crate::types::{HttpMethod, RequestData};

/// Path of the lightweight topology endpoint
pub const SNIFF_PATH: &str = "_nodes/http,settings";

/// Wire shape of the nodes-info document. Only what the transport needs;
/// everything else in the response is ignored.
#[derive(Debug, Deserialize)]
pub struct NodesInfoResponse {
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub nodes: HashMap<String, NodeInfo>,
}

#[derive(Debug, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub http: Option<HttpInfo>,
    #[serde(default)]
    pub settings: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct HttpInfo {
    #[serde(default)]
    pub publish_address: Option<String>,
}

/// Executes the sniff protocol and reseeds the pool on success.
pub struct SniffService {
    pool: Arc<NodePool>,
    connection: Arc<dyn Connection>,
    config: Arc<TransportConfig>,
}

impl SniffService {
    pub fn new(
        pool: Arc<NodePool>,
        connection: Arc<dyn Connection>,
        config: Arc<TransportConfig>,
    ) -> Self {
        Self { pool, connection, config }
    }

    /// Discover topology and reseed the pool, recording one audit event per
    /// attempted target. Returns the adopted node count, or every failed
    /// attempt when no target answered usefully.
    pub async fn sniff(
        &self,
        trail: &mut AuditTrail,
    ) -> std::result::Result<usize, Vec<SniffAttempt>> {
        let mut attempts = Vec::new();
        for target in self.pool.sniff_targets() {
            let started = Instant::now();
            let request = sniff_request(&self.config);
            let failure = match self.connection.request(&target, &request).await {
                Ok(response) if response.is_success() => {
                    match nodes_from_response(&response.body, target.scheme()) {
                        Ok(nodes) if !nodes.is_empty() => {
                            let count = nodes.len();
                            self.pool.reseed(nodes);
                            trail.record(
                                AuditEvent::SniffSuccess,
                                Some(target.url()),
                                Some(SNIFF_PATH.to_string()),
                                started,
                                None,
                            );
                            metrics::record_sniff(true);
                            debug!(node = %target.url(), count, "sniff adopted new topology");
                            return Ok(count);
                        }
                        Ok(_) => "nodes-info response contained no usable nodes".to_string(),
                        Err(e) => format!("failed to parse nodes-info response: {e}"),
                    }
                }
                Ok(response) => format!("nodes-info request returned status {}", response.status),
                Err(e) => e.to_string(),
            };

            debug!(node = %target.url(), error = %failure, "sniff target failed");
            trail.record(
                AuditEvent::SniffFailure,
                Some(target.url()),
                Some(SNIFF_PATH.to_string()),
                started,
                Some(failure.clone()),
            );
            attempts.push(SniffAttempt { node: target.url(), error: failure });
        }

        warn!(attempts = attempts.len(), "sniff failed on every candidate node");
        metrics::record_sniff(false);
        Err(attempts)
    }
}

fn sniff_request(config: &TransportConfig) -> RequestData {
    let mut request = RequestData::new(HttpMethod::Get, SNIFF_PATH);
    request.timeout = Some(config.request_timeout());
    request
}

/// Build pool nodes from a nodes-info document. Nodes without a published
/// http address cannot serve the client protocol and are dropped. The
/// adopted order is deterministic: cluster-manager-eligible first, then
/// ascending port.
pub fn nodes_from_response(body: &[u8], scheme: &str) -> serde_json::Result<Vec<Node>> {
    let parsed: NodesInfoResponse = serde_json::from_slice(body)?;
    let mut nodes = Vec::new();
    for (id, info) in &parsed.nodes {
        let Some(published) = info.http.as_ref().and_then(|h| h.publish_address.as_deref()) else {
            debug!(node = %id, "skipping node without a published http address");
            continue;
        };
        let Some(parsed_address) = address::parse_publish_address(published) else {
            warn!(node = %id, address = %published, "skipping node with unparseable publish address");
            continue;
        };

        let cluster_manager_eligible = info
            .roles
            .iter()
            .any(|role| role == "cluster_manager" || role == "master");
        let holds_data = info
            .roles
            .iter()
            .any(|role| role == "data" || role.starts_with("data_"));

        let mut settings = HashMap::new();
        if let Some(value) = &info.settings {
            flatten_settings("", value, &mut settings);
        }

        nodes.push(Node::sniffed(
            scheme,
            parsed_address.host(),
            parsed_address.port,
            Some(id.clone()),
            info.name.clone(),
            cluster_manager_eligible,
            holds_data,
            settings,
            Some(published.to_string()),
        ));
    }
    nodes.sort_by_key(|n| (!n.cluster_manager_eligible(), n.port()));
    Ok(nodes)
}

/// Flatten nested settings objects into dotted string keys.
fn flatten_settings(prefix: &str, value: &Value, out: &mut HashMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_settings(&key, nested, out);
            }
        }
        Value::Null => {}
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes_info_json() -> &'static str {
        r#"{
            "cluster_name": "search-cluster",
            "nodes": {
                "a1": {
                    "name": "node-a",
                    "roles": ["cluster_manager", "data", "ingest"],
                    "http": {"publish_address": "10.0.0.1:9202"},
                    "settings": {"cluster": {"name": "search-cluster"}, "node": {"attr": {"zone": "eu-1"}}}
                },
                "b2": {
                    "name": "node-b",
                    "roles": ["data_hot"],
                    "http": {"publish_address": "search.local/10.0.0.2:9200"}
                },
                "c3": {
                    "name": "node-c",
                    "roles": ["cluster_manager"]
                },
                "d4": {
                    "name": "node-d",
                    "roles": ["master"],
                    "http": {"publish_address": "10.0.0.4:9201"}
                }
            }
        }"#
    }

    #[test]
    fn test_parse_topology() {
        let nodes = nodes_from_response(nodes_info_json().as_bytes(), "http").unwrap();

        // node-c publishes no http address and is dropped
        assert_eq!(nodes.len(), 3);

        // manager-eligible first, ascending port
        let ports: Vec<u16> = nodes.iter().map(|n| n.port()).collect();
        assert_eq!(ports, vec![9201, 9202, 9200]);

        let by_id = |id: &str| nodes.iter().find(|n| n.id() == Some(id)).unwrap();
        assert!(by_id("a1").cluster_manager_eligible());
        assert!(by_id("a1").holds_data());
        assert!(by_id("d4").cluster_manager_eligible());
        assert!(!by_id("d4").holds_data());
        assert!(!by_id("b2").cluster_manager_eligible());
        assert!(by_id("b2").holds_data());
    }

    #[test]
    fn test_fqdn_preferred_for_dialing() {
        let nodes = nodes_from_response(nodes_info_json().as_bytes(), "https").unwrap();
        let b2 = nodes.iter().find(|n| n.id() == Some("b2")).unwrap();
        assert_eq!(b2.host(), "search.local");
        assert_eq!(b2.url(), "https://search.local:9200");
        assert_eq!(b2.publish_address(), Some("search.local/10.0.0.2:9200"));
    }

    #[test]
    fn test_settings_are_flattened() {
        let nodes = nodes_from_response(nodes_info_json().as_bytes(), "http").unwrap();
        let a1 = nodes.iter().find(|n| n.id() == Some("a1")).unwrap();
        assert_eq!(a1.settings().get("cluster.name").map(String::as_str), Some("search-cluster"));
        assert_eq!(a1.settings().get("node.attr.zone").map(String::as_str), Some("eu-1"));
    }

    #[test]
    fn test_empty_and_malformed_bodies() {
        assert!(nodes_from_response(b"{}", "http").unwrap().is_empty());
        assert!(nodes_from_response(b"not json", "http").is_err());
    }

    #[test]
    fn test_flatten_scalars() {
        let mut out = HashMap::new();
        flatten_settings(
            "",
            &serde_json::json!({"a": {"b": 1, "c": true}, "d": "x"}),
            &mut out,
        );
        assert_eq!(out.get("a.b").map(String::as_str), Some("1"));
        assert_eq!(out.get("a.c").map(String::as_str), Some("true"));
        assert_eq!(out.get("d").map(String::as_str), Some("x"));
    }
}
