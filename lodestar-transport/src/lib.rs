//! Lodestar Transport - cluster-aware request routing for distributed
//! search engines
//!
//! This crate is the transport core of a search cluster client: it decides
//! which node to contact, retries and fails over across nodes, discovers
//! cluster topology ("sniffing"), and classifies failures into a stable
//! taxonomy for callers.
//!
//! # Architecture
//!
//! - **Node / NodePool**: liveness-tracked endpoints behind an atomically
//!   swapped snapshot, with rotated round-robin views
//! - **SniffService**: topology discovery against the cluster's nodes-info
//!   API, reseeding the pool with whatever the cluster reports
//! - **RequestPipeline**: one request's state machine: startup sniffing,
//!   node iteration, pings for resurrected nodes, retry and time budgets
//! - **AuditTrail**: timestamped record of every event during a request,
//!   attached to responses and errors alike
//! - **Connection**: the byte-level HTTP boundary; `HttpConnection` is the
//!   reqwest-backed default
//!
//! # Example
//!
//! ```ignore
//! use lodestar_transport::{
//!     HttpConnection, HttpMethod, NodePool, RequestData, Transport, TransportConfig,
//! };
//! use std::sync::Arc;
//!
//! let pool = Arc::new(NodePool::sniffing(["http://127.0.0.1:9200"])?);
//! let connection = Arc::new(HttpConnection::new()?);
//! let transport = Transport::new(pool, connection, Arc::new(TransportConfig::default()));
//!
//! let response = transport
//!     .execute(RequestData::new(HttpMethod::Get, "_cluster/health"))
//!     .await?;
//! println!("{} via {}", response.status, response.node);
//! ```

pub mod address;
pub mod audit;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod node;
pub mod pool;
pub mod sniff;
pub mod types;

mod failure;
mod pipeline;

pub use address::{parse_publish_address, PublishAddress};
pub use audit::{Audit, AuditEvent, AuditTrail};
pub use config::{NodePredicate, RequestConfig, TransportConfig};
pub use connection::{Connection, HttpConnection};
pub use error::{
    ConnectionError, PipelineError, PipelineFailure, Result, SniffAttempt, TransportError,
};
pub use node::Node;
pub use pipeline::{RequestPipeline, Transport};
pub use pool::NodePool;
pub use sniff::{NodesInfoResponse, SniffService, SNIFF_PATH};
pub use types::{HttpMethod, RawResponse, RequestData, TransportResponse};
