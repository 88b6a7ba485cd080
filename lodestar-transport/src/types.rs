//! Request and response types crossing the transport boundary

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::config::RequestConfig;

/// HTTP method of a transport request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical request handed to the pipeline.
#[derive(Debug, Clone)]
pub struct RequestData {
    /// Correlation id recorded in logs and diagnostics
    pub request_id: Uuid,
    pub method: HttpMethod,
    /// Path relative to the node root, e.g. `my-index/_search`
    pub path: String,
    pub body: Option<Bytes>,
    pub headers: HashMap<String, String>,
    /// Per-call timeout handed to the connection; resolved by the pipeline
    pub timeout: Option<Duration>,
    /// Per-request overrides
    pub config: RequestConfig,
}

impl RequestData {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            method,
            path: path.into(),
            body: None,
            headers: HashMap::new(),
            timeout: None,
            config: RequestConfig::default(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_config(mut self, config: RequestConfig) -> Self {
        self.config = config;
        self
    }
}

/// Raw response as reported by a `Connection`.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Response handed back to the caller, with the audit trail attached.
#[derive(Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// URL of the node that served the request
    pub node: String,
    /// Everything that happened while executing the request
    pub audit_trail: AuditTrail,
    /// Status was 2xx
    pub success: bool,
    /// Status was 2xx or explicitly allowed by the request
    pub success_or_known_error: bool,
}
