//! The byte-level transport boundary
//!
//! The pipeline does not know how bytes reach the wire; it hands a
//! `RequestData` and a target `Node` to a `Connection` and classifies
//! whatever comes back. `HttpConnection` is the reqwest-backed default.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::{ConnectionError, Result, TransportError};
use crate::node::Node;
use crate::types::{HttpMethod, RawResponse, RequestData};

/// Issues one HTTP exchange against a node.
#[async_trait]
pub trait Connection: Send + Sync {
    /// An `Err` means no response was received at all; any received status,
    /// including a failure status, is an `Ok`.
    async fn request(
        &self,
        node: &Node,
        request: &RequestData,
    ) -> std::result::Result<RawResponse, ConnectionError>;
}

/// Production connection on reqwest with rustls.
pub struct HttpConnection {
    client: reqwest::Client,
}

impl HttpConnection {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }

    /// Wrap an already-configured reqwest client (custom TLS, proxies, ...).
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn request(
        &self,
        node: &Node,
        request: &RequestData,
    ) -> std::result::Result<RawResponse, ConnectionError> {
        let url = format!("{}/{}", node.url(), request.path.trim_start_matches('/'));
        let mut builder = self.client.request(to_reqwest_method(request.method), &url);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ConnectionError::Timeout(e.to_string())
            } else {
                ConnectionError::Failed(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ConnectionError::Failed(format!("failed to read response body: {e}")))?;

        Ok(RawResponse { status, headers, body })
    }
}
