//! HTTP transport used by the request orchestrator
//!
//! The orchestrator only needs "send this request, give me status, headers and
//! body". [`Transport`] is that seam; [`ReqwestTransport`] is the production
//! implementation and tests plug in their own.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, Method, Proxy};
use thiserror::Error;

/// Multi-valued headers keyed by lowercase name
pub type Headers = BTreeMap<String, Vec<String>>;

/// Errors raised before a response could be obtained
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Proxy URL could not be used
    #[error("Invalid proxy URL '{url}': {reason}")]
    InvalidProxy { url: String, reason: String },

    /// Anything a non-reqwest transport needs to report
    #[error("{0}")]
    Other(String),
}

/// A fully prepared outbound request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub params: BTreeMap<String, String>,
    pub headers: Headers,
    pub payload: Option<Vec<u8>>,
}

/// A response as seen by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Sends prepared requests
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Transport backed by a shared `reqwest::Client`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Creates a transport, routing all calls through `proxy_url` when given
    pub fn new(proxy_url: Option<&str>) -> Result<Self, TransportError> {
        let mut builder = Client::builder();
        if let Some(url) = proxy_url.filter(|url| !url.is_empty()) {
            let proxy = Proxy::all(url).map_err(|e| TransportError::InvalidProxy {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            builder = builder.proxy(proxy);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Creates a transport with a custom HTTP client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&request.params);

        for (name, values) in &request.headers {
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }

        if let Some(payload) = &request.payload {
            builder = builder.body(payload.clone());
        }

        let response = builder.send().await?;
        let status = response.status();

        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.as_str().to_ascii_lowercase())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.to_string(),
            headers,
            body,
        })
    }
}
