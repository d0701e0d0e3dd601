//! The network seam of the client.
//!
//! [`NfseClient`](super::NfseClient) only ever talks to a [`Transport`];
//! [`HttpTransport`] is the mTLS implementation over reqwest.
use crate::config::Config;
use crate::credentials::{CredentialError, TlsIdentity};
use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

/// Which national service a request goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Issuing API (SEFIN).
    Sefin,
    /// National data environment (ADN), serving DANFSe.
    Adn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

/// One request, ready to be sent as many times as the retry policy allows.
/// The body is serialized once so every attempt carries identical bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    method: Method,
    endpoint: Endpoint,
    path: String,
    body: Option<Vec<u8>>,
}

impl WireRequest {
    pub fn get(endpoint: Endpoint, path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            endpoint,
            path: path.into(),
            body: None,
        }
    }

    pub fn post_json(
        endpoint: Endpoint,
        path: impl Into<String>,
        body: &serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            method: Method::Post,
            endpoint,
            path: path.into(),
            body: Some(serde_json::to_vec(body)?),
        })
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Path relative to the endpoint base URL, e.g. `nfse/{chave}`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// JSON body bytes.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    status: u16,
    body: Vec<u8>,
}

impl WireResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Failure to obtain any HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &WireRequest) -> Result<WireResponse, TransportError>;
}

/// reqwest-backed transport presenting the client certificate on every
/// connection.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    sefin_base: String,
    adn_base: String,
}

impl HttpTransport {
    /// # Errors
    /// Returns [`CredentialError`] when the identity is expired or unusable.
    pub fn new(config: &Config, identity: &TlsIdentity) -> Result<Self, CredentialError> {
        identity.ensure_valid_at(chrono::Utc::now())?;
        let client = Client::builder()
            .use_rustls_tls()
            .identity(identity.to_reqwest()?)
            .connect_timeout(config.connect_timeout())
            .timeout(config.retry_policy().attempt_timeout())
            .user_agent(config.application_version())
            .build()
            .map_err(|e| CredentialError::Malformed(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            sefin_base: config.base_url().to_string(),
            adn_base: config.danfse_base_url().to_string(),
        })
    }

    fn url(&self, request: &WireRequest) -> String {
        let base = match request.endpoint() {
            Endpoint::Sefin => &self.sefin_base,
            Endpoint::Adn => &self.adn_base,
        };
        format!("{base}{}", request.path().trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &WireRequest) -> Result<WireResponse, TransportError> {
        let url = self.url(request);
        let builder = match request.method() {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        let builder = builder.header("Accept", "application/json");
        let builder = match request.body() {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(body.to_vec()),
            None => builder,
        };

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(classify)?;
        tracing::debug!(status, bytes = body.len(), "response received");
        Ok(WireResponse::new(status, body.to_vec()))
    }
}

fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Network(error.to_string())
    }
}
