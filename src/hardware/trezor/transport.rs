//! Trezor bridge transport
//!
//! The vendor bridge (trezord) is a local HTTP daemon. Every endpoint is a
//! POST; `/call` takes and returns the hex-encoded wire message.

use super::messages::TrezorMessage;
use crate::core::errors::{CustodyError, CustodyResult};
use crate::security::redaction::redact_body;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Origin header value the bridge accepts from local clients.
pub const BRIDGE_ORIGIN: &str = "http://localhost:5000";

/// Device entry returned by `/enumerate`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BridgeDevice {
    pub path: String,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub vendor: u16,
    #[serde(default)]
    pub product: u16,
}

/// The bridge RPC surface the driver needs.
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    async fn version(&self) -> CustodyResult<String>;

    async fn enumerate(&self) -> CustodyResult<Vec<BridgeDevice>>;

    /// Take a session on the device at `path`, stealing `previous` if given.
    async fn acquire(&self, path: &str, previous: Option<&str>) -> CustodyResult<String>;

    async fn call(&self, session: &str, message: &TrezorMessage) -> CustodyResult<TrezorMessage>;

    async fn release(&self, session: &str) -> CustodyResult<()>;
}

#[derive(Deserialize)]
struct VersionReply {
    version: String,
}

#[derive(Deserialize)]
struct AcquireReply {
    session: String,
}

#[derive(Deserialize)]
struct ErrorReply {
    error: String,
}

/// Map a bridge `{"error": ...}` body into the taxonomy.
pub fn bridge_error(status: u16, body: &str) -> CustodyError {
    let message = serde_json::from_str::<ErrorReply>(body)
        .map(|e| e.error)
        .unwrap_or_else(|_| redact_body(body));
    let lower = message.to_ascii_lowercase();
    if lower.contains("session") || lower.contains("device not found") || lower.contains("closed device") {
        CustodyError::DeviceNotConnected(message)
    } else {
        CustodyError::Transport(format!("bridge returned {}: {}", status, message))
    }
}

fn request_error(err: reqwest::Error) -> CustodyError {
    if err.is_connect() {
        CustodyError::DeviceNotConnected(format!("bridge unreachable: {}", err))
    } else if err.is_timeout() {
        CustodyError::Transport("bridge request timed out".to_string())
    } else {
        CustodyError::Transport(format!("bridge request failed: {}", err))
    }
}

/// trezord over HTTP.
pub struct HttpBridge {
    client: Client,
    base_url: String,
}

impl HttpBridge {
    /// Every request is bounded by `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> CustodyResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CustodyError::Transport(format!("failed to build bridge client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, endpoint: &str, body: Option<String>) -> CustodyResult<String> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!("Bridge POST {}", endpoint);
        let mut request = self.client.post(&url).header("Origin", BRIDGE_ORIGIN);
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        let text = response.text().await.map_err(request_error)?;
        if !status.is_success() {
            return Err(bridge_error(status.as_u16(), &text));
        }
        Ok(text)
    }

    fn parse<T: serde::de::DeserializeOwned>(body: &str) -> CustodyResult<T> {
        serde_json::from_str(body)
            .map_err(|e| CustodyError::Transport(format!("unexpected bridge reply: {}", e)))
    }
}

#[async_trait]
impl BridgeTransport for HttpBridge {
    async fn version(&self) -> CustodyResult<String> {
        let body = self.post("/", None).await?;
        Ok(Self::parse::<VersionReply>(&body)?.version)
    }

    async fn enumerate(&self) -> CustodyResult<Vec<BridgeDevice>> {
        let body = self.post("/enumerate", None).await?;
        Self::parse(&body)
    }

    async fn acquire(&self, path: &str, previous: Option<&str>) -> CustodyResult<String> {
        let endpoint = format!("/acquire/{}/{}", path, previous.unwrap_or("null"));
        let body = self.post(&endpoint, None).await?;
        Ok(Self::parse::<AcquireReply>(&body)?.session)
    }

    async fn call(&self, session: &str, message: &TrezorMessage) -> CustodyResult<TrezorMessage> {
        let body = self
            .post(&format!("/call/{}", session), Some(hex::encode(message.serialize())))
            .await?;
        let raw = hex::decode(body.trim())
            .map_err(|_| CustodyError::Transport("bridge reply is not hex".to_string()))?;
        TrezorMessage::deserialize(&raw)
    }

    async fn release(&self, session: &str) -> CustodyResult<()> {
        self.post(&format!("/release/{}", session), None).await?;
        Ok(())
    }
}
