//! HTTP transport implementation.
//!
//! This module provides an HTTP-based transport for the sync engine.
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations (reqwest, hyper, etc.). Bodies are CBOR.

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use parking_lot::RwLock;
use shiftsync_protocol::{
    Decode, Encode, HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest,
    PushResponse,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Path of the handshake endpoint.
pub const HANDSHAKE_PATH: &str = "/sync/handshake";
/// Path of the pull endpoint.
pub const PULL_PATH: &str = "/sync/pull";
/// Path of the push endpoint.
pub const PUSH_PATH: &str = "/sync/push";

/// Status and body of an HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A 200 response.
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }

    /// An error response with a plain-text body.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: message.into().into_bytes(),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
/// This allows using different HTTP libraries (reqwest, hyper, ureq, etc.)
/// or even non-HTTP transports (WebSocket, gRPC).
pub trait HttpClient: Send + Sync {
    /// Sends a POST request. `Err` means no response was received.
    fn post(
        &self,
        url: &str,
        body: Vec<u8>,
    ) -> impl Future<Output = Result<HttpResponse, String>> + Send;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based sync transport.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the sync server (e.g., "https://sync.example.com").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Connection state.
    connected: AtomicBool,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into(),
            client,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }

    async fn post_cbor<Req, Res>(&self, endpoint: &str, request: &Req) -> SyncResult<Res>
    where
        Req: Encode + Sync,
        Res: Decode,
    {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let body = request.encode()?;
        let url = format!("{}{}", self.base_url, endpoint);
        let response = match self.client.post(&url, body).await {
            Ok(response) => response,
            Err(e) => {
                self.set_error(&e);
                warn!(%url, error = %e, "sync request failed");
                return Err(SyncError::transport_retryable(e));
            }
        };

        if response.is_success() {
            *self.last_error.write() = None;
            return Ok(Res::decode(&response.body)?);
        }

        let message = format!(
            "{} returned {}: {}",
            endpoint,
            response.status,
            String::from_utf8_lossy(&response.body)
        );
        self.set_error(&message);
        warn!(%url, status = response.status, "sync request refused");
        match response.status {
            408 | 429 | 500..=599 => Err(SyncError::transport_retryable(message)),
            400..=499 => Err(SyncError::rejected(message)),
            _ => Err(SyncError::transport_fatal(message)),
        }
    }
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    async fn handshake(&self, request: &HandshakeRequest) -> SyncResult<HandshakeResponse> {
        self.post_cbor(HANDSHAKE_PATH, request).await
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.post_cbor(PULL_PATH, request).await
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.post_cbor(PUSH_PATH, request).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request and returns the response.
    fn handle_post(&self, path: &str, body: &[u8]) -> HttpResponse;
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    fn handle_post(&self, path: &str, body: &[u8]) -> HttpResponse {
        (**self).handle_post(path, body)
    }
}

/// A loopback HTTP client that routes requests directly to a sync server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    online: AtomicBool,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self {
            server,
            online: AtomicBool::new(true),
        }
    }

    /// Simulates losing or regaining the network.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, String> {
        if !self.online.load(Ordering::SeqCst) {
            return Err("network unreachable".into());
        }
        let path = url.find("/sync/").map_or(url, |i| &url[i..]);
        Ok(self.server.handle_post(path, &body))
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
