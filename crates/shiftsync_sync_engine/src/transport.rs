//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use shiftsync_protocol::{
    HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest, PushResponse,
    PROTOCOL_VERSION,
};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// A sync transport handles network communication with the remote authority.
///
/// This trait abstracts the network layer, allowing for different implementations
/// (HTTP, in-process loopback, mock for testing, etc.). Calls are async so
/// that sync never blocks local writes; the engine bounds each call with a
/// timeout.
pub trait SyncTransport: Send + Sync {
    /// Performs a handshake with the server.
    fn handshake(
        &self,
        request: &HandshakeRequest,
    ) -> impl Future<Output = SyncResult<HandshakeResponse>> + Send;

    /// Pulls one page of operations from the server.
    fn pull(&self, request: &PullRequest) -> impl Future<Output = SyncResult<PullResponse>> + Send;

    /// Pushes operations to the server.
    fn push(&self, request: &PushRequest) -> impl Future<Output = SyncResult<PushResponse>> + Send;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    fn close(&self) -> SyncResult<()>;
}

/// A scripted transport for testing.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: AtomicBool,
    handshake_response: Mutex<Option<HandshakeResponse>>,
    pull_responses: Mutex<VecDeque<PullResponse>>,
    push_response: Mutex<Option<PushResponse>>,
    pushed: Mutex<Vec<PushRequest>>,
    calls: AtomicU32,
    pulls: AtomicU32,
    failures: AtomicU32,
    fail_retryable: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MockTransport {
    /// Creates a new connected mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Sets the handshake response. Without one the handshake is accepted.
    pub fn set_handshake_response(&self, response: HandshakeResponse) {
        *self.handshake_response.lock() = Some(response);
    }

    /// Queues a pull page. Pulls with an empty queue return an empty page
    /// at the request's cursor.
    pub fn queue_pull_response(&self, response: PullResponse) {
        self.pull_responses.lock().push_back(response);
    }

    /// Sets the push response.
    pub fn set_push_response(&self, response: PushResponse) {
        *self.push_response.lock() = Some(response);
    }

    /// Makes the next `count` calls fail with a transport error.
    pub fn fail_next(&self, count: u32, retryable: bool) {
        self.fail_retryable.store(retryable, Ordering::SeqCst);
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Delays every response.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Push requests received so far.
    pub fn pushed_requests(&self) -> Vec<PushRequest> {
        self.pushed.lock().clone()
    }

    /// Number of calls made while connected, failed ones included.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of pull requests answered so far.
    pub fn pull_count(&self) -> u32 {
        self.pulls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::Transport {
                message: "scripted failure".into(),
                retryable: self.fail_retryable.load(Ordering::SeqCst),
            });
        }
        Ok(())
    }
}

impl SyncTransport for MockTransport {
    async fn handshake(&self, _request: &HandshakeRequest) -> SyncResult<HandshakeResponse> {
        self.enter().await?;
        let scripted = self.handshake_response.lock().clone();
        Ok(scripted.unwrap_or(HandshakeResponse {
            protocol_version: PROTOCOL_VERSION,
            server_time: 0,
            accepted: true,
            message: None,
        }))
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.enter().await?;
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let queued = self.pull_responses.lock().pop_front();
        Ok(queued.unwrap_or_else(|| PullResponse {
            entity_type: request.entity_type,
            ops: Vec::new(),
            next_cursor: request.cursor,
            has_more: false,
        }))
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.enter().await?;
        self.pushed.lock().push(request.clone());
        let scripted = self.push_response.lock().clone();
        Ok(scripted.unwrap_or_else(|| PushResponse {
            accepted: request.ops.iter().map(|op| op.op_id).collect(),
            rejected: Vec::new(),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
