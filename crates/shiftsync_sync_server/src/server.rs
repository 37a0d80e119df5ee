//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::oplog::ServerOplog;
use shiftsync_protocol::{
    Decode, Encode, HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, SyncMessage,
};
use shiftsync_sync_engine::{HttpResponse, LoopbackServer, HANDSHAKE_PATH, PULL_PATH, PUSH_PATH};
use std::sync::Arc;
use tracing::warn;

/// The sync server.
///
/// Answers handshake, pull and push requests against a server op-log.
/// Requests and responses are CBOR bodies with HTTP-style status codes,
/// so the same server backs a real HTTP listener or an in-process
/// [`LoopbackClient`](shiftsync_sync_engine::LoopbackClient).
///
/// # Example
///
/// ```
/// use shiftsync_sync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default()).unwrap();
/// assert_eq!(server.operation_count(), 0);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a sync server with an empty in-memory op-log.
    ///
    /// # Errors
    ///
    /// Returns an error if the op-log cannot be initialised.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let oplog = Arc::new(ServerOplog::in_memory()?);
        Ok(Self::with_oplog(config, oplog))
    }

    /// Creates a sync server with an existing op-log.
    pub fn with_oplog(config: ServerConfig, oplog: Arc<ServerOplog>) -> Self {
        Self::with_context(Arc::new(HandlerContext::new(config, oplog)))
    }

    /// Creates a sync server around a prepared context.
    pub fn with_context(context: Arc<HandlerContext>) -> Self {
        let handler = RequestHandler::new(Arc::clone(&context));
        Self { handler, context }
    }

    /// Handles a handshake request.
    pub fn handle_handshake(&self, request: HandshakeRequest) -> ServerResult<HandshakeResponse> {
        self.handler.handle_handshake(request)
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: PullRequest) -> ServerResult<PullResponse> {
        self.handler.handle_pull(request)
    }

    /// Handles a push request.
    pub fn handle_push(&self, request: PushRequest) -> ServerResult<PushResponse> {
        self.handler.handle_push(request)
    }

    /// Handles a sync message (dispatches to appropriate handler).
    pub fn handle_message(&self, message: SyncMessage) -> ServerResult<SyncMessage> {
        match message {
            SyncMessage::HandshakeRequest(req) => self
                .handle_handshake(req)
                .map(SyncMessage::HandshakeResponse),
            SyncMessage::PullRequest(req) => self.handle_pull(req).map(SyncMessage::PullResponse),
            SyncMessage::PushRequest(req) => self.handle_push(req).map(SyncMessage::PushResponse),
            other => Err(ServerError::InvalidRequest(format!(
                "unexpected message type {}",
                other.type_code()
            ))),
        }
    }

    /// The server op-log.
    pub fn oplog(&self) -> &Arc<ServerOplog> {
        &self.context.oplog
    }

    /// The handler context.
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.context
    }

    /// Returns the number of operations in the op-log.
    pub fn operation_count(&self) -> usize {
        self.context.oplog.len()
    }

    fn respond<Req, Res>(body: &[u8], handle: impl FnOnce(Req) -> ServerResult<Res>) -> ServerResult<Vec<u8>>
    where
        Req: Decode,
        Res: Encode,
    {
        let request = Req::decode(body)?;
        Ok(handle(request)?.encode()?)
    }
}

impl LoopbackServer for SyncServer {
    fn handle_post(&self, path: &str, body: &[u8]) -> HttpResponse {
        let result = match path {
            HANDSHAKE_PATH => Self::respond(body, |req: HandshakeRequest| self.handle_handshake(req)),
            PULL_PATH => Self::respond(body, |req: PullRequest| self.handle_pull(req)),
            PUSH_PATH => Self::respond(body, |req: PushRequest| self.handle_push(req)),
            other => Err(ServerError::NotFound(other.to_string())),
        };
        match result {
            Ok(bytes) => HttpResponse::ok(bytes),
            Err(e) => {
                warn!(%path, error = %e, "request failed");
                HttpResponse::error(e.status(), e.to_string())
            }
        }
    }
}
