//! Request handlers for sync endpoints.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::oplog::ServerOplog;
use parking_lot::RwLock;
use shiftsync_core::{SystemWallClock, WallClock};
use shiftsync_protocol::{
    DeviceId, HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Server op-log (shared across all handlers).
    pub oplog: Arc<ServerOplog>,
    clock: Arc<dyn WallClock>,
    sessions: RwLock<HashMap<DeviceId, DeviceSession>>,
}

/// What the authority remembers about a device.
#[derive(Debug, Clone, Default)]
struct DeviceSession {
    last_seen: i64,
    pushed: u64,
    rejected: u64,
}

impl HandlerContext {
    /// Creates a new handler context on the system clock.
    pub fn new(config: ServerConfig, oplog: Arc<ServerOplog>) -> Self {
        Self::with_clock(config, oplog, Arc::new(SystemWallClock))
    }

    /// Creates a handler context with an explicit clock.
    pub fn with_clock(config: ServerConfig, oplog: Arc<ServerOplog>, clock: Arc<dyn WallClock>) -> Self {
        Self {
            config,
            oplog,
            clock,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn touch(&self, device_id: &DeviceId, pushed: usize, rejected: usize) {
        let now = self.clock.now_ms();
        let mut sessions = self.sessions.write();
        let session = sessions.entry(device_id.clone()).or_default();
        session.last_seen = now;
        session.pushed += pushed as u64;
        session.rejected += rejected as u64;
    }

    /// Number of devices seen since start.
    pub fn device_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Operations pushed and refused for a device since start.
    pub fn device_totals(&self, device_id: &DeviceId) -> Option<(u64, u64)> {
        self.sessions
            .read()
            .get(device_id)
            .map(|s| (s.pushed, s.rejected))
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a handshake request.
    ///
    /// A version mismatch is answered, not failed, so the device can tell
    /// it apart from a transport problem.
    pub fn handle_handshake(&self, request: HandshakeRequest) -> ServerResult<HandshakeResponse> {
        let server_time = self.context.clock.now_ms();
        if request.protocol_version != PROTOCOL_VERSION {
            warn!(
                device = %request.device_id,
                version = request.protocol_version,
                "unsupported protocol version"
            );
            return Ok(HandshakeResponse {
                protocol_version: PROTOCOL_VERSION,
                server_time,
                accepted: false,
                message: Some(format!(
                    "unsupported protocol version: {}",
                    request.protocol_version
                )),
            });
        }

        self.context.touch(&request.device_id, 0, 0);
        debug!(device = %request.device_id, "handshake accepted");
        Ok(HandshakeResponse {
            protocol_version: PROTOCOL_VERSION,
            server_time,
            accepted: true,
            message: None,
        })
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: PullRequest) -> ServerResult<PullResponse> {
        if request.limit == 0 {
            return Err(ServerError::InvalidRequest("pull limit must be positive".into()));
        }
        let limit = request.limit.min(self.context.config.max_pull_batch) as usize;
        let page = self
            .context
            .oplog
            .page(request.entity_type, &request.cursor, limit);
        debug!(
            entity_type = %request.entity_type,
            from = request.cursor.position,
            sent = page.ops.len(),
            has_more = page.has_more,
            "pull served"
        );

        Ok(PullResponse {
            entity_type: request.entity_type,
            ops: page.ops,
            next_cursor: page.next_cursor,
            has_more: page.has_more,
        })
    }

    /// Handles a push request.
    pub fn handle_push(&self, request: PushRequest) -> ServerResult<PushResponse> {
        if request.ops.len() > self.context.config.max_push_batch as usize {
            return Err(ServerError::InvalidRequest(format!(
                "too many operations: {} > {}",
                request.ops.len(),
                self.context.config.max_push_batch
            )));
        }

        let verdict = self.context.oplog.append(&request.ops)?;
        self.context
            .touch(&request.device_id, verdict.accepted.len(), verdict.rejected.len());
        if verdict.rejected.is_empty() {
            debug!(device = %request.device_id, accepted = verdict.accepted.len(), "push accepted");
        } else {
            info!(
                device = %request.device_id,
                accepted = verdict.accepted.len(),
                rejected = verdict.rejected.len(),
                "push partially refused"
            );
        }

        Ok(PushResponse {
            accepted: verdict.accepted,
            rejected: verdict.rejected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiftsync_core::ManualWallClock;
    use shiftsync_protocol::{EntityType, SyncCursor};

    fn handler(config: ServerConfig) -> (RequestHandler, Arc<HandlerContext>) {
        let oplog = Arc::new(ServerOplog::in_memory().unwrap());
        let clock = Arc::new(ManualWallClock::new(42_000));
        let context = Arc::new(HandlerContext::with_clock(config, oplog, clock));
        (RequestHandler::new(Arc::clone(&context)), context)
    }

    fn device() -> DeviceId {
        DeviceId::new("tablet-1").unwrap()
    }

    #[test]
    fn handshake_reports_server_time() {
        let (handler, context) = handler(ServerConfig::default());
        let response = handler.handle_handshake(HandshakeRequest::new(device())).unwrap();
        assert!(response.accepted);
        assert_eq!(response.server_time, 42_000);
        assert_eq!(context.device_count(), 1);
    }

    #[test]
    fn handshake_refuses_other_versions() {
        let (handler, context) = handler(ServerConfig::default());
        let request = HandshakeRequest {
            device_id: device(),
            protocol_version: PROTOCOL_VERSION + 1,
        };
        let response = handler.handle_handshake(request).unwrap();
        assert!(!response.accepted);
        assert_eq!(response.protocol_version, PROTOCOL_VERSION);
        assert_eq!(context.device_count(), 0);
    }

    #[test]
    fn pull_rejects_zero_limit() {
        let (handler, _) = handler(ServerConfig::default());
        let err = handler
            .handle_pull(PullRequest {
                entity_type: EntityType::Asset,
                cursor: SyncCursor::start(),
                limit: 0,
            })
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn empty_pull_keeps_the_cursor() {
        let (handler, _) = handler(ServerConfig::default());
        let response = handler
            .handle_pull(PullRequest {
                entity_type: EntityType::Asset,
                cursor: SyncCursor::start(),
                limit: 10,
            })
            .unwrap();
        assert!(response.ops.is_empty());
        assert!(!response.has_more);
        assert_eq!(response.next_cursor, SyncCursor::start());
    }

    fn pending(count: usize) -> Vec<shiftsync_protocol::Operation> {
        use shiftsync_core::{MergeRuleRegistry, Replica, ReplicaConfig};
        use shiftsync_protocol::{ActorId, EntityId, FieldPath, OpKind, OpValue};

        let config = ReplicaConfig::new(device(), ActorId::new("crew").unwrap());
        let replica =
            Replica::in_memory(config, Arc::new(MergeRuleRegistry::standard().unwrap())).unwrap();
        for i in 0..count {
            replica
                .record(
                    EntityType::Asset,
                    EntityId::new("loader-3").unwrap(),
                    OpKind::Update,
                    Some(FieldPath::parse("hours").unwrap()),
                    Some(OpValue::Integer(i as i64)),
                )
                .unwrap();
        }
        replica.pending_push(count)
    }

    #[test]
    fn oversized_push_is_refused() {
        let (handler, context) = handler(ServerConfig::default().with_max_push_batch(1));
        let err = handler
            .handle_push(PushRequest {
                device_id: device(),
                ops: pending(2),
            })
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(context.oplog.is_empty());
    }

    #[test]
    fn push_updates_device_totals() {
        let (handler, context) = handler(ServerConfig::default());
        let ops = pending(3);
        let response = handler
            .handle_push(PushRequest {
                device_id: device(),
                ops: ops[1..].to_vec(),
            })
            .unwrap();
        assert!(response.accepted.is_empty());
        assert_eq!(context.device_totals(&device()), Some((0, 2)));

        let response = handler
            .handle_push(PushRequest {
                device_id: device(),
                ops,
            })
            .unwrap();
        assert!(response.is_fully_accepted());
        assert_eq!(context.device_totals(&device()), Some((3, 2)));
    }
}
