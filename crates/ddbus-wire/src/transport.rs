//! Transport abstraction.
//!
//! [`BusTransport`] is the set of outbound primitives the observation layer
//! calls: session joins, liveness probing, method calls, signals and
//! announcements. Every primitive returns immediately; completions come back
//! through the [`BusHandler`] installed with [`BusTransport::set_handler`].

use crate::message::{MethodCall, SignalMessage};
use ddbus_types::{
    Announcement, CallError, ObjectDescription, PeerId, SessionId, SessionPort,
};
use serde_json::Value;
use std::sync::Weak;
use std::time::Duration;
use thiserror::Error;

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("No async runtime available")]
    NoRuntime,
    #[error("Handler already installed")]
    HandlerInstalled,
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("Join refused by {peer} on port {port}")]
    JoinRefused { peer: String, port: SessionPort },
    #[error("Unexpected frame kind")]
    UnexpectedFrame,
    #[error("Endpoint detached")]
    Detached,
}

/// Completion callback for a method call that expects a reply.
pub type ReplySink = Box<dyn FnOnce(Result<Value, CallError>) + Send + 'static>;

/// Outbound bus primitives.
pub trait BusTransport: Send + Sync + 'static {
    /// Unique bus name of the local endpoint.
    fn unique_name(&self) -> PeerId;

    /// Install the receiver of inbound events. Only one handler per endpoint.
    fn set_handler(&self, handler: Weak<dyn BusHandler>) -> Result<(), TransportError>;

    /// Start joining a session hosted by `peer`. Completion is reported
    /// through [`BusHandler::on_join_complete`].
    fn join_session(&self, peer: &PeerId, port: SessionPort) -> Result<(), TransportError>;

    /// Leave a session. The remote side sees it as lost.
    fn leave_session(&self, session: SessionId) -> Result<(), TransportError>;

    /// Start probing `peer` for reachability.
    fn add_probe_destination(&self, peer: &PeerId) -> Result<(), TransportError>;

    /// Stop probing `peer`.
    fn remove_probe_destination(&self, peer: &PeerId);

    /// Send a method call over `session`. With a sink the reply (or a
    /// timeout after `timeout`) is delivered to it exactly once.
    fn call_method(
        &self,
        session: SessionId,
        destination: &PeerId,
        call: MethodCall,
        timeout: Duration,
        reply: Option<ReplySink>,
    ) -> Result<(), TransportError>;

    /// Send a signal to the other member of `session`.
    fn send_signal(&self, session: SessionId, signal: SignalMessage) -> Result<(), TransportError>;

    /// Accept session joins on `port`.
    fn bind_session_port(&self, port: SessionPort) -> Result<(), TransportError>;

    /// Announce (or re-announce) the local object description on `port`.
    fn announce(&self, port: SessionPort, description: &ObjectDescription) -> Result<(), TransportError>;

    /// Stop announcing on `port`. Observers see the peer as gone.
    fn withdraw_announcement(&self, port: SessionPort) -> Result<(), TransportError>;
}

/// Inbound bus events. Implementations must not block: they run on the
/// transport's delivery thread.
pub trait BusHandler: Send + Sync + 'static {
    /// A peer announced (or re-announced) its objects.
    fn on_announce(&self, announcement: Announcement);

    /// A peer stopped announcing on `port`.
    fn on_peer_gone(&self, peer: &PeerId, port: SessionPort);

    /// A join started by `join_session` finished.
    fn on_join_complete(
        &self,
        peer: &PeerId,
        port: SessionPort,
        result: Result<SessionId, TransportError>,
    );

    /// A remote peer joined a session hosted locally.
    fn on_session_joined(&self, _session: SessionId, _joiner: &PeerId) {}

    /// A session ended without the local side leaving it.
    fn on_session_lost(&self, session: SessionId, reason: &str);

    /// A probed destination became reachable.
    fn on_destination_found(&self, peer: &PeerId);

    /// A probed destination became unreachable.
    fn on_destination_lost(&self, peer: &PeerId);

    /// A method call arrived for a local object.
    fn on_method_call(
        &self,
        sender: &PeerId,
        session: SessionId,
        call: MethodCall,
    ) -> Result<Value, CallError>;

    /// A signal arrived from a remote object.
    fn on_signal(&self, sender: &PeerId, session: SessionId, signal: SignalMessage);
}
