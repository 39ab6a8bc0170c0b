//! Bus connection: one observation domain on top of a transport.
//!
//! A [`BusConnection`] owns the serial task queue, the session registry,
//! the interest registry, the discovery coordinator and the provider for a
//! single transport endpoint, and installs itself as that endpoint's
//! [`BusHandler`]. Nothing here is process-global: two connections on two
//! endpoints are fully independent.

use crate::discovery::DiscoveryCoordinator;
use crate::interest::InterestRegistry;
use crate::liveness::{LivenessMonitor, Pinger, ProbeListener};
use crate::invocation::{CallResult, InvocationFuture, ReplyListener};
use crate::object_cache::{ObjectAllocator, PropertyMapAllocator, RemoteObject};
use crate::provider::{MethodHandler, Provider};
use crate::session::{SessionListener, SessionRegistry};
use crate::task_queue::SerialTaskQueue;
use ddbus_types::{
    Announcement, BusConfig, CallError, DdError, DdResult, InterfaceName, ObjectDescription,
    ObjectPath, PeerId, SessionId, SessionPort,
};
use ddbus_wire::{
    BusHandler, BusTransport, MethodCall, ReplySink, SignalMessage, TransportError,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Observation and publishing on one transport endpoint.
pub struct BusConnection {
    config: BusConfig,
    transport: Arc<dyn BusTransport>,
    queue: SerialTaskQueue,
    sessions: Arc<SessionRegistry>,
    interests: Arc<InterestRegistry>,
    discovery: Arc<DiscoveryCoordinator>,
    provider: Provider,
    method_timeout: Duration,
    liveness: Mutex<Option<Arc<LivenessMonitor>>>,
}

impl BusConnection {
    /// Connect with the default property-map allocator.
    pub fn new(config: BusConfig, transport: Arc<dyn BusTransport>) -> DdResult<Arc<Self>> {
        Self::with_allocator(config, transport, Arc::new(PropertyMapAllocator))
    }

    /// Connect, building proxy state for remote objects with `allocator`.
    pub fn with_allocator(
        config: BusConfig,
        transport: Arc<dyn BusTransport>,
        allocator: Arc<dyn ObjectAllocator>,
    ) -> DdResult<Arc<Self>> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| DdError::InitFailed(format!("no tokio runtime: {e}")))?;
        crate::config::validate(&config).map_err(|e| DdError::InitFailed(e.to_string()))?;

        let method_timeout = Duration::from_millis(config.method_timeout_ms);
        let queue = SerialTaskQueue::new("observers")?;
        let sessions = Arc::new(SessionRegistry::new(Arc::clone(&transport))?);
        let interests = Arc::new(InterestRegistry::new(Arc::clone(&transport), method_timeout));
        let discovery = Arc::new(DiscoveryCoordinator::new(
            config.clone(),
            Arc::clone(&sessions),
            Arc::clone(&interests),
            queue.clone(),
            allocator,
        ));

        // Discovery populates caches before interest replay reaches the provider.
        let discovery_listener: Arc<dyn SessionListener> = discovery.clone();
        sessions.register_listener(Arc::downgrade(&discovery_listener));
        let interest_listener: Arc<dyn SessionListener> = interests.clone();
        sessions.register_listener(Arc::downgrade(&interest_listener));

        let provider = Provider::new(Arc::clone(&transport), config.service_port);
        let conn = Arc::new(Self {
            config,
            transport,
            queue,
            sessions,
            interests,
            discovery,
            provider,
            method_timeout,
            liveness: Mutex::new(None),
        });

        let handler: Arc<dyn BusHandler> = conn.clone();
        conn.transport
            .set_handler(Arc::downgrade(&handler))
            .map_err(|e| DdError::InitFailed(e.to_string()))?;
        info!(
            name = %conn.unique_name(),
            prefix = %conn.config.name_prefix,
            port = conn.config.service_port,
            "Bus connection ready"
        );
        Ok(conn)
    }

    /// Unique bus name of the local endpoint.
    pub fn unique_name(&self) -> PeerId {
        self.transport.unique_name()
    }

    /// Connection configuration.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub(crate) fn discovery(&self) -> &Arc<DiscoveryCoordinator> {
        &self.discovery
    }

    /// Session registry of this connection.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Interest registry of this connection.
    pub fn interests(&self) -> &Arc<InterestRegistry> {
        &self.interests
    }

    /// Serial task queue observer callbacks run on.
    pub fn queue(&self) -> &SerialTaskQueue {
        &self.queue
    }

    /// Local provider.
    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Number of peers with a stored description.
    pub fn discovered_peers(&self) -> usize {
        self.discovery.discovered_peers()
    }

    /// Last description announced by `peer` on `port`.
    pub fn description(&self, peer: &PeerId, port: SessionPort) -> Option<ObjectDescription> {
        self.discovery.description(peer, port)
    }

    /// Probe session peers through `pinger` every `probe_interval_secs`,
    /// declaring a peer lost after `probe_miss_threshold` failed pings.
    /// For transports without native probing. Starting twice returns the
    /// running monitor.
    pub fn start_liveness(&self, pinger: Arc<dyn Pinger>) -> DdResult<Arc<LivenessMonitor>> {
        let mut slot = self.liveness.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(monitor) = slot.as_ref() {
            return Ok(Arc::clone(monitor));
        }
        let listener: Arc<dyn ProbeListener> = self.sessions.clone();
        let monitor = Arc::new(LivenessMonitor::new(
            pinger,
            Arc::downgrade(&listener),
            self.config.probe_miss_threshold,
        ));
        let _task = monitor.start(Duration::from_secs(self.config.probe_interval_secs))?;
        self.sessions.attach_monitor(&monitor);
        info!(
            interval_secs = self.config.probe_interval_secs,
            miss_threshold = self.config.probe_miss_threshold,
            "Liveness monitor started"
        );
        *slot = Some(Arc::clone(&monitor));
        Ok(monitor)
    }

    /// Running liveness monitor, if started.
    pub fn liveness(&self) -> Option<Arc<LivenessMonitor>> {
        self.liveness
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait until queued cache work and session teardown have run.
    pub async fn flush(&self) {
        self.queue.flush().await;
        self.sessions.flush_teardown().await;
    }

    fn dispatch<T>(
        &self,
        object: &RemoteObject,
        member: &str,
        args: Value,
        timeout: Duration,
        decode: fn(Value) -> CallResult<T>,
        listener: Option<ReplyListener<T>>,
    ) -> InvocationFuture<T>
    where
        T: Clone + Send + 'static,
    {
        if !object.is_alive() {
            return InvocationFuture::ready(Err(CallError::DeadObject));
        }
        let (future, completer) = match listener {
            Some(listener) => InvocationFuture::pending_with_listener(self.queue.clone(), listener),
            None => InvocationFuture::pending(),
        };
        let call = MethodCall::new(
            object.path().clone(),
            object.interface().clone(),
            member,
            args,
        );
        debug!(object = %object.path(), member, "Invoking remote method");
        let sink: ReplySink = Box::new(move |reply: CallResult<Value>| {
            completer.complete(reply.and_then(decode));
        });
        match self.transport.call_method(
            object.session(),
            object.peer(),
            call,
            timeout,
            Some(sink),
        ) {
            Ok(()) => future,
            Err(e) => InvocationFuture::ready(Err(CallError::Local(e.to_string()))),
        }
    }

    /// Call `member` on a remote object with the configured timeout.
    pub fn invoke(&self, object: &RemoteObject, member: &str, args: Value) -> InvocationFuture<Value> {
        self.dispatch(object, member, args, self.method_timeout, Ok, None)
    }

    /// Call `member` with an explicit timeout.
    pub fn invoke_with_timeout(
        &self,
        object: &RemoteObject,
        member: &str,
        args: Value,
        timeout: Duration,
    ) -> InvocationFuture<Value> {
        self.dispatch(object, member, args, timeout, Ok, None)
    }

    /// Call `member`; `listener` runs on the task queue with the reply
    /// unless the call is cancelled first.
    pub fn invoke_with_listener(
        &self,
        object: &RemoteObject,
        member: &str,
        args: Value,
        listener: ReplyListener<Value>,
    ) -> InvocationFuture<Value> {
        self.dispatch(object, member, args, self.method_timeout, Ok, Some(listener))
    }

    /// Call `member` and decode the reply as `R`.
    pub fn invoke_typed<R>(&self, object: &RemoteObject, member: &str, args: Value) -> InvocationFuture<R>
    where
        R: DeserializeOwned + Clone + Send + 'static,
    {
        fn decode<R: DeserializeOwned>(value: Value) -> CallResult<R> {
            serde_json::from_value(value).map_err(|e| CallError::Unmarshal(e.to_string()))
        }
        self.dispatch(object, member, args, self.method_timeout, decode::<R>, None)
    }

    /// Fire-and-forget call. Resolves to `Null` once handed to the transport.
    pub fn invoke_no_reply(
        &self,
        object: &RemoteObject,
        member: &str,
        args: Value,
    ) -> InvocationFuture<Value> {
        if !object.is_alive() {
            return InvocationFuture::ready(Err(CallError::DeadObject));
        }
        let call = MethodCall::new(
            object.path().clone(),
            object.interface().clone(),
            member,
            args,
        )
        .without_reply();
        let result = self
            .transport
            .call_method(object.session(), object.peer(), call, self.method_timeout, None)
            .map(|()| Value::Null)
            .map_err(|e| CallError::Local(e.to_string()));
        InvocationFuture::ready(result)
    }

    /// Publish an object on this connection.
    pub fn publish<I>(
        &self,
        path: impl Into<ObjectPath>,
        interfaces: I,
        handler: Option<Arc<dyn MethodHandler>>,
    ) -> DdResult<()>
    where
        I: IntoIterator<Item = (InterfaceName, Value)>,
    {
        self.provider.publish(path, interfaces, handler)
    }

    /// Update properties of a published object.
    pub fn update_properties(
        &self,
        path: &ObjectPath,
        interface: &InterfaceName,
        properties: Value,
    ) -> DdResult<usize> {
        self.provider.update_properties(path, interface, properties)
    }

    /// Emit a signal from a published object.
    pub fn emit_signal(
        &self,
        path: &ObjectPath,
        interface: &InterfaceName,
        member: &str,
        args: Value,
    ) -> DdResult<usize> {
        self.provider.emit_signal(path, interface, member, args)
    }

    /// Withdraw a published object.
    pub fn unpublish(&self, path: &ObjectPath) -> DdResult<()> {
        self.provider.unpublish(path)
    }

    /// Stop announcing on the service port. Observers elsewhere see every
    /// object of this connection disappear.
    pub fn withdraw(&self) -> DdResult<()> {
        self.transport
            .withdraw_announcement(self.config.service_port)
            .map_err(|e| DdError::Transport(e.to_string()))
    }
}

impl BusHandler for BusConnection {
    fn on_announce(&self, announcement: Announcement) {
        self.discovery.on_announce(announcement);
    }

    fn on_peer_gone(&self, peer: &PeerId, port: SessionPort) {
        self.discovery.on_peer_gone(peer, port);
    }

    fn on_join_complete(
        &self,
        peer: &PeerId,
        port: SessionPort,
        result: Result<SessionId, TransportError>,
    ) {
        self.sessions.on_join_complete(peer, port, result);
    }

    fn on_session_joined(&self, session: SessionId, joiner: &PeerId) {
        self.provider.on_session_joined(session, joiner);
    }

    fn on_session_lost(&self, session: SessionId, reason: &str) {
        self.provider.on_session_lost(session);
        self.sessions.on_session_lost(session, reason);
    }

    fn on_destination_found(&self, peer: &PeerId) {
        self.sessions.on_destination_found(peer);
    }

    fn on_destination_lost(&self, peer: &PeerId) {
        self.sessions.on_destination_lost(peer);
    }

    fn on_method_call(
        &self,
        sender: &PeerId,
        session: SessionId,
        call: MethodCall,
    ) -> Result<Value, CallError> {
        self.provider.handle_method_call(sender, session, call)
    }

    fn on_signal(&self, sender: &PeerId, _session: SessionId, signal: SignalMessage) {
        self.discovery.on_signal(sender, signal);
    }
}

impl std::fmt::Debug for BusConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusConnection")
            .field("name", &self.unique_name())
            .field("sessions", &self.sessions.len())
            .field("discovered", &self.discovery.discovered_peers())
            .finish()
    }
}

