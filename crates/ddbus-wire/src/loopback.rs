//! In-process loopback bus.
//!
//! A [`LoopbackBus`] connects any number of [`LoopbackEndpoint`]s inside one
//! process. Every endpoint owns an inbox drained by a single tokio task, so
//! events for one endpoint are delivered in the order they were produced.
//! Method calls, replies and signals are framed with the wire codec on the
//! way through, exactly as they would be over a socket.

use crate::message::*;
use crate::transport::{BusHandler, BusTransport, ReplySink, TransportError};
use ddbus_types::{
    Announcement, CallError, ObjectDescription, PeerId, SessionId, SessionPort,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Generic error name for failures that carry no name of their own.
const FAILED_ERROR_NAME: &str = "ddbus.Error.Failed";

type EventFn = Box<dyn FnOnce(&dyn BusHandler) + Send + 'static>;
type TaskFn = Box<dyn FnOnce() + Send + 'static>;

enum Delivery {
    /// Runs against the endpoint's handler.
    Event(EventFn),
    /// Runs on the endpoint's delivery task without a handler (reply sinks).
    Task(TaskFn),
}

struct EndpointSlot {
    inbox: mpsc::UnboundedSender<Delivery>,
    bound_ports: HashSet<SessionPort>,
    probes: HashSet<PeerId>,
}

#[derive(Debug, Clone)]
struct SessionLink {
    host: PeerId,
    joiner: PeerId,
}

impl SessionLink {
    fn other(&self, me: &PeerId) -> Option<&PeerId> {
        if &self.host == me {
            Some(&self.joiner)
        } else if &self.joiner == me {
            Some(&self.host)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct BusState {
    endpoints: HashMap<PeerId, EndpointSlot>,
    sessions: HashMap<SessionId, SessionLink>,
    announcements: BTreeMap<(PeerId, SessionPort), Announcement>,
}

impl BusState {
    fn deliver(&self, peer: &PeerId, delivery: Delivery) {
        match self.endpoints.get(peer) {
            Some(slot) => {
                if slot.inbox.send(delivery).is_err() {
                    debug!(peer = %peer, "Loopback: inbox closed, delivery dropped");
                }
            }
            None => debug!(peer = %peer, "Loopback: no such endpoint, delivery dropped"),
        }
    }

    fn event<F>(&self, peer: &PeerId, f: F)
    where
        F: FnOnce(&dyn BusHandler) + Send + 'static,
    {
        self.deliver(peer, Delivery::Event(Box::new(f)));
    }

    fn others(&self, me: &PeerId) -> Vec<PeerId> {
        self.endpoints.keys().filter(|p| *p != me).cloned().collect()
    }
}

struct BusInner {
    state: Mutex<BusState>,
    next_session: AtomicU32,
}

impl BusInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// An in-process bus shared by several endpoints.
#[derive(Clone)]
pub struct LoopbackBus {
    inner: Arc<BusInner>,
}

impl LoopbackBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState::default()),
                next_session: AtomicU32::new(1),
            }),
        }
    }

    /// Attach a new endpoint named `name`. Peers probing that name are told
    /// it was found.
    pub fn endpoint(&self, name: impl Into<PeerId>) -> Arc<LoopbackEndpoint> {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        state.endpoints.insert(
            name.clone(),
            EndpointSlot {
                inbox: tx,
                bound_ports: HashSet::new(),
                probes: HashSet::new(),
            },
        );
        let probers: Vec<PeerId> = state
            .endpoints
            .iter()
            .filter(|(peer, slot)| **peer != name && slot.probes.contains(&name))
            .map(|(peer, _)| peer.clone())
            .collect();
        for prober in probers {
            let found = name.clone();
            state.event(&prober, move |h| h.on_destination_found(&found));
        }
        drop(state);
        debug!(peer = %name, "Loopback: endpoint attached");
        Arc::new(LoopbackEndpoint {
            name,
            bus: Arc::clone(&self.inner),
            inbox: Mutex::new(Some(rx)),
        })
    }

    /// Simulate the death of a peer: its sessions are lost, its
    /// announcements vanish and probes for it report it lost.
    pub fn detach(&self, name: &PeerId) {
        let mut state = self.inner.lock();
        if state.endpoints.remove(name).is_none() {
            return;
        }

        let dead_sessions: Vec<(SessionId, PeerId)> = state
            .sessions
            .iter()
            .filter_map(|(sid, link)| link.other(name).map(|other| (*sid, other.clone())))
            .collect();
        for (sid, other) in dead_sessions {
            state.sessions.remove(&sid);
            state.event(&other, move |h| h.on_session_lost(sid, "remote peer gone"));
        }

        let ports: Vec<SessionPort> = state
            .announcements
            .keys()
            .filter(|(peer, _)| peer == name)
            .map(|(_, port)| *port)
            .collect();
        for port in ports {
            state.announcements.remove(&(name.clone(), port));
            for other in state.others(name) {
                let gone = name.clone();
                state.event(&other, move |h| h.on_peer_gone(&gone, port));
            }
        }

        let probers: Vec<PeerId> = state
            .endpoints
            .iter()
            .filter(|(_, slot)| slot.probes.contains(name))
            .map(|(peer, _)| peer.clone())
            .collect();
        for prober in probers {
            let lost = name.clone();
            state.event(&prober, move |h| h.on_destination_lost(&lost));
        }
        debug!(peer = %name, "Loopback: endpoint detached");
    }

    /// Number of sessions currently open on the bus.
    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Number of open sessions `peer` is a member of.
    pub fn sessions_of(&self, peer: &PeerId) -> usize {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|link| link.other(peer).is_some())
            .count()
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer attached to a [`LoopbackBus`].
pub struct LoopbackEndpoint {
    name: PeerId,
    bus: Arc<BusInner>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

impl LoopbackEndpoint {
    fn attached<'a>(
        &self,
        state: &'a BusState,
    ) -> Result<&'a EndpointSlot, TransportError> {
        state.endpoints.get(&self.name).ok_or(TransportError::Detached)
    }

    fn peer_of(&self, state: &BusState, session: SessionId) -> Result<PeerId, TransportError> {
        state
            .sessions
            .get(&session)
            .and_then(|link| link.other(&self.name))
            .cloned()
            .ok_or(TransportError::UnknownSession(session))
    }
}

/// Pass a message through the frame codec.
fn transmit(msg: WireMessage) -> Result<WireMessage, TransportError> {
    let bytes = encode_message(&msg)?;
    let size = (bytes.len() - 4) as u32;
    if size > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(decode_message(&bytes[4..])?)
}

fn message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn error_reply_parts(err: &CallError) -> (String, String) {
    match err {
        CallError::Remote { name, description } => (name.clone(), description.clone()),
        CallError::Timeout => (CallError::TIMEOUT_ERROR_NAME.to_string(), err.to_string()),
        other => (FAILED_ERROR_NAME.to_string(), other.to_string()),
    }
}

fn reply_result(frame: Result<WireMessage, TransportError>) -> Result<Value, CallError> {
    match frame {
        Ok(WireMessage {
            kind: WireMessageKind::MethodReturn { result, .. },
            ..
        }) => Ok(result),
        Ok(WireMessage {
            kind: WireMessageKind::Error {
                name, description, ..
            },
            ..
        }) => Err(CallError::from_error_reply(name, description)),
        Ok(other) => Err(CallError::Unmarshal(format!(
            "unexpected reply frame {}",
            other.id
        ))),
        Err(e) => Err(CallError::Unmarshal(e.to_string())),
    }
}

type SharedSink = Arc<Mutex<Option<ReplySink>>>;

fn take_sink(slot: &SharedSink) -> Option<ReplySink> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

async fn run_inbox(mut inbox: mpsc::UnboundedReceiver<Delivery>, handler: Weak<dyn BusHandler>) {
    while let Some(delivery) = inbox.recv().await {
        match delivery {
            Delivery::Event(f) => match handler.upgrade() {
                Some(h) => f(h.as_ref()),
                None => debug!("Loopback: handler dropped, event discarded"),
            },
            Delivery::Task(f) => f(),
        }
    }
}

impl BusTransport for LoopbackEndpoint {
    fn unique_name(&self) -> PeerId {
        self.name.clone()
    }

    fn set_handler(&self, handler: Weak<dyn BusHandler>) -> Result<(), TransportError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(TransportError::HandlerInstalled)?;
        runtime.spawn(run_inbox(inbox, handler));

        // Late binders still learn about everything already announced.
        let state = self.bus.lock();
        self.attached(&state)?;
        for ((peer, _), ann) in state.announcements.iter() {
            if *peer != self.name {
                let ann = ann.clone();
                state.event(&self.name, move |h| h.on_announce(ann));
            }
        }
        Ok(())
    }

    fn join_session(&self, peer: &PeerId, port: SessionPort) -> Result<(), TransportError> {
        let mut state = self.bus.lock();
        self.attached(&state)?;
        let accepted = *peer != self.name
            && state
                .endpoints
                .get(peer)
                .map(|slot| slot.bound_ports.contains(&port))
                .unwrap_or(false);

        let host = peer.clone();
        if accepted {
            let sid = SessionId(self.bus.next_session.fetch_add(1, Ordering::SeqCst));
            state.sessions.insert(
                sid,
                SessionLink {
                    host: host.clone(),
                    joiner: self.name.clone(),
                },
            );
            let joiner = self.name.clone();
            state.event(&host, move |h| h.on_session_joined(sid, &joiner));
            state.event(&self.name, move |h| h.on_join_complete(&host, port, Ok(sid)));
            debug!(peer = %peer, port, session = %sid, "Loopback: session joined");
        } else {
            let refused = TransportError::JoinRefused {
                peer: host.to_string(),
                port,
            };
            state.event(&self.name, move |h| {
                h.on_join_complete(&host, port, Err(refused))
            });
        }
        Ok(())
    }

    fn leave_session(&self, session: SessionId) -> Result<(), TransportError> {
        let mut state = self.bus.lock();
        let other = self.peer_of(&state, session)?;
        state.sessions.remove(&session);
        state.event(&other, move |h| h.on_session_lost(session, "remote left session"));
        Ok(())
    }

    fn add_probe_destination(&self, peer: &PeerId) -> Result<(), TransportError> {
        let mut state = self.bus.lock();
        let reachable = state.endpoints.contains_key(peer);
        let slot = state
            .endpoints
            .get_mut(&self.name)
            .ok_or(TransportError::Detached)?;
        if slot.probes.insert(peer.clone()) && reachable {
            let found = peer.clone();
            state.event(&self.name, move |h| h.on_destination_found(&found));
        }
        Ok(())
    }

    fn remove_probe_destination(&self, peer: &PeerId) {
        let mut state = self.bus.lock();
        if let Some(slot) = state.endpoints.get_mut(&self.name) {
            slot.probes.remove(peer);
        }
    }

    fn call_method(
        &self,
        session: SessionId,
        destination: &PeerId,
        call: MethodCall,
        timeout: Duration,
        reply: Option<ReplySink>,
    ) -> Result<(), TransportError> {
        let id = message_id();
        let frame = transmit(WireMessage {
            id: id.clone(),
            kind: WireMessageKind::MethodCall(call),
        })?;
        let WireMessageKind::MethodCall(call) = frame.kind else {
            return Err(TransportError::UnexpectedFrame);
        };

        let state = self.bus.lock();
        self.attached(&state)?;
        if self.peer_of(&state, session)? != *destination {
            return Err(TransportError::UnknownSession(session));
        }

        let slot: Option<SharedSink> = reply.map(|sink| Arc::new(Mutex::new(Some(sink))));
        if let Some(slot) = &slot {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let timer_slot = Arc::clone(slot);
                runtime.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(sink) = take_sink(&timer_slot) {
                        sink(Err(CallError::from_error_reply(
                            CallError::TIMEOUT_ERROR_NAME,
                            "no reply before deadline",
                        )));
                    }
                });
            }
        }

        let caller = self.name.clone();
        let bus = Arc::clone(&self.bus);
        state.event(destination, move |h| {
            let result = h.on_method_call(&caller, session, call);
            let Some(slot) = slot else {
                return;
            };
            let kind = match result {
                Ok(result) => WireMessageKind::MethodReturn {
                    reply_to: id,
                    result,
                },
                Err(e) => {
                    let (name, description) = error_reply_parts(&e);
                    WireMessageKind::Error {
                        reply_to: id,
                        name,
                        description,
                    }
                }
            };
            let outcome = reply_result(transmit(WireMessage {
                id: message_id(),
                kind,
            }));
            bus.lock().deliver(
                &caller,
                Delivery::Task(Box::new(move || {
                    if let Some(sink) = take_sink(&slot) {
                        sink(outcome);
                    }
                })),
            );
        });
        Ok(())
    }

    fn send_signal(&self, session: SessionId, signal: SignalMessage) -> Result<(), TransportError> {
        let frame = transmit(WireMessage {
            id: message_id(),
            kind: WireMessageKind::Signal(signal),
        })?;
        let WireMessageKind::Signal(signal) = frame.kind else {
            return Err(TransportError::UnexpectedFrame);
        };
        let state = self.bus.lock();
        let other = self.peer_of(&state, session)?;
        let sender = self.name.clone();
        state.event(&other, move |h| h.on_signal(&sender, session, signal));
        Ok(())
    }

    fn bind_session_port(&self, port: SessionPort) -> Result<(), TransportError> {
        let mut state = self.bus.lock();
        let slot = state
            .endpoints
            .get_mut(&self.name)
            .ok_or(TransportError::Detached)?;
        slot.bound_ports.insert(port);
        Ok(())
    }

    fn announce(&self, port: SessionPort, description: &ObjectDescription) -> Result<(), TransportError> {
        let mut state = self.bus.lock();
        self.attached(&state)?;
        let ann = Announcement {
            peer: self.name.clone(),
            port,
            description: description.clone(),
            metadata: BTreeMap::new(),
        };
        state
            .announcements
            .insert((self.name.clone(), port), ann.clone());
        for other in state.others(&self.name) {
            let ann = ann.clone();
            state.event(&other, move |h| h.on_announce(ann));
        }
        Ok(())
    }

    fn withdraw_announcement(&self, port: SessionPort) -> Result<(), TransportError> {
        let mut state = self.bus.lock();
        if state
            .announcements
            .remove(&(self.name.clone(), port))
            .is_none()
        {
            warn!(peer = %self.name, port, "Loopback: nothing announced on port");
            return Ok(());
        }
        for other in state.others(&self.name) {
            let gone = self.name.clone();
            state.event(&other, move |h| h.on_peer_gone(&gone, port));
        }
        Ok(())
    }
}
