//! Session registry: refcounted point-to-point sessions per (peer, port).
//!
//! The [`SessionRegistry`] owns one row per [`SessionKey`]. Holders call
//! [`SessionRegistry::acquire`] and later release; the first acquire starts
//! an asynchronous join and registers the peer for liveness probing, the
//! last release leaves the session. Transport callbacks (join completion,
//! session loss, probe found/lost) are fed in through the `on_*` methods.
//!
//! Listeners are held weakly and always invoked outside the registry lock.

use crate::liveness::LivenessMonitor;
use crate::task_queue::SerialTaskQueue;
use chrono::{DateTime, Utc};
use ddbus_types::{DdResult, PeerId, SessionId, SessionKey, SessionPort};
use ddbus_wire::{BusTransport, TransportError};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, info, warn};

/// Session lifecycle events.
pub trait SessionListener: Send + Sync {
    /// A session for `key` is now established.
    fn on_session_established(&self, key: &SessionKey, session: SessionId);

    /// The established session for `key` is gone.
    fn on_session_lost(&self, key: &SessionKey, session: SessionId);

    /// A join for `key` failed.
    fn on_join_failed(&self, _key: &SessionKey) {}
}

/// A single row of the registry.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// Session handle once established.
    pub session: Option<SessionId>,
    /// Number of holders.
    pub ref_count: usize,
    /// A join is outstanding.
    pub join_pending: bool,
    /// The row has been established at least once.
    pub ever_established: bool,
    /// When the current session was established.
    pub established_at: Option<DateTime<Utc>>,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            session: None,
            ref_count: 1,
            join_pending: true,
            ever_established: false,
            established_at: None,
        }
    }

    /// Whether the row currently has an established session.
    pub fn is_established(&self) -> bool {
        self.session.is_some()
    }
}

#[derive(Default)]
struct RegistryState {
    rows: HashMap<SessionKey, SessionEntry>,
    by_session: HashMap<SessionId, SessionKey>,
}

impl RegistryState {
    fn peer_has_rows(&self, peer: &PeerId) -> bool {
        self.rows.keys().any(|k| &k.peer == peer)
    }
}

enum Event {
    Established(SessionKey, SessionId),
    Lost(SessionKey, SessionId),
    JoinFailed(SessionKey),
}

/// Thread-safe registry of peer sessions.
pub struct SessionRegistry {
    transport: Arc<dyn BusTransport>,
    state: Mutex<RegistryState>,
    listeners: RwLock<Vec<Weak<dyn SessionListener>>>,
    monitor: RwLock<Option<Weak<LivenessMonitor>>>,
    teardown: SerialTaskQueue,
}

impl SessionRegistry {
    /// Create a registry on top of `transport`.
    pub fn new(transport: Arc<dyn BusTransport>) -> DdResult<Self> {
        Ok(Self {
            transport,
            state: Mutex::new(RegistryState::default()),
            listeners: RwLock::new(Vec::new()),
            monitor: RwLock::new(None),
            teardown: SerialTaskQueue::new("session-teardown")?,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register for session events.
    pub fn register_listener(&self, listener: Weak<dyn SessionListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }

    /// Stop receiving session events.
    pub fn unregister_listener(&self, listener: &Weak<dyn SessionListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|l| !Weak::ptr_eq(l, listener) && l.strong_count() > 0);
    }

    fn notify(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn SessionListener>> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for event in &events {
            for listener in &listeners {
                match event {
                    Event::Established(key, sid) => listener.on_session_established(key, *sid),
                    Event::Lost(key, sid) => listener.on_session_lost(key, *sid),
                    Event::JoinFailed(key) => listener.on_join_failed(key),
                }
            }
        }
    }

    /// Mirror probe destinations into `monitor`, starting with every peer
    /// that currently has a row.
    pub fn attach_monitor(&self, monitor: &Arc<LivenessMonitor>) {
        *self.monitor.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::downgrade(monitor));
        let peers: BTreeSet<PeerId> = self.lock().rows.keys().map(|k| k.peer.clone()).collect();
        for peer in &peers {
            monitor.add_destination(peer);
        }
    }

    fn monitor(&self) -> Option<Arc<LivenessMonitor>> {
        self.monitor
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn start_probing(&self, peer: &PeerId) {
        if let Err(e) = self.transport.add_probe_destination(peer) {
            warn!(peer = %peer, error = %e, "Failed to add probe destination");
        }
        if let Some(monitor) = self.monitor() {
            monitor.add_destination(peer);
        }
    }

    fn stop_probing(&self, peer: &PeerId) {
        self.transport.remove_probe_destination(peer);
        if let Some(monitor) = self.monitor() {
            monitor.remove_destination(peer);
        }
    }

    fn schedule_leave(&self, session: SessionId) {
        let transport = Arc::clone(&self.transport);
        self.teardown.enqueue(move || {
            if let Err(e) = transport.leave_session(session) {
                warn!(session = %session, error = %e, "Failed to leave session");
            } else {
                debug!(session = %session, "Left session");
            }
        });
    }

    /// Take a reference on the session for (peer, port). Returns whether
    /// the session is already established. Never blocks on the network.
    pub fn acquire(&self, peer: &PeerId, port: SessionPort) -> bool {
        let key = SessionKey::new(peer.clone(), port);
        {
            let mut state = self.lock();
            if let Some(row) = state.rows.get_mut(&key) {
                row.ref_count += 1;
                debug!(key = %key, ref_count = row.ref_count, "Session reference added");
                return row.is_established();
            }
            state.rows.insert(key.clone(), SessionEntry::new());
        }

        self.start_probing(peer);
        debug!(key = %key, "Joining session");
        if let Err(e) = self.transport.join_session(peer, port) {
            self.on_join_complete(peer, port, Err(e));
        }
        false
    }

    /// Drop a reference by session handle. Unknown handles are ignored.
    pub fn release_session(&self, session: SessionId) {
        let key = match self.lock().by_session.get(&session) {
            Some(key) => key.clone(),
            None => {
                debug!(session = %session, "Release of unknown session ignored");
                return;
            }
        };
        self.release_key(&key);
    }

    /// Drop a reference by key. Covers holders whose session never got
    /// established.
    pub fn release(&self, peer: &PeerId, port: SessionPort) {
        self.release_key(&SessionKey::new(peer.clone(), port));
    }

    fn release_key(&self, key: &SessionKey) {
        let (torn_down, stop_probing) = {
            let mut state = self.lock();
            let Some(row) = state.rows.get_mut(key) else {
                return;
            };
            row.ref_count = row.ref_count.saturating_sub(1);
            if row.ref_count > 0 {
                debug!(key = %key, ref_count = row.ref_count, "Session reference dropped");
                return;
            }
            let row = state.rows.remove(key);
            // Only the side that unlinks the session reports it lost.
            let session = row
                .and_then(|r| r.session)
                .filter(|sid| state.by_session.remove(sid).is_some());
            (session, !state.peer_has_rows(&key.peer))
        };

        info!(key = %key, "Session released");
        if let Some(sid) = torn_down {
            self.notify(vec![Event::Lost(key.clone(), sid)]);
            self.schedule_leave(sid);
        }
        if stop_probing {
            self.stop_probing(&key.peer);
        }
    }

    /// Completion of a join started by `acquire` or rediscovery.
    pub fn on_join_complete(
        &self,
        peer: &PeerId,
        port: SessionPort,
        result: Result<SessionId, TransportError>,
    ) {
        let key = SessionKey::new(peer.clone(), port);
        match result {
            Ok(sid) => {
                let established = {
                    let mut state = self.lock();
                    match state.rows.get_mut(&key) {
                        Some(row) => {
                            row.join_pending = false;
                            row.session = Some(sid);
                            row.ever_established = true;
                            row.established_at = Some(Utc::now());
                            state.by_session.insert(sid, key.clone());
                            true
                        }
                        None => false,
                    }
                };
                if established {
                    info!(key = %key, session = %sid, "Session established");
                    self.notify(vec![Event::Established(key, sid)]);
                } else {
                    debug!(key = %key, session = %sid, "Join completed for released row, leaving");
                    self.schedule_leave(sid);
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Join failed");
                let stop_probing = {
                    let mut state = self.lock();
                    let Some(row) = state.rows.get_mut(&key) else {
                        return;
                    };
                    row.join_pending = false;
                    if row.ever_established {
                        false
                    } else {
                        state.rows.remove(&key);
                        !state.peer_has_rows(peer)
                    }
                };
                if stop_probing {
                    self.stop_probing(peer);
                }
                self.notify(vec![Event::JoinFailed(key)]);
            }
        }
    }

    /// The transport reported `session` as lost.
    pub fn on_session_lost(&self, session: SessionId, reason: &str) {
        let key = {
            let mut state = self.lock();
            let Some(key) = state.by_session.remove(&session) else {
                return;
            };
            if let Some(row) = state.rows.get_mut(&key) {
                if row.session == Some(session) {
                    row.session = None;
                    row.established_at = None;
                }
            }
            key
        };
        info!(key = %key, session = %session, reason, "Session lost");
        self.notify(vec![Event::Lost(key, session)]);
    }

    /// A probed peer is reachable: rejoin idle rows.
    pub fn on_destination_found(&self, peer: &PeerId) {
        let to_join: Vec<SessionPort> = {
            let mut state = self.lock();
            state
                .rows
                .iter_mut()
                .filter(|(k, row)| &k.peer == peer && !row.is_established() && !row.join_pending)
                .map(|(k, row)| {
                    row.join_pending = true;
                    k.port
                })
                .collect()
        };
        for port in to_join {
            debug!(peer = %peer, port, "Peer reachable again, rejoining");
            if let Err(e) = self.transport.join_session(peer, port) {
                self.on_join_complete(peer, port, Err(e));
            }
        }
    }

    /// A probed peer is unreachable: treat its established sessions as lost.
    pub fn on_destination_lost(&self, peer: &PeerId) {
        let lost: Vec<(SessionKey, SessionId)> = {
            let mut state = self.lock();
            let lost: Vec<(SessionKey, SessionId)> = state
                .rows
                .iter_mut()
                .filter(|(k, _)| &k.peer == peer)
                .filter_map(|(k, row)| {
                    let sid = row.session.take()?;
                    row.established_at = None;
                    Some((k.clone(), sid))
                })
                .collect();
            for (_, sid) in &lost {
                state.by_session.remove(sid);
            }
            lost
        };
        if lost.is_empty() {
            return;
        }
        info!(peer = %peer, sessions = lost.len(), "Peer unreachable");
        self.notify(
            lost.iter()
                .map(|(k, sid)| Event::Lost(k.clone(), *sid))
                .collect(),
        );
        for (_, sid) in lost {
            self.schedule_leave(sid);
        }
    }

    /// Whether (peer, port) has an established session.
    pub fn is_established(&self, peer: &PeerId, port: SessionPort) -> bool {
        self.session_id(peer, port).is_some()
    }

    /// Established session handle for (peer, port).
    pub fn session_id(&self, peer: &PeerId, port: SessionPort) -> Option<SessionId> {
        self.lock()
            .rows
            .get(&SessionKey::new(peer.clone(), port))
            .and_then(|row| row.session)
    }

    /// Key owning an established session.
    pub fn key_of(&self, session: SessionId) -> Option<SessionKey> {
        self.lock().by_session.get(&session).cloned()
    }

    /// Copy of the row for (peer, port).
    pub fn entry(&self, peer: &PeerId, port: SessionPort) -> Option<SessionEntry> {
        self.lock()
            .rows
            .get(&SessionKey::new(peer.clone(), port))
            .cloned()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    /// Whether the registry has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for scheduled leaves to be handed to the transport.
    pub async fn flush_teardown(&self) {
        self.teardown.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTransport, TransportCall};

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
    }

    impl SessionListener for RecordingListener {
        fn on_session_established(&self, key: &SessionKey, session: SessionId) {
            self.events.lock().unwrap().push(format!("up {key} {session}"));
        }
        fn on_session_lost(&self, key: &SessionKey, session: SessionId) {
            self.events.lock().unwrap().push(format!("down {key} {session}"));
        }
        fn on_join_failed(&self, key: &SessionKey) {
            self.events.lock().unwrap().push(format!("failed {key}"));
        }
    }

    fn setup() -> (Arc<MockTransport>, SessionRegistry, Arc<RecordingListener>) {
        let transport = Arc::new(MockTransport::new("local"));
        let registry = SessionRegistry::new(transport.clone()).unwrap();
        let listener = Arc::new(RecordingListener::default());
        let weak: Weak<dyn SessionListener> = Arc::downgrade(&listener) as Weak<dyn SessionListener>;
        registry.register_listener(weak);
        (transport, registry, listener)
    }

    fn peer() -> PeerId {
        PeerId::from("ddbus.Aprov")
    }

    #[tokio::test]
    async fn test_first_acquire_joins_and_probes() {
        let (transport, registry, _) = setup();
        assert!(!registry.acquire(&peer(), 5001));
        assert!(!registry.acquire(&peer(), 5001));
        let joins = transport.count(|c| matches!(c, TransportCall::Join(..)));
        assert_eq!(joins, 1);
        assert_eq!(
            transport.count(|c| matches!(c, TransportCall::AddProbe(..))),
            1
        );
        assert_eq!(registry.entry(&peer(), 5001).unwrap().ref_count, 2);
    }

    #[tokio::test]
    async fn test_acquire_release_balance_leaves_nothing() {
        let (transport, registry, listener) = setup();
        for _ in 0..5 {
            registry.acquire(&peer(), 5001);
        }
        registry.on_join_complete(&peer(), 5001, Ok(SessionId(9)));
        assert!(registry.is_established(&peer(), 5001));
        for _ in 0..4 {
            registry.release_session(SessionId(9));
            assert!(registry.is_established(&peer(), 5001));
        }
        registry.release_session(SessionId(9));
        assert!(registry.is_empty());
        registry.flush_teardown().await;
        assert_eq!(
            transport.count(|c| matches!(c, TransportCall::Leave(SessionId(9)))),
            1
        );
        assert_eq!(
            transport.count(|c| matches!(c, TransportCall::RemoveProbe(..))),
            1
        );
        let events = listener.events.lock().unwrap();
        assert_eq!(
            *events,
            vec!["up ddbus.Aprov:5001 9", "down ddbus.Aprov:5001 9"]
        );
    }

    #[tokio::test]
    async fn test_release_unknown_session_is_noop() {
        let (transport, registry, _) = setup();
        registry.release_session(SessionId(42));
        registry.release(&peer(), 1);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_join_completing_after_release_leaves_orphan() {
        let (transport, registry, listener) = setup();
        registry.acquire(&peer(), 5001);
        registry.release(&peer(), 5001);
        assert!(registry.is_empty());
        registry.on_join_complete(&peer(), 5001, Ok(SessionId(3)));
        registry.flush_teardown().await;
        assert_eq!(
            transport.count(|c| matches!(c, TransportCall::Leave(SessionId(3)))),
            1
        );
        assert!(listener.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_first_join_discards_row() {
        let (_transport, registry, listener) = setup();
        registry.acquire(&peer(), 5001);
        registry.on_join_complete(
            &peer(),
            5001,
            Err(TransportError::JoinRefused {
                peer: "ddbus.Aprov".to_string(),
                port: 5001,
            }),
        );
        assert!(registry.entry(&peer(), 5001).is_none());
        assert_eq!(
            *listener.events.lock().unwrap(),
            vec!["failed ddbus.Aprov:5001"]
        );
    }

    #[tokio::test]
    async fn test_session_lost_keeps_row_for_rejoin() {
        let (transport, registry, listener) = setup();
        registry.acquire(&peer(), 5001);
        registry.on_join_complete(&peer(), 5001, Ok(SessionId(4)));
        registry.on_session_lost(SessionId(4), "link down");
        registry.on_session_lost(SessionId(4), "again");

        let entry = registry.entry(&peer(), 5001).unwrap();
        assert!(!entry.is_established());
        assert_eq!(entry.ref_count, 1);
        assert_eq!(listener.events.lock().unwrap().len(), 2);

        // Probe rediscovery rejoins the idle row exactly once.
        registry.on_destination_found(&peer());
        registry.on_destination_found(&peer());
        assert_eq!(transport.count(|c| matches!(c, TransportCall::Join(..))), 2);

        // A failed rejoin keeps the row since it was established before.
        registry.on_join_complete(
            &peer(),
            5001,
            Err(TransportError::JoinRefused {
                peer: "ddbus.Aprov".to_string(),
                port: 5001,
            }),
        );
        assert!(registry.entry(&peer(), 5001).is_some());
    }

    #[tokio::test]
    async fn test_destination_lost_tears_down_established_rows() {
        let (transport, registry, listener) = setup();
        registry.acquire(&peer(), 5001);
        registry.acquire(&peer(), 6001);
        registry.on_join_complete(&peer(), 5001, Ok(SessionId(1)));

        registry.on_destination_lost(&peer());
        registry.flush_teardown().await;

        assert!(!registry.is_established(&peer(), 5001));
        assert_eq!(registry.len(), 2);
        assert_eq!(
            transport.count(|c| matches!(c, TransportCall::Leave(SessionId(1)))),
            1
        );
        let events = listener.events.lock().unwrap();
        assert_eq!(events.last().unwrap(), "down ddbus.Aprov:5001 1");
    }

    #[tokio::test]
    async fn test_release_and_session_loss_report_once() {
        let (transport, registry, listener) = setup();
        registry.acquire(&peer(), 5001);
        registry.on_join_complete(&peer(), 5001, Ok(SessionId(5)));
        registry.on_session_lost(SessionId(5), "link down");
        registry.release(&peer(), 5001);
        registry.flush_teardown().await;
        assert!(registry.is_empty());
        assert_eq!(
            *listener.events.lock().unwrap(),
            vec!["up ddbus.Aprov:5001 5", "down ddbus.Aprov:5001 5"]
        );
        assert_eq!(transport.count(|c| matches!(c, TransportCall::Leave(..))), 0);

        registry.acquire(&peer(), 5001);
        registry.on_join_complete(&peer(), 5001, Ok(SessionId(6)));
        registry.release(&peer(), 5001);
        registry.on_session_lost(SessionId(6), "late");
        registry.flush_teardown().await;
        let downs = listener
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("down") && e.ends_with(" 6"))
            .count();
        assert_eq!(downs, 1);
        assert_eq!(
            transport.count(|c| matches!(c, TransportCall::Leave(SessionId(6)))),
            1
        );
    }

    #[test]
    fn test_racing_release_and_loss_report_once() {
        let (_transport, registry, listener) = setup();
        let registry = Arc::new(registry);
        for i in 0..50u32 {
            registry.acquire(&peer(), 5001);
            registry.on_join_complete(&peer(), 5001, Ok(SessionId(100 + i)));
            let releaser = {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.release(&peer(), 5001))
            };
            registry.on_session_lost(SessionId(100 + i), "race");
            releaser.join().unwrap();
            assert!(registry.is_empty());
        }
        let downs = listener
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("down"))
            .count();
        assert_eq!(downs, 50);
    }

    #[tokio::test]
    async fn test_attached_monitor_follows_rows() {
        let (_transport, registry, _) = setup();
        registry.acquire(&peer(), 5001);

        let pinger: Arc<dyn crate::liveness::Pinger> = Arc::new(|_: &PeerId| true);
        let listener: Weak<dyn crate::liveness::ProbeListener> = Weak::<SessionRegistry>::new();
        let monitor = Arc::new(LivenessMonitor::new(pinger, listener, 1));
        registry.attach_monitor(&monitor);
        assert_eq!(monitor.destination_count(), 1);

        let other = PeerId::from("ddbus.Aother");
        registry.acquire(&other, 5001);
        assert_eq!(monitor.destination_count(), 2);
        registry.release(&other, 5001);
        registry.release(&peer(), 5001);
        assert_eq!(monitor.destination_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_listener_is_skipped() {
        let (_transport, registry, listener) = setup();
        drop(listener);
        registry.acquire(&peer(), 5001);
        registry.on_join_complete(&peer(), 5001, Ok(SessionId(1)));
        assert!(registry.is_established(&peer(), 5001));
    }
}
