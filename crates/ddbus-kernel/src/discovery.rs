//! Discovery coordinator: turns announcements into cache updates.
//!
//! For every announcing peer the coordinator keeps the latest object
//! description and holds one session reference. Each new description is
//! diffed against the previous one per (path, interface) pair: a REMOVE
//! pass for pairs that disappeared, then an ADD pass for pairs that
//! appeared. Every object operation becomes one task on the serial task
//! queue, routed to the caches of the interfaces involved. Diffs are only
//! applied while the peer's session is established; otherwise the
//! description is just stored until the session comes up.
//!
//! Lock order: `discovered` before `caches`. Session registry calls that
//! may notify listeners are never made with either lock held.

use crate::interest::InterestRegistry;
use crate::object_cache::{
    AddOutcome, CacheObserver, InterfaceCache, Notification, ObjectAllocator, ObserverId,
    UpdateOutcome,
};
use crate::session::{SessionListener, SessionRegistry};
use crate::task_queue::SerialTaskQueue;
use ddbus_types::{
    Announcement, BusConfig, DdError, DdResult, InterfaceName, ObjectDescription, ObjectId, ObjectKey,
    ObjectPath, PeerId, SessionId, SessionKey, SessionPort,
};
use ddbus_wire::SignalMessage;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Add,
    Remove,
}

struct DiscoveredPeer {
    description: ObjectDescription,
    /// The coordinator holds a session reference for this peer.
    holds_session: bool,
}

/// Consumer-side discovery state for one bus connection.
pub struct DiscoveryCoordinator {
    config: BusConfig,
    sessions: Arc<SessionRegistry>,
    interests: Arc<InterestRegistry>,
    queue: SerialTaskQueue,
    allocator: Arc<dyn ObjectAllocator>,
    caches: Mutex<HashMap<InterfaceName, Arc<InterfaceCache>>>,
    discovered: Mutex<HashMap<SessionKey, DiscoveredPeer>>,
}

impl DiscoveryCoordinator {
    /// Create a coordinator. It must also be registered as a session
    /// listener on `sessions`.
    pub fn new(
        config: BusConfig,
        sessions: Arc<SessionRegistry>,
        interests: Arc<InterestRegistry>,
        queue: SerialTaskQueue,
        allocator: Arc<dyn ObjectAllocator>,
    ) -> Self {
        Self {
            config,
            sessions,
            interests,
            queue,
            allocator,
            caches: Mutex::new(HashMap::new()),
            discovered: Mutex::new(HashMap::new()),
        }
    }

    fn caches(&self) -> std::sync::MutexGuard<'_, HashMap<InterfaceName, Arc<InterfaceCache>>> {
        self.caches.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn discovered(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, DiscoveredPeer>> {
        self.discovered.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue one task per object in `pairs`, touching only interfaces that
    /// currently have a cache.
    fn enqueue_pairs(
        &self,
        caches: &HashMap<InterfaceName, Arc<InterfaceCache>>,
        peer: &PeerId,
        session: SessionId,
        pairs: BTreeMap<ObjectPath, Vec<InterfaceName>>,
        action: Action,
    ) {
        for (path, interfaces) in pairs {
            let targets: Vec<Weak<InterfaceCache>> = interfaces
                .iter()
                .filter_map(|iface| caches.get(iface))
                .map(Arc::downgrade)
                .collect();
            if targets.is_empty() {
                continue;
            }
            let id = ObjectId::new(peer.clone(), path, session);
            self.enqueue_object_task(id, targets, action);
        }
    }

    fn enqueue_object_task(&self, id: ObjectId, targets: Vec<Weak<InterfaceCache>>, action: Action) {
        self.queue.enqueue(move || {
            let mut notifications: Vec<Notification> = Vec::new();
            for cache in targets.iter().filter_map(Weak::upgrade) {
                match action {
                    Action::Add => match cache.add_object(&id) {
                        AddOutcome::Added(n) | AddOutcome::Resurrected(n) => notifications.push(n),
                        AddOutcome::AlreadyLive(_) | AddOutcome::AllocationFailed => {}
                    },
                    Action::Remove => {
                        if let Some(n) = cache.remove_object(&id.key()) {
                            notifications.push(n);
                        }
                    }
                }
            }
            for n in notifications {
                n.deliver();
            }
        });
    }

    fn enqueue_full(&self, key: &SessionKey, session: SessionId, description: &ObjectDescription, action: Action) {
        let pairs = description.difference(&ObjectDescription::new());
        let caches = self.caches();
        self.enqueue_pairs(&caches, &key.peer, session, pairs, action);
    }

    /// A peer announced its objects.
    pub fn on_announce(&self, announcement: Announcement) {
        let Announcement {
            peer,
            port,
            description,
            ..
        } = announcement;
        if !self.config.accepts_peer(peer.as_str()) {
            debug!(peer = %peer, "Ignoring announcement outside name prefix");
            return;
        }
        let key = SessionKey::new(peer.clone(), port);

        let needs_session = {
            let mut discovered = self.discovered();
            let entry = discovered.entry(key.clone()).or_insert_with(|| DiscoveredPeer {
                description: ObjectDescription::new(),
                holds_session: false,
            });
            let needs_session = !entry.holds_session;
            entry.holds_session = true;
            let old = std::mem::replace(&mut entry.description, description);

            if let Some(sid) = self.sessions.session_id(&peer, port) {
                let removed = old.difference(&entry.description);
                let added = entry.description.difference(&old);
                debug!(
                    key = %key,
                    removed = removed.len(),
                    added = added.len(),
                    "Applying announcement diff"
                );
                let caches = self.caches();
                self.enqueue_pairs(&caches, &peer, sid, removed, Action::Remove);
                self.enqueue_pairs(&caches, &peer, sid, added, Action::Add);
            }
            needs_session
        };

        if needs_session {
            debug!(key = %key, "Acquiring session for discovered peer");
            self.sessions.acquire(&peer, port);
        }
    }

    /// A peer stopped announcing.
    pub fn on_peer_gone(&self, peer: &PeerId, port: SessionPort) {
        let key = SessionKey::new(peer.clone(), port);
        let Some(entry) = self.discovered().remove(&key) else {
            return;
        };
        info!(key = %key, "Peer no longer announcing");
        if let Some(sid) = self.sessions.session_id(peer, port) {
            self.enqueue_full(&key, sid, &entry.description, Action::Remove);
        }
        if entry.holds_session {
            self.sessions.release(peer, port);
        }
    }

    /// Route a signal received from a remote object.
    pub fn on_signal(&self, sender: &PeerId, signal: SignalMessage) {
        let Some(cache) = self.caches().get(&signal.interface).cloned() else {
            debug!(interface = %signal.interface, "Signal for unobserved interface dropped");
            return;
        };
        let key = ObjectKey {
            peer: sender.clone(),
            path: signal.path.clone(),
        };
        if signal.is_properties_changed() {
            self.queue.enqueue(move || match cache.update_object(&key, &signal.args) {
                UpdateOutcome::Updated(n) | UpdateOutcome::Failed(n) => n.deliver(),
                UpdateOutcome::Missing => {}
            });
        } else {
            self.queue.enqueue(move || {
                if !cache.dispatch_signal(&key, &signal) {
                    debug!(peer = %key.peer, path = %key.path, member = %signal.member, "Signal from unknown emitter dropped");
                }
            });
        }
    }

    /// Attach an observer to `interface`, creating and populating the
    /// cache on first use. The observer is caught up on the queue. Interest
    /// is registered last so snapshots sent in reply find the cache.
    pub(crate) fn register_observer(
        &self,
        interface: &InterfaceName,
        id: ObserverId,
        observer: Weak<dyn CacheObserver>,
    ) -> DdResult<Arc<InterfaceCache>> {
        let (cache, created) = {
            let mut caches = self.caches();
            let (cache, created) = match caches.get(interface) {
                Some(cache) => (Arc::clone(cache), false),
                None => {
                    let cache = Arc::new(InterfaceCache::new(
                        interface.clone(),
                        Arc::clone(&self.allocator),
                    ));
                    caches.insert(interface.clone(), Arc::clone(&cache));
                    (cache, true)
                }
            };
            if cache.add_observer(id, observer).is_none() {
                return Err(DdError::AlreadyRegistered {
                    interface: interface.to_string(),
                    observer: id,
                });
            }
            (cache, created)
        };

        if created {
            self.populate(&cache);
        }
        let catch_up = Arc::clone(&cache);
        self.queue.enqueue(move || catch_up.notify_observer(id));

        if let Err(e) = self.interests.register_observer(interface, id) {
            self.detach_from_cache(interface, id);
            return Err(e);
        }
        Ok(cache)
    }

    /// Fill a new cache from every discovered peer with a live session.
    fn populate(&self, cache: &Arc<InterfaceCache>) {
        let discovered = self.discovered();
        let mut objects = 0usize;
        for (key, entry) in discovered.iter() {
            let Some(sid) = self.sessions.session_id(&key.peer, key.port) else {
                continue;
            };
            for path in entry.description.objects_implementing(cache.interface()) {
                let id = ObjectId::new(key.peer.clone(), path.clone(), sid);
                self.enqueue_object_task(id, vec![Arc::downgrade(cache)], Action::Add);
                objects += 1;
            }
        }
        debug!(interface = %cache.interface(), objects, "Populating new cache");
    }

    /// Detach an observer. The last one drops the cache and withdraws
    /// interest. Unknown observers are ignored.
    pub(crate) fn unregister_observer(&self, interface: &InterfaceName, id: ObserverId) {
        self.detach_from_cache(interface, id);
        self.interests.unregister_observer(interface, id);
    }

    fn detach_from_cache(&self, interface: &InterfaceName, id: ObserverId) {
        let mut caches = self.caches();
        if let Some(cache) = caches.get(interface) {
            if cache.remove_observer(id) == 0 {
                caches.remove(interface);
                debug!(interface = %interface, "Dropping interface cache");
            }
        }
    }

    /// Cache for `interface`, if any observer exists.
    pub fn cache(&self, interface: &InterfaceName) -> Option<Arc<InterfaceCache>> {
        self.caches().get(interface).cloned()
    }

    /// Number of peers with a stored description.
    pub fn discovered_peers(&self) -> usize {
        self.discovered().len()
    }

    /// Stored description for (peer, port).
    pub fn description(&self, peer: &PeerId, port: SessionPort) -> Option<ObjectDescription> {
        self.discovered()
            .get(&SessionKey::new(peer.clone(), port))
            .map(|entry| entry.description.clone())
    }
}

impl SessionListener for DiscoveryCoordinator {
    fn on_session_established(&self, key: &SessionKey, session: SessionId) {
        let discovered = self.discovered();
        if let Some(entry) = discovered.get(key) {
            self.enqueue_full(key, session, &entry.description, Action::Add);
        }
    }

    fn on_session_lost(&self, key: &SessionKey, session: SessionId) {
        let discovered = self.discovered();
        if let Some(entry) = discovered.get(key) {
            self.enqueue_full(key, session, &entry.description, Action::Remove);
        }
    }

    fn on_join_failed(&self, key: &SessionKey) {
        // The registry dropped a never-established row; the next
        // announcement acquires again.
        if self.sessions.entry(&key.peer, key.port).is_some() {
            return;
        }
        if let Some(entry) = self.discovered().get_mut(key) {
            entry.holds_session = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_cache::{PropertyMapAllocator, RemoteObject};
    use crate::testing::{MockTransport, TransportCall};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl CacheObserver for Recorder {
        fn object_added(&self, o: &Arc<RemoteObject>) {
            self.events.lock().unwrap().push(format!("add {}", o.path()));
        }
        fn object_updated(&self, o: &Arc<RemoteObject>) {
            self.events.lock().unwrap().push(format!("update {}", o.path()));
        }
        fn object_removed(&self, o: &Arc<RemoteObject>) {
            self.events.lock().unwrap().push(format!("remove {}", o.path()));
        }
        fn signal(&self, o: &Arc<RemoteObject>, s: &SignalMessage) {
            self.events
                .lock()
                .unwrap()
                .push(format!("signal {} {}", o.path(), s.member));
        }
    }

    struct Fixture {
        transport: Arc<MockTransport>,
        sessions: Arc<SessionRegistry>,
        coordinator: Arc<DiscoveryCoordinator>,
        queue: SerialTaskQueue,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::new("ddbus.Alocal"));
        let sessions = Arc::new(SessionRegistry::new(transport.clone()).unwrap());
        let interests = Arc::new(InterestRegistry::new(
            transport.clone(),
            Duration::from_secs(1),
        ));
        let queue = SerialTaskQueue::new("test-observers").unwrap();
        let coordinator = Arc::new(DiscoveryCoordinator::new(
            BusConfig::default(),
            sessions.clone(),
            interests.clone(),
            queue.clone(),
            Arc::new(PropertyMapAllocator),
        ));
        let c: Weak<dyn SessionListener> = Arc::downgrade(&coordinator) as Weak<dyn SessionListener>;
        sessions.register_listener(c);
        let i: Weak<dyn SessionListener> = Arc::downgrade(&interests) as Weak<dyn SessionListener>;
        sessions.register_listener(i);
        Fixture {
            transport,
            sessions,
            coordinator,
            queue,
        }
    }

    fn announce(f: &Fixture, peer: &str, desc: ObjectDescription) {
        f.coordinator.on_announce(Announcement {
            peer: PeerId::from(peer),
            port: 5001,
            description: desc,
            metadata: Default::default(),
        });
    }

    fn observe(f: &Fixture, iface: &str, id: ObserverId) -> (Arc<Recorder>, Arc<InterfaceCache>) {
        let rec = Arc::new(Recorder::default());
        let weak: Weak<dyn CacheObserver> = Arc::downgrade(&rec) as Weak<dyn CacheObserver>;
        let cache = f
            .coordinator
            .register_observer(&InterfaceName::from(iface), id, weak)
            .unwrap();
        (rec, cache)
    }

    const PEER: &str = "ddbus.Aprov";

    #[tokio::test]
    async fn test_announcement_without_session_is_stored_only() {
        let f = fixture();
        let (rec, cache) = observe(&f, "X", 1);
        announce(&f, PEER, ObjectDescription::new().with_object("/o1", ["X"]));
        f.queue.flush().await;
        assert!(cache.is_empty());
        assert!(rec.events.lock().unwrap().is_empty());
        assert_eq!(f.coordinator.discovered_peers(), 1);
        assert_eq!(f.transport.count(|c| matches!(c, TransportCall::Join(..))), 1);
    }

    #[tokio::test]
    async fn test_session_established_adds_objects() {
        let f = fixture();
        let (rec, cache) = observe(&f, "X", 1);
        announce(
            &f,
            PEER,
            ObjectDescription::new()
                .with_object("/o1", ["X"])
                .with_object("/o2", ["Y"]),
        );
        f.sessions.on_join_complete(&PeerId::from(PEER), 5001, Ok(SessionId(1)));
        f.queue.flush().await;
        assert_eq!(cache.len(), 1);
        assert_eq!(*rec.events.lock().unwrap(), vec!["add /o1"]);
    }

    #[tokio::test]
    async fn test_diff_removes_before_adding() {
        let f = fixture();
        let (rec, _cache) = observe(&f, "X", 1);
        announce(&f, PEER, ObjectDescription::new().with_object("/a", ["X"]));
        f.sessions.on_join_complete(&PeerId::from(PEER), 5001, Ok(SessionId(1)));
        announce(&f, PEER, ObjectDescription::new().with_object("/b", ["X"]));
        f.queue.flush().await;
        assert_eq!(
            *rec.events.lock().unwrap(),
            vec!["add /a", "remove /a", "add /b"]
        );
        // Re-announcing keeps the single session reference.
        let entry = f.sessions.entry(&PeerId::from(PEER), 5001).unwrap();
        assert_eq!(entry.ref_count, 1);
    }

    #[tokio::test]
    async fn test_late_joiner_sees_existing_objects_once() {
        let f = fixture();
        announce(
            &f,
            PEER,
            ObjectDescription::new()
                .with_object("/a", ["X"])
                .with_object("/b", ["X"]),
        );
        f.sessions.on_join_complete(&PeerId::from(PEER), 5001, Ok(SessionId(1)));

        let (first, _) = observe(&f, "X", 1);
        f.queue.flush().await;
        let (late, cache) = observe(&f, "X", 2);
        f.queue.flush().await;

        assert_eq!(cache.len(), 2);
        assert_eq!(*first.events.lock().unwrap(), vec!["add /a", "add /b"]);
        assert_eq!(*late.events.lock().unwrap(), vec!["add /a", "add /b"]);
    }

    #[tokio::test]
    async fn test_session_lost_removes_everything() {
        let f = fixture();
        let (rec, cache) = observe(&f, "X", 1);
        announce(&f, PEER, ObjectDescription::new().with_object("/a", ["X"]));
        f.sessions.on_join_complete(&PeerId::from(PEER), 5001, Ok(SessionId(1)));
        f.sessions.on_session_lost(SessionId(1), "gone");
        f.queue.flush().await;
        assert!(cache.is_empty());
        assert_eq!(*rec.events.lock().unwrap(), vec!["add /a", "remove /a"]);
    }

    #[tokio::test]
    async fn test_peer_gone_removes_and_releases() {
        let f = fixture();
        let (_rec, cache) = observe(&f, "X", 1);
        announce(&f, PEER, ObjectDescription::new().with_object("/a", ["X"]));
        f.sessions.on_join_complete(&PeerId::from(PEER), 5001, Ok(SessionId(1)));
        f.coordinator.on_peer_gone(&PeerId::from(PEER), 5001);
        f.queue.flush().await;
        f.sessions.flush_teardown().await;

        assert!(cache.is_empty());
        assert!(f.sessions.is_empty());
        assert_eq!(f.coordinator.discovered_peers(), 0);
        assert_eq!(
            f.transport.count(|c| matches!(c, TransportCall::Leave(SessionId(1)))),
            1
        );
    }

    #[tokio::test]
    async fn test_prefix_filter() {
        let f = fixture();
        announce(&f, "org.other", ObjectDescription::new().with_object("/a", ["X"]));
        assert_eq!(f.coordinator.discovered_peers(), 0);
        assert!(f.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_first_join_reacquires_on_next_announce() {
        let f = fixture();
        announce(&f, PEER, ObjectDescription::new().with_object("/a", ["X"]));
        f.sessions.on_join_complete(
            &PeerId::from(PEER),
            5001,
            Err(ddbus_wire::TransportError::JoinRefused {
                peer: PEER.to_string(),
                port: 5001,
            }),
        );
        assert!(f.sessions.is_empty());
        announce(&f, PEER, ObjectDescription::new().with_object("/a", ["X"]));
        assert_eq!(f.transport.count(|c| matches!(c, TransportCall::Join(..))), 2);
        assert_eq!(f.sessions.entry(&PeerId::from(PEER), 5001).unwrap().ref_count, 1);
    }

    #[tokio::test]
    async fn test_property_and_app_signals_are_routed() {
        let f = fixture();
        let (rec, cache) = observe(&f, "X", 1);
        announce(&f, PEER, ObjectDescription::new().with_object("/a", ["X"]));
        f.sessions.on_join_complete(&PeerId::from(PEER), 5001, Ok(SessionId(1)));

        let peer = PeerId::from(PEER);
        f.coordinator.on_signal(
            &peer,
            SignalMessage::properties_changed(
                ObjectPath::from("/a"),
                InterfaceName::from("X"),
                json!({"level": 3}),
            ),
        );
        f.coordinator
            .on_signal(&peer, SignalMessage::new("/a", "X", "Alarm", json!(null)));
        f.coordinator
            .on_signal(&peer, SignalMessage::new("/ghost", "X", "Alarm", json!(null)));
        f.queue.flush().await;

        let object = cache.living_objects().pop().unwrap();
        assert_eq!(object.properties(), json!({"level": 3}));
        assert_eq!(
            *rec.events.lock().unwrap(),
            vec!["add /a", "update /a", "signal /a Alarm"]
        );
    }

    #[tokio::test]
    async fn test_interest_snapshot_reaches_new_cache() {
        let f = fixture();
        announce(&f, PEER, ObjectDescription::new().with_object("/a", ["X"]));
        f.sessions.on_join_complete(&PeerId::from(PEER), 5001, Ok(SessionId(1)));
        f.queue.flush().await;

        // Provider answering RegisterInterest before the call returns.
        let coordinator = Arc::downgrade(&f.coordinator);
        f.transport.set_call_hook(move |call| {
            if call.member != ddbus_wire::message::REGISTER_INTEREST {
                return;
            }
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.on_signal(
                    &PeerId::from(PEER),
                    SignalMessage::properties_changed(
                        ObjectPath::from("/a"),
                        InterfaceName::from("X"),
                        json!({"n": 1}),
                    ),
                );
            }
        });

        let (rec, cache) = observe(&f, "X", 1);
        f.queue.flush().await;

        let object = cache.living_objects().pop().unwrap();
        assert_eq!(object.properties(), json!({"n": 1}));
        assert_eq!(*rec.events.lock().unwrap(), vec!["add /a", "update /a"]);
    }

    #[tokio::test]
    async fn test_duplicate_observer_is_rejected() {
        let f = fixture();
        let (rec, cache) = observe(&f, "X", 1);
        let weak: Weak<dyn CacheObserver> = Arc::downgrade(&rec) as Weak<dyn CacheObserver>;
        let result = f
            .coordinator
            .register_observer(&InterfaceName::from("X"), 1, weak);
        assert!(matches!(
            result,
            Err(DdError::AlreadyRegistered { observer: 1, .. })
        ));
        assert_eq!(cache.observer_count(), 1);
        assert!(f.coordinator.cache(&InterfaceName::from("X")).is_some());
    }

    #[tokio::test]
    async fn test_last_observer_drops_cache() {
        let f = fixture();
        let (_a, _) = observe(&f, "X", 1);
        let (_b, _) = observe(&f, "X", 2);
        f.coordinator.unregister_observer(&InterfaceName::from("X"), 1);
        assert!(f.coordinator.cache(&InterfaceName::from("X")).is_some());
        f.coordinator.unregister_observer(&InterfaceName::from("X"), 2);
        assert!(f.coordinator.cache(&InterfaceName::from("X")).is_none());
        // Unknown observer: no-op.
        f.coordinator.unregister_observer(&InterfaceName::from("X"), 3);
    }
}
