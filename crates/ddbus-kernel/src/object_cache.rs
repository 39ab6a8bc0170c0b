//! Per-interface object cache.
//!
//! An [`InterfaceCache`] holds the live remote objects implementing one
//! interface, a graveyard of weakly referenced objects that were removed
//! recently, and the set of observers attached to the interface.
//!
//! Every mutation takes the cache lock only long enough to update the maps
//! and copy the observers that should hear about it. The caller then
//! delivers the returned [`Notification`] with no lock held. Mutations are
//! only ever issued from the serial task queue.

use ddbus_types::{
    InterfaceName, ObjectId, ObjectKey, ObjectPath, PeerId, PropertyMap, ProxyState, SessionId,
    UnmarshalError,
};
use ddbus_wire::SignalMessage;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, warn};

/// Stable identifier of an observer.
pub type ObserverId = u64;

/// Creates the local state for a newly discovered object.
pub trait ObjectAllocator: Send + Sync {
    /// Allocate state for `id` on `interface`. `None` means the object is
    /// not representable locally and is skipped.
    fn allocate(&self, id: &ObjectId, interface: &InterfaceName) -> Option<Box<dyn ProxyState>>;
}

/// Allocator backing every object with an untyped [`PropertyMap`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PropertyMapAllocator;

impl ObjectAllocator for PropertyMapAllocator {
    fn allocate(&self, _id: &ObjectId, _interface: &InterfaceName) -> Option<Box<dyn ProxyState>> {
        Some(Box::new(PropertyMap::new()))
    }
}

/// Handle to a remote object.
pub struct RemoteObject {
    key: ObjectKey,
    interface: InterfaceName,
    session: Mutex<SessionId>,
    alive: AtomicBool,
    state: RwLock<Box<dyn ProxyState>>,
}

impl RemoteObject {
    fn new(id: &ObjectId, interface: InterfaceName, state: Box<dyn ProxyState>) -> Self {
        Self {
            key: id.key(),
            interface,
            session: Mutex::new(id.session),
            alive: AtomicBool::new(false),
            state: RwLock::new(state),
        }
    }

    /// Full id, including the session the object is currently reached on.
    pub fn id(&self) -> ObjectId {
        ObjectId {
            peer: self.key.peer.clone(),
            path: self.key.path.clone(),
            session: self.session(),
        }
    }

    /// Session-independent identity.
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Hosting peer.
    pub fn peer(&self) -> &PeerId {
        &self.key.peer
    }

    /// Object path on the hosting peer.
    pub fn path(&self) -> &ObjectPath {
        &self.key.path
    }

    /// Interface this handle was created for.
    pub fn interface(&self) -> &InterfaceName {
        &self.interface
    }

    /// Session the object is currently reached on.
    pub fn session(&self) -> SessionId {
        *self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the object is currently live in its cache.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Current properties as JSON.
    pub fn properties(&self) -> Value {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }

    /// Borrow typed state. `None` if the state is not a `T`.
    pub fn with_state<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.as_any().downcast_ref::<T>().map(f)
    }

    fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    fn set_session(&self, session: SessionId) {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = session;
    }

    fn apply(&self, properties: &Value) -> Result<(), UnmarshalError> {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .apply(properties)
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("peer", &self.key.peer)
            .field("path", &self.key.path)
            .field("interface", &self.interface)
            .field("session", &self.session())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Receiver of cache events. Implemented by the observer core.
pub(crate) trait CacheObserver: Send + Sync {
    fn object_added(&self, object: &Arc<RemoteObject>);
    fn object_updated(&self, object: &Arc<RemoteObject>);
    fn object_removed(&self, object: &Arc<RemoteObject>);
    fn signal(&self, object: &Arc<RemoteObject>, signal: &SignalMessage);
}

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Added,
    Updated,
    Removed,
}

/// An object event plus the observers that must hear about it.
pub struct Notification {
    kind: NotificationKind,
    object: Arc<RemoteObject>,
    observers: Vec<Arc<dyn CacheObserver>>,
}

impl Notification {
    /// The event kind.
    pub fn kind(&self) -> NotificationKind {
        self.kind
    }

    /// The object concerned.
    pub fn object(&self) -> &Arc<RemoteObject> {
        &self.object
    }

    /// Number of observers that will be called.
    pub fn audience(&self) -> usize {
        self.observers.len()
    }

    /// Call every observer. Must be invoked without any cache lock held.
    pub fn deliver(self) {
        for observer in &self.observers {
            match self.kind {
                NotificationKind::Added => observer.object_added(&self.object),
                NotificationKind::Updated => observer.object_updated(&self.object),
                NotificationKind::Removed => observer.object_removed(&self.object),
            }
        }
    }
}

/// Result of [`InterfaceCache::add_object`].
pub enum AddOutcome {
    /// A new handle was allocated.
    Added(Notification),
    /// A graveyard handle came back to life.
    Resurrected(Notification),
    /// The object was already live. Its session was refreshed.
    AlreadyLive(Arc<RemoteObject>),
    /// The allocator declined the object.
    AllocationFailed,
}

/// Result of [`InterfaceCache::update_object`].
pub enum UpdateOutcome {
    /// Properties applied.
    Updated(Notification),
    /// The update could not be applied; the object was retired.
    Failed(Notification),
    /// No live object with that key.
    Missing,
}

struct ObserverSlot {
    observer: Weak<dyn CacheObserver>,
    caught_up: bool,
}

#[derive(Default)]
struct CacheState {
    live: HashMap<ObjectKey, Arc<RemoteObject>>,
    graveyard: HashMap<ObjectKey, Weak<RemoteObject>>,
    observers: BTreeMap<ObserverId, ObserverSlot>,
}

impl CacheState {
    fn audience(&self) -> Vec<Arc<dyn CacheObserver>> {
        self.observers
            .values()
            .filter(|slot| slot.caught_up)
            .filter_map(|slot| slot.observer.upgrade())
            .collect()
    }

    fn gc(&mut self) -> usize {
        let before = self.graveyard.len();
        self.graveyard.retain(|_, weak| weak.strong_count() > 0);
        before - self.graveyard.len()
    }

    fn retire(&mut self, key: &ObjectKey) -> Option<Arc<RemoteObject>> {
        let object = self.live.remove(key)?;
        object.set_alive(false);
        self.graveyard.insert(key.clone(), Arc::downgrade(&object));
        Some(object)
    }
}

/// Cache of remote objects implementing one interface.
pub struct InterfaceCache {
    interface: InterfaceName,
    allocator: Arc<dyn ObjectAllocator>,
    state: Mutex<CacheState>,
}

impl InterfaceCache {
    /// Create an empty cache.
    pub fn new(interface: InterfaceName, allocator: Arc<dyn ObjectAllocator>) -> Self {
        Self {
            interface,
            allocator,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Interface served by this cache.
    pub fn interface(&self) -> &InterfaceName {
        &self.interface
    }

    /// Make `id` live.
    pub fn add_object(&self, id: &ObjectId) -> AddOutcome {
        let key = id.key();
        let mut state = self.lock();

        if let Some(existing) = state.live.get(&key) {
            existing.set_session(id.session);
            return AddOutcome::AlreadyLive(Arc::clone(existing));
        }

        let resurrected = state.graveyard.remove(&key).and_then(|weak| weak.upgrade());
        let (object, was_dead) = match resurrected {
            Some(object) => {
                debug!(interface = %self.interface, object = %id, "Resurrecting object");
                object.set_session(id.session);
                (object, true)
            }
            None => match self.allocator.allocate(id, &self.interface) {
                Some(proxy) => (
                    Arc::new(RemoteObject::new(id, self.interface.clone(), proxy)),
                    false,
                ),
                None => {
                    warn!(interface = %self.interface, object = %id, "Object allocation failed");
                    return AddOutcome::AllocationFailed;
                }
            },
        };

        object.set_alive(true);
        state.live.insert(key, Arc::clone(&object));
        let notification = Notification {
            kind: NotificationKind::Added,
            object,
            observers: state.audience(),
        };
        if was_dead {
            AddOutcome::Resurrected(notification)
        } else {
            AddOutcome::Added(notification)
        }
    }

    /// Move `key` from live to the graveyard. `None` if it was not live.
    pub fn remove_object(&self, key: &ObjectKey) -> Option<Notification> {
        let mut state = self.lock();
        let object = state.retire(key)?;
        debug!(interface = %self.interface, peer = %key.peer, path = %key.path, "Object removed");
        let observers = state.audience();
        drop(state);
        self.gc();
        Some(Notification {
            kind: NotificationKind::Removed,
            object,
            observers,
        })
    }

    /// Apply a property snapshot to a live object.
    pub fn update_object(&self, key: &ObjectKey, properties: &Value) -> UpdateOutcome {
        let mut state = self.lock();
        let Some(object) = state.live.get(key).cloned() else {
            debug!(interface = %self.interface, peer = %key.peer, path = %key.path, "Update for unknown object");
            return UpdateOutcome::Missing;
        };
        match object.apply(properties) {
            Ok(()) => UpdateOutcome::Updated(Notification {
                kind: NotificationKind::Updated,
                object,
                observers: state.audience(),
            }),
            Err(e) => {
                warn!(
                    interface = %self.interface,
                    peer = %key.peer,
                    path = %key.path,
                    error = %e,
                    "Property update rejected, retiring object"
                );
                state.retire(key);
                UpdateOutcome::Failed(Notification {
                    kind: NotificationKind::Removed,
                    object,
                    observers: state.audience(),
                })
            }
        }
    }

    /// Live object by key. Cache miss is `None`.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<RemoteObject>> {
        self.lock().live.get(key).cloned()
    }

    /// Snapshot of the live objects, ordered by key.
    pub fn living_objects(&self) -> Vec<Arc<RemoteObject>> {
        let state = self.lock();
        let mut objects: Vec<Arc<RemoteObject>> = state.live.values().cloned().collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        objects
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    /// Whether the cache has no live objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of graveyard entries (reclaimable or not).
    pub fn graveyard_len(&self) -> usize {
        self.lock().graveyard.len()
    }

    /// Drop graveyard entries nobody references any more.
    pub fn gc(&self) -> usize {
        self.lock().gc()
    }

    /// Attach an observer. `None` if `id` is already attached.
    pub(crate) fn add_observer(&self, id: ObserverId, observer: Weak<dyn CacheObserver>) -> Option<usize> {
        let mut state = self.lock();
        if state.observers.contains_key(&id) {
            return None;
        }
        state.observers.insert(
            id,
            ObserverSlot {
                observer,
                caught_up: false,
            },
        );
        Some(state.observers.len())
    }

    /// Detach an observer. Returns the remaining count.
    pub fn remove_observer(&self, id: ObserverId) -> usize {
        let mut state = self.lock();
        state.observers.remove(&id);
        state.observers.len()
    }

    /// Number of attached observers.
    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    /// Replay the live set to a freshly attached observer. From here on the
    /// observer receives regular notifications. Runs once per observer.
    pub fn notify_observer(&self, id: ObserverId) {
        let (observer, objects) = {
            let mut state = self.lock();
            let Some(slot) = state.observers.get_mut(&id) else {
                return;
            };
            if slot.caught_up {
                return;
            }
            slot.caught_up = true;
            let Some(observer) = slot.observer.upgrade() else {
                return;
            };
            let mut objects: Vec<Arc<RemoteObject>> = state.live.values().cloned().collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            (observer, objects)
        };
        debug!(interface = %self.interface, observer = id, objects = objects.len(), "Catching up observer");
        for object in &objects {
            observer.object_added(object);
        }
    }

    /// Route an application signal from a live object to caught-up observers.
    pub(crate) fn dispatch_signal(&self, key: &ObjectKey, signal: &SignalMessage) -> bool {
        let (object, observers) = {
            let state = self.lock();
            let Some(object) = state.live.get(key).cloned() else {
                return false;
            };
            (object, state.audience())
        };
        for observer in &observers {
            observer.signal(&object, signal);
        }
        true
    }
}
