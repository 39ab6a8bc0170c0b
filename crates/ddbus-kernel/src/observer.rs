//! Public observation API.
//!
//! An [`Observer`] follows every remote object implementing one interface.
//! Listeners attached to it hear about objects appearing, changing and
//! disappearing, always from the connection's serial task queue. Dropping
//! the observer unregisters it.

use crate::connection::BusConnection;
use crate::discovery::DiscoveryCoordinator;
use crate::object_cache::{CacheObserver, InterfaceCache, ObserverId, RemoteObject};
use ddbus_types::{DdResult, InterfaceName, ObjectId};
use ddbus_wire::SignalMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::debug;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Object lifecycle callbacks. All methods default to no-ops.
pub trait ObjectListener: Send + Sync {
    /// An object became available.
    fn on_add(&self, _object: &Arc<RemoteObject>) {}

    /// An object's properties changed.
    fn on_update(&self, _object: &Arc<RemoteObject>) {}

    /// An object went away.
    fn on_remove(&self, _object: &Arc<RemoteObject>) {}
}

/// Callback for an application signal emitted by an observed object.
pub trait SignalListener: Send + Sync {
    fn on_signal(&self, object: &Arc<RemoteObject>, signal: &SignalMessage);
}

struct ObserverCore {
    listeners: RwLock<Vec<Arc<dyn ObjectListener>>>,
    signal_listeners: RwLock<HashMap<String, Vec<Arc<dyn SignalListener>>>>,
}

impl ObserverCore {
    fn listeners(&self) -> Vec<Arc<dyn ObjectListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl CacheObserver for ObserverCore {
    fn object_added(&self, object: &Arc<RemoteObject>) {
        for listener in self.listeners() {
            listener.on_add(object);
        }
    }

    fn object_updated(&self, object: &Arc<RemoteObject>) {
        for listener in self.listeners() {
            listener.on_update(object);
        }
    }

    fn object_removed(&self, object: &Arc<RemoteObject>) {
        for listener in self.listeners() {
            listener.on_remove(object);
        }
    }

    fn signal(&self, object: &Arc<RemoteObject>, signal: &SignalMessage) {
        let listeners = self
            .signal_listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&signal.member)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener.on_signal(object, signal);
        }
    }
}

/// Consumer-side subscription to one interface.
pub struct Observer {
    id: ObserverId,
    interface: InterfaceName,
    core: Arc<ObserverCore>,
    cache: Arc<InterfaceCache>,
    discovery: Weak<DiscoveryCoordinator>,
}

impl Observer {
    /// Start observing `interface` on `connection`. `listener`, if given,
    /// receives an add for every object that already exists.
    pub fn create(
        connection: &BusConnection,
        interface: impl Into<InterfaceName>,
        listener: Option<Arc<dyn ObjectListener>>,
    ) -> DdResult<Self> {
        let interface = interface.into();
        let id = NEXT_OBSERVER_ID.fetch_add(1, Ordering::SeqCst);
        let core = Arc::new(ObserverCore {
            listeners: RwLock::new(listener.into_iter().collect()),
            signal_listeners: RwLock::new(HashMap::new()),
        });
        let discovery = connection.discovery();
        let weak_core: Weak<dyn CacheObserver> = Arc::downgrade(&core) as Weak<dyn CacheObserver>;
        let cache = discovery.register_observer(&interface, id, weak_core)?;
        debug!(interface = %interface, observer = id, "Observer created");
        Ok(Self {
            id,
            interface,
            core,
            cache,
            discovery: Arc::downgrade(discovery),
        })
    }

    /// Stable id of this observer.
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Observed interface.
    pub fn interface(&self) -> &InterfaceName {
        &self.interface
    }

    /// Attach a lifecycle listener. Objects that already exist are not
    /// replayed to it.
    pub fn add_listener(&self, listener: Arc<dyn ObjectListener>) {
        self.core
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Detach a lifecycle listener. Returns whether it was attached.
    pub fn remove_listener(&self, listener: &Arc<dyn ObjectListener>) -> bool {
        let mut listeners = self.core.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Attach a listener for signal `member`.
    pub fn add_signal_listener(&self, member: impl Into<String>, listener: Arc<dyn SignalListener>) {
        self.core
            .signal_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(member.into())
            .or_default()
            .push(listener);
    }

    /// Detach a signal listener. Returns whether it was attached.
    pub fn remove_signal_listener(&self, member: &str, listener: &Arc<dyn SignalListener>) -> bool {
        let mut map = self
            .core
            .signal_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let Some(list) = map.get_mut(member) else {
            return false;
        };
        let before = list.len();
        list.retain(|l| !Arc::ptr_eq(l, listener));
        let removed = list.len() != before;
        if list.is_empty() {
            map.remove(member);
        }
        removed
    }

    /// Snapshot of the live objects.
    pub fn objects(&self) -> Vec<Arc<RemoteObject>> {
        self.cache.living_objects()
    }

    /// Iterate over a snapshot of the live objects.
    pub fn iter(&self) -> std::vec::IntoIter<Arc<RemoteObject>> {
        self.objects().into_iter()
    }

    /// Number of live objects.
    pub fn size(&self) -> usize {
        self.cache.len()
    }

    /// Live object by id. The session part of the id is ignored.
    pub fn get(&self, id: &ObjectId) -> Option<Arc<RemoteObject>> {
        self.cache.get(&id.key())
    }
}

impl<'a> IntoIterator for &'a Observer {
    type Item = Arc<RemoteObject>;
    type IntoIter = std::vec::IntoIter<Arc<RemoteObject>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.id)
            .field("interface", &self.interface)
            .field("size", &self.size())
            .finish()
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        if let Some(discovery) = self.discovery.upgrade() {
            discovery.unregister_observer(&self.interface, self.id);
            debug!(interface = %self.interface, observer = self.id, "Observer dropped");
        }
    }
}
