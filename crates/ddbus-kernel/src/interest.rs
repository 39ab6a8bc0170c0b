//! Consumer-side interest registry.
//!
//! Tracks which interfaces local observers care about and keeps every
//! joined provider session informed through `RegisterInterest` /
//! `UnregisterInterest`. Messages are sent while the registry lock is held
//! so a provider never sees an unregister overtake its register.

use crate::object_cache::ObserverId;
use crate::session::SessionListener;
use ddbus_types::{DdError, DdResult, InterfaceName, PeerId, SessionId, SessionKey};
use ddbus_wire::{BusTransport, MethodCall};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Default)]
struct InterestState {
    observers: BTreeMap<InterfaceName, BTreeSet<ObserverId>>,
    joined: BTreeMap<SessionId, PeerId>,
}

/// Interest bookkeeping for one bus connection.
pub struct InterestRegistry {
    transport: Arc<dyn BusTransport>,
    call_timeout: Duration,
    state: Mutex<InterestState>,
}

impl InterestRegistry {
    /// Create a registry sending through `transport`.
    pub fn new(transport: Arc<dyn BusTransport>, call_timeout: Duration) -> Self {
        Self {
            transport,
            call_timeout,
            state: Mutex::new(InterestState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InterestState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, session: SessionId, peer: &PeerId, call: MethodCall) {
        let member = call.member.clone();
        if let Err(e) = self
            .transport
            .call_method(session, peer, call, self.call_timeout, None)
        {
            warn!(session = %session, peer = %peer, member = %member, error = %e, "Interest call failed");
        }
    }

    /// Record `observer` for `interface`. The first observer of an
    /// interface announces it to every joined session. Returns whether this
    /// was the first observer.
    pub fn register_observer(&self, interface: &InterfaceName, observer: ObserverId) -> DdResult<bool> {
        let mut state = self.lock();
        let set = state.observers.entry(interface.clone()).or_default();
        if set.contains(&observer) {
            return Err(DdError::AlreadyRegistered {
                interface: interface.to_string(),
                observer,
            });
        }
        set.insert(observer);
        let first = set.len() == 1;
        if first {
            debug!(interface = %interface, sessions = state.joined.len(), "Registering interest");
            for (sid, peer) in &state.joined {
                self.send(*sid, peer, MethodCall::register_interest(interface));
            }
        }
        Ok(first)
    }

    /// Forget `observer`. The last observer of an interface withdraws it
    /// from every joined session. Unknown observers are ignored. Returns
    /// whether the interface lost its last observer.
    pub fn unregister_observer(&self, interface: &InterfaceName, observer: ObserverId) -> bool {
        let mut state = self.lock();
        let Some(set) = state.observers.get_mut(interface) else {
            return false;
        };
        if !set.remove(&observer) || !set.is_empty() {
            return false;
        }
        state.observers.remove(interface);
        debug!(interface = %interface, sessions = state.joined.len(), "Withdrawing interest");
        for (sid, peer) in &state.joined {
            self.send(*sid, peer, MethodCall::unregister_interest(interface));
        }
        true
    }

    /// Interfaces with at least one observer.
    pub fn interests(&self) -> Vec<InterfaceName> {
        self.lock().observers.keys().cloned().collect()
    }

    /// Observers registered for `interface`.
    pub fn observer_count(&self, interface: &InterfaceName) -> usize {
        self.lock()
            .observers
            .get(interface)
            .map(BTreeSet::len)
            .unwrap_or(0)
    }

    /// Number of sessions interest is propagated to.
    pub fn joined_sessions(&self) -> usize {
        self.lock().joined.len()
    }
}

impl SessionListener for InterestRegistry {
    fn on_session_established(&self, key: &SessionKey, session: SessionId) {
        let mut state = self.lock();
        state.joined.insert(session, key.peer.clone());
        for interface in state.observers.keys() {
            self.send(session, &key.peer, MethodCall::register_interest(interface));
        }
    }

    fn on_session_lost(&self, _key: &SessionKey, session: SessionId) {
        self.lock().joined.remove(&session);
    }
}
