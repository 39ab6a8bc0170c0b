//! Provider side: published objects and the interest receiver.
//!
//! The [`Provider`] owns the objects this process exposes. Every change to
//! the set of objects re-announces the full description on the service
//! port. Property snapshots and application signals go only to sessions
//! whose interest set contains the interface.

use dashmap::DashMap;
use ddbus_types::{
    CallError, DdError, DdResult, InterfaceName, ObjectDescription, ObjectPath, PeerId, SessionId,
    SessionPort,
};
use ddbus_wire::message::{REGISTER_INTEREST, UNREGISTER_INTEREST};
use ddbus_wire::{BusTransport, MethodCall, SignalMessage};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Error name for calls addressed to an object that is not published.
pub const UNKNOWN_OBJECT_ERROR: &str = "ddbus.Error.UnknownObject";

/// Error name for calls to a member the object does not handle.
pub const UNKNOWN_METHOD_ERROR: &str = "ddbus.Error.UnknownMethod";

/// Error name for malformed arguments.
pub const INVALID_ARGS_ERROR: &str = "ddbus.Error.InvalidArgs";

/// Serves method calls for a published object.
pub trait MethodHandler: Send + Sync {
    fn handle(&self, sender: &PeerId, call: &MethodCall) -> Result<Value, CallError>;
}

impl<F> MethodHandler for F
where
    F: Fn(&PeerId, &MethodCall) -> Result<Value, CallError> + Send + Sync,
{
    fn handle(&self, sender: &PeerId, call: &MethodCall) -> Result<Value, CallError> {
        self(sender, call)
    }
}

fn remote_error(name: &str, description: impl Into<String>) -> CallError {
    CallError::Remote {
        name: name.to_string(),
        description: description.into(),
    }
}

struct PublishedObject {
    interfaces: BTreeMap<InterfaceName, Value>,
    handler: Option<Arc<dyn MethodHandler>>,
}

/// Objects exposed by this process.
pub struct Provider {
    transport: Arc<dyn BusTransport>,
    port: SessionPort,
    port_bound: AtomicBool,
    objects: RwLock<BTreeMap<ObjectPath, PublishedObject>>,
    interests: DashMap<SessionId, BTreeSet<InterfaceName>>,
    hosted: DashMap<SessionId, PeerId>,
}

impl Provider {
    /// Create a provider announcing on `port`.
    pub fn new(transport: Arc<dyn BusTransport>, port: SessionPort) -> Self {
        Self {
            transport,
            port,
            port_bound: AtomicBool::new(false),
            objects: RwLock::new(BTreeMap::new()),
            interests: DashMap::new(),
            hosted: DashMap::new(),
        }
    }

    fn ensure_bound(&self) -> DdResult<()> {
        if self.port_bound.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.transport
            .bind_session_port(self.port)
            .map_err(|e| DdError::Transport(e.to_string()))?;
        self.port_bound.store(true, Ordering::SeqCst);
        info!(port = self.port, "Session port bound");
        Ok(())
    }

    fn describe(objects: &BTreeMap<ObjectPath, PublishedObject>) -> ObjectDescription {
        let mut description = ObjectDescription::new();
        for (path, object) in objects {
            for interface in object.interfaces.keys() {
                description.insert(path.clone(), interface.clone());
            }
        }
        description
    }

    fn announce(&self, description: &ObjectDescription) -> DdResult<()> {
        debug!(port = self.port, objects = description.len(), "Announcing objects");
        self.transport
            .announce(self.port, description)
            .map_err(|e| DdError::Transport(e.to_string()))
    }

    /// Send `signal` to every session interested in its interface.
    fn broadcast(&self, signal: &SignalMessage) -> usize {
        let mut sent = 0;
        for entry in self.interests.iter() {
            if !entry.value().contains(&signal.interface) {
                continue;
            }
            let session = *entry.key();
            match self.transport.send_signal(session, signal.clone()) {
                Ok(()) => sent += 1,
                Err(e) => warn!(session = %session, member = %signal.member, error = %e, "Failed to send signal"),
            }
        }
        sent
    }

    /// Publish (or replace) an object implementing `interfaces`, each with
    /// its initial property snapshot.
    pub fn publish<I>(
        &self,
        path: impl Into<ObjectPath>,
        interfaces: I,
        handler: Option<Arc<dyn MethodHandler>>,
    ) -> DdResult<()>
    where
        I: IntoIterator<Item = (InterfaceName, Value)>,
    {
        let path = path.into();
        let interfaces: BTreeMap<InterfaceName, Value> = interfaces.into_iter().collect();
        if interfaces.is_empty() {
            return Err(DdError::InvalidInput(format!(
                "object {path} implements no interface"
            )));
        }
        if let Some((iface, _)) = interfaces.iter().find(|(_, props)| !props.is_object()) {
            return Err(DdError::InvalidInput(format!(
                "properties of {iface} on {path} must be an object"
            )));
        }
        self.ensure_bound()?;

        let description = {
            let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
            objects.insert(
                path.clone(),
                PublishedObject {
                    interfaces,
                    handler,
                },
            );
            Self::describe(&objects)
        };
        info!(path = %path, "Object published");
        self.announce(&description)?;

        // Same lock `update_properties` broadcasts under.
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        if let Some(object) = objects.get(&path) {
            for (iface, props) in &object.interfaces {
                self.broadcast(&SignalMessage::properties_changed(
                    path.clone(),
                    iface.clone(),
                    props.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Merge `properties` into the published state and push them to
    /// interested sessions. Returns the number of sessions reached.
    /// Concurrent updates reach every session in the order they were
    /// applied.
    pub fn update_properties(
        &self,
        path: &ObjectPath,
        interface: &InterfaceName,
        properties: Value,
    ) -> DdResult<usize> {
        let Value::Object(changes) = &properties else {
            return Err(DdError::InvalidInput(
                "property update must be an object".to_string(),
            ));
        };
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let object = objects
            .get_mut(path)
            .ok_or_else(|| DdError::NotPublished(path.to_string()))?;
        let current = object.interfaces.get_mut(interface).ok_or_else(|| {
            DdError::InvalidInput(format!("{path} does not implement {interface}"))
        })?;
        if let Value::Object(map) = current {
            for (name, value) in changes {
                map.insert(name.clone(), value.clone());
            }
        }
        // Sent before the lock is released: applied order is wire order.
        let sent = self.broadcast(&SignalMessage::properties_changed(
            path.clone(),
            interface.clone(),
            properties,
        ));
        drop(objects);
        Ok(sent)
    }

    /// Emit an application signal from a published object to interested
    /// sessions. Returns the number of sessions reached.
    pub fn emit_signal(
        &self,
        path: &ObjectPath,
        interface: &InterfaceName,
        member: &str,
        args: Value,
    ) -> DdResult<usize> {
        {
            let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
            let object = objects
                .get(path)
                .ok_or_else(|| DdError::NotPublished(path.to_string()))?;
            if !object.interfaces.contains_key(interface) {
                return Err(DdError::InvalidInput(format!(
                    "{path} does not implement {interface}"
                )));
            }
        }
        Ok(self.broadcast(&SignalMessage::new(
            path.clone(),
            interface.clone(),
            member,
            args,
        )))
    }

    /// Withdraw an object and re-announce.
    pub fn unpublish(&self, path: &ObjectPath) -> DdResult<()> {
        let description = {
            let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
            if objects.remove(path).is_none() {
                return Err(DdError::NotPublished(path.to_string()));
            }
            Self::describe(&objects)
        };
        info!(path = %path, "Object unpublished");
        self.announce(&description)
    }

    /// Current description of the published objects.
    pub fn description(&self) -> ObjectDescription {
        Self::describe(&self.objects.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Published property snapshot of `interface` on `path`.
    pub fn properties(&self, path: &ObjectPath, interface: &InterfaceName) -> Option<Value> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .and_then(|o| o.interfaces.get(interface).cloned())
    }

    /// Sessions currently interested in `interface`.
    pub fn interested_sessions(&self, interface: &InterfaceName) -> usize {
        self.interests
            .iter()
            .filter(|entry| entry.value().contains(interface))
            .count()
    }

    /// Record interest of `session` and resend every matching snapshot to it.
    pub fn register_interest(&self, session: SessionId, interface: InterfaceName) {
        self.interests
            .entry(session)
            .or_default()
            .insert(interface.clone());
        debug!(session = %session, interface = %interface, "Interest registered");

        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        for (path, object) in objects.iter() {
            let Some(props) = object.interfaces.get(&interface) else {
                continue;
            };
            let signal =
                SignalMessage::properties_changed(path.clone(), interface.clone(), props.clone());
            if let Err(e) = self.transport.send_signal(session, signal) {
                warn!(session = %session, path = %path, error = %e, "Failed to resend snapshot");
            }
        }
    }

    /// Withdraw interest of `session`.
    pub fn unregister_interest(&self, session: SessionId, interface: &InterfaceName) {
        let now_empty = match self.interests.get_mut(&session) {
            Some(mut set) => {
                set.remove(interface);
                set.is_empty()
            }
            None => return,
        };
        if now_empty {
            self.interests.remove(&session);
        }
        debug!(session = %session, interface = %interface, "Interest withdrawn");
    }

    /// A consumer joined a session on the service port.
    pub fn on_session_joined(&self, session: SessionId, joiner: &PeerId) {
        debug!(session = %session, joiner = %joiner, "Consumer joined");
        self.hosted.insert(session, joiner.clone());
    }

    /// A hosted session ended; its interest goes with it.
    pub fn on_session_lost(&self, session: SessionId) -> bool {
        let hosted = self.hosted.remove(&session).is_some();
        let had_interest = self.interests.remove(&session).is_some();
        if hosted || had_interest {
            debug!(session = %session, "Consumer session closed");
        }
        hosted
    }

    /// Number of consumer sessions currently hosted.
    pub fn hosted_sessions(&self) -> usize {
        self.hosted.len()
    }

    /// Dispatch an inbound method call.
    pub fn handle_method_call(
        &self,
        sender: &PeerId,
        session: SessionId,
        call: MethodCall,
    ) -> Result<Value, CallError> {
        if call.is_interest_call() {
            let interface = call
                .args
                .as_str()
                .map(InterfaceName::from)
                .ok_or_else(|| remote_error(INVALID_ARGS_ERROR, "expected interface name"))?;
            return match call.member.as_str() {
                REGISTER_INTEREST => {
                    self.register_interest(session, interface);
                    Ok(Value::Null)
                }
                UNREGISTER_INTEREST => {
                    self.unregister_interest(session, &interface);
                    Ok(Value::Null)
                }
                other => Err(remote_error(UNKNOWN_METHOD_ERROR, other)),
            };
        }

        let handler = {
            let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
            let object = objects
                .get(&call.path)
                .ok_or_else(|| remote_error(UNKNOWN_OBJECT_ERROR, call.path.to_string()))?;
            if !object.interfaces.contains_key(&call.interface) {
                return Err(remote_error(
                    UNKNOWN_METHOD_ERROR,
                    format!("{} on {}", call.interface, call.path),
                ));
            }
            object.handler.clone()
        };
        match handler {
            Some(handler) => handler.handle(sender, &call),
            None => Err(remote_error(
                UNKNOWN_METHOD_ERROR,
                format!("{}.{}", call.interface, call.member),
            )),
        }
    }
}
