//! Recording transport for deterministic unit tests.

use ddbus_types::{ObjectDescription, PeerId, SessionId, SessionPort};
use ddbus_wire::{
    BusHandler, BusTransport, MethodCall, ReplySink, SignalMessage, TransportError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Join(PeerId, SessionPort),
    Leave(SessionId),
    AddProbe(PeerId),
    RemoveProbe(PeerId),
    Call {
        session: SessionId,
        destination: PeerId,
        call: MethodCall,
        expects_reply: bool,
    },
    Signal(SessionId, SignalMessage),
    Bind(SessionPort),
    Announce(SessionPort, ObjectDescription),
    Withdraw(SessionPort),
}

type CallHook = Box<dyn Fn(&MethodCall) + Send + Sync>;

pub struct MockTransport {
    name: PeerId,
    calls: Mutex<Vec<TransportCall>>,
    sinks: Mutex<Vec<ReplySink>>,
    on_call: Mutex<Option<CallHook>>,
    pub fail_calls: AtomicBool,
}

impl MockTransport {
    pub fn new(name: &str) -> Self {
        Self {
            name: PeerId::from(name),
            calls: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
            on_call: Mutex::new(None),
            fail_calls: AtomicBool::new(false),
        }
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&TransportCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    /// Method calls with the given member, in order.
    pub fn method_calls(&self, member: &str) -> Vec<(SessionId, MethodCall)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                TransportCall::Call { session, call, .. } if call.member == member => {
                    Some((*session, call.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn signals(&self) -> Vec<(SessionId, SignalMessage)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                TransportCall::Signal(sid, sig) => Some((*sid, sig.clone())),
                _ => None,
            })
            .collect()
    }

    /// Run `hook` synchronously for every accepted method call.
    pub fn set_call_hook(&self, hook: impl Fn(&MethodCall) + Send + Sync + 'static) {
        *self.on_call.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn take_sinks(&self) -> Vec<ReplySink> {
        std::mem::take(&mut *self.sinks.lock().unwrap())
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl BusTransport for MockTransport {
    fn unique_name(&self) -> PeerId {
        self.name.clone()
    }

    fn set_handler(&self, _handler: Weak<dyn BusHandler>) -> Result<(), TransportError> {
        Ok(())
    }

    fn join_session(&self, peer: &PeerId, port: SessionPort) -> Result<(), TransportError> {
        self.record(TransportCall::Join(peer.clone(), port));
        Ok(())
    }

    fn leave_session(&self, session: SessionId) -> Result<(), TransportError> {
        self.record(TransportCall::Leave(session));
        Ok(())
    }

    fn add_probe_destination(&self, peer: &PeerId) -> Result<(), TransportError> {
        self.record(TransportCall::AddProbe(peer.clone()));
        Ok(())
    }

    fn remove_probe_destination(&self, peer: &PeerId) {
        self.record(TransportCall::RemoveProbe(peer.clone()));
    }

    fn call_method(
        &self,
        session: SessionId,
        destination: &PeerId,
        call: MethodCall,
        _timeout: Duration,
        reply: Option<ReplySink>,
    ) -> Result<(), TransportError> {
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(TransportError::UnknownSession(session));
        }
        if let Some(hook) = self.on_call.lock().unwrap().as_ref() {
            hook(&call);
        }
        self.record(TransportCall::Call {
            session,
            destination: destination.clone(),
            call,
            expects_reply: reply.is_some(),
        });
        if let Some(sink) = reply {
            self.sinks.lock().unwrap().push(sink);
        }
        Ok(())
    }

    fn send_signal(&self, session: SessionId, signal: SignalMessage) -> Result<(), TransportError> {
        self.record(TransportCall::Signal(session, signal));
        Ok(())
    }

    fn bind_session_port(&self, port: SessionPort) -> Result<(), TransportError> {
        self.record(TransportCall::Bind(port));
        Ok(())
    }

    fn announce(&self, port: SessionPort, description: &ObjectDescription) -> Result<(), TransportError> {
        self.record(TransportCall::Announce(port, description.clone()));
        Ok(())
    }

    fn withdraw_announcement(&self, port: SessionPort) -> Result<(), TransportError> {
        self.record(TransportCall::Withdraw(port));
        Ok(())
    }
}
