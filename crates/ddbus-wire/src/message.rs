//! Wire message types.
//!
//! Method calls, replies and signals between peers travel as JSON-framed
//! envelopes. Each frame is prefixed with a 4-byte big-endian length header.

use ddbus_types::{InterfaceName, ObjectPath};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Object path of the provider-side interest receiver.
pub const INTEREST_PATH: &str = "/ddbus/interest_receiver";

/// Interface implemented by the interest receiver.
pub const INTEREST_INTERFACE: &str = "ddbus.interest_receiver";

/// Declare interest in an interface. Single string argument, no reply.
pub const REGISTER_INTEREST: &str = "RegisterInterest";

/// Withdraw interest in an interface. Single string argument, no reply.
pub const UNREGISTER_INTEREST: &str = "UnregisterInterest";

/// Signal member carrying a property snapshot for the emitting object.
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

/// Maximum single frame size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// A wire protocol message (envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Unique message ID.
    pub id: String,
    /// Message variant.
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

/// The different kinds of wire messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessageKind {
    /// Method call addressed to an object.
    #[serde(rename = "method_call")]
    MethodCall(MethodCall),
    /// Successful reply to a method call.
    #[serde(rename = "method_return")]
    MethodReturn {
        /// ID of the call being answered.
        reply_to: String,
        /// Returned value.
        #[serde(default)]
        result: Value,
    },
    /// Error reply to a method call.
    #[serde(rename = "error")]
    Error {
        /// ID of the call being answered.
        reply_to: String,
        /// Error name.
        name: String,
        /// Error description.
        description: String,
    },
    /// One-way signal emitted by an object.
    #[serde(rename = "signal")]
    Signal(SignalMessage),
}

/// A method call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    /// Target object path.
    pub path: ObjectPath,
    /// Interface the member belongs to.
    pub interface: InterfaceName,
    /// Method name.
    pub member: String,
    /// Arguments.
    #[serde(default)]
    pub args: Value,
    /// Caller does not expect a reply.
    #[serde(default)]
    pub no_reply: bool,
}

impl MethodCall {
    /// Build a call expecting a reply.
    pub fn new(
        path: impl Into<ObjectPath>,
        interface: impl Into<InterfaceName>,
        member: impl Into<String>,
        args: Value,
    ) -> Self {
        Self {
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            args,
            no_reply: false,
        }
    }

    /// Mark the call as fire-and-forget.
    pub fn without_reply(mut self) -> Self {
        self.no_reply = true;
        self
    }

    /// `RegisterInterest(interface)` addressed to the interest receiver.
    pub fn register_interest(interface: &InterfaceName) -> Self {
        Self::new(
            INTEREST_PATH,
            INTEREST_INTERFACE,
            REGISTER_INTEREST,
            Value::String(interface.to_string()),
        )
        .without_reply()
    }

    /// `UnregisterInterest(interface)` addressed to the interest receiver.
    pub fn unregister_interest(interface: &InterfaceName) -> Self {
        Self::new(
            INTEREST_PATH,
            INTEREST_INTERFACE,
            UNREGISTER_INTEREST,
            Value::String(interface.to_string()),
        )
        .without_reply()
    }

    /// Whether this call targets the interest receiver.
    pub fn is_interest_call(&self) -> bool {
        self.path.as_str() == INTEREST_PATH && self.interface.as_str() == INTEREST_INTERFACE
    }
}

/// A signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    /// Emitting object path.
    pub path: ObjectPath,
    /// Interface the signal belongs to.
    pub interface: InterfaceName,
    /// Signal name.
    pub member: String,
    /// Arguments.
    #[serde(default)]
    pub args: Value,
}

impl SignalMessage {
    /// Build a signal.
    pub fn new(
        path: impl Into<ObjectPath>,
        interface: impl Into<InterfaceName>,
        member: impl Into<String>,
        args: Value,
    ) -> Self {
        Self {
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            args,
        }
    }

    /// Property snapshot signal for `interface` on `path`.
    pub fn properties_changed(path: ObjectPath, interface: InterfaceName, properties: Value) -> Self {
        Self {
            path,
            interface,
            member: PROPERTIES_CHANGED.to_string(),
            args: properties,
        }
    }

    /// Whether this signal carries a property snapshot.
    pub fn is_properties_changed(&self) -> bool {
        self.member == PROPERTIES_CHANGED
    }
}

/// Encode a wire message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a WireMessage.
pub fn decode_message(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}
