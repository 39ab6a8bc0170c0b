//! ddbus wire layer.
//!
//! Defines the framed message envelopes exchanged between peers, the
//! interest protocol constants, and the transport seam the kernel talks to.
//!
//! ## Architecture
//!
//! - **BusTransport**: outbound primitives (join, leave, probe, call, signal, announce)
//! - **BusHandler**: inbound events a transport delivers to the kernel
//! - **WireMessage**: JSON-framed protocol messages
//! - **LoopbackBus**: in-process bus connecting several endpoints, used by tests

pub mod loopback;
pub mod message;
pub mod transport;

pub use loopback::{LoopbackBus, LoopbackEndpoint};
pub use message::{MethodCall, SignalMessage, WireMessage, WireMessageKind};
pub use transport::{BusHandler, BusTransport, ReplySink, TransportError};
