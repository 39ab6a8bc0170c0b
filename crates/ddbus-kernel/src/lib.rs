//! ddbus kernel: distributed object observation over a message bus.
//!
//! A [`BusConnection`] watches peers announcing object descriptions, keeps
//! refcounted sessions to them and maintains one live cache per observed
//! interface. Applications follow those caches through [`Observer`]s and
//! call remote methods through [`InvocationFuture`]s. The same connection
//! can publish local objects for other peers to observe.
//!
//! ## Architecture
//!
//! - **SessionRegistry**: refcounted sessions per (peer, port), driven by liveness
//! - **DiscoveryCoordinator**: announcement diffs routed to interface caches
//! - **InterfaceCache**: live objects and a graveyard for resurrection
//! - **InterestRegistry**: tells providers which interfaces are observed
//! - **Provider**: published objects and the interest receiver
//! - **SerialTaskQueue**: the single thread all cache mutation runs on

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod interest;
pub mod invocation;
pub mod liveness;
pub mod logging;
pub mod object_cache;
pub mod observer;
pub mod provider;
pub mod session;
pub mod task_queue;

#[cfg(test)]
mod testing;

pub use connection::BusConnection;
pub use error::{KernelError, KernelResult};
pub use invocation::{CallResult, InvocationFuture, InvocationState};
pub use liveness::{LivenessMonitor, Pinger, ProbeListener};
pub use object_cache::{ObjectAllocator, PropertyMapAllocator, RemoteObject};
pub use observer::{ObjectListener, Observer, SignalListener};
pub use provider::{MethodHandler, Provider};
pub use session::{SessionListener, SessionRegistry};
pub use task_queue::SerialTaskQueue;
