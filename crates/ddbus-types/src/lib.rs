//! Core types for the ddbus object observation layer.
//!
//! This crate defines the identifiers, object descriptions, property state
//! and error types shared by the wire layer and the kernel. It contains no
//! business logic and no async runtime.

pub mod config;
pub mod description;
pub mod error;
pub mod ids;
pub mod properties;

pub use config::BusConfig;
pub use description::{Announcement, ObjectDescription};
pub use error::{CallError, DdError, DdResult};
pub use ids::{InterfaceName, ObjectId, ObjectKey, ObjectPath, PeerId, SessionId, SessionKey, SessionPort};
pub use properties::{PropertyMap, ProxyState, Typed, UnmarshalError};
