//! Identifiers for peers, sessions, objects and interfaces.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Wrap a string.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Unique bus name of a peer process.
    PeerId
);

string_id!(
    /// Fully qualified interface name, e.g. `org.example.Door`.
    InterfaceName
);

string_id!(
    /// Object path on a peer, e.g. `/doors/front`.
    ObjectPath
);

impl PeerId {
    /// Generate a unique peer name under `prefix`.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}{}", uuid::Uuid::new_v4().simple()))
    }
}

/// Port a peer binds to accept sessions on.
pub type SessionPort = u16;

/// Handle of an established point-to-point session, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of a peer session: one row per (peer, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    /// The remote peer.
    pub peer: PeerId,
    /// The port the peer accepts sessions on.
    pub port: SessionPort,
}

impl SessionKey {
    /// Build a key.
    pub fn new(peer: impl Into<PeerId>, port: SessionPort) -> Self {
        Self {
            peer: peer.into(),
            port,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.peer, self.port)
    }
}

/// Identity of a remote object inside a cache. The session is not
/// part of the key: the same object reached over a new session is the
/// same object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Peer hosting the object.
    pub peer: PeerId,
    /// Path of the object on that peer.
    pub path: ObjectPath,
}

/// Full identifier of a remote object, including the session it is reached on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    /// Peer hosting the object.
    pub peer: PeerId,
    /// Path of the object on that peer.
    pub path: ObjectPath,
    /// Session the object is reachable over.
    pub session: SessionId,
}

impl ObjectId {
    /// Build an object id.
    pub fn new(peer: impl Into<PeerId>, path: impl Into<ObjectPath>, session: SessionId) -> Self {
        Self {
            peer: peer.into(),
            path: path.into(),
            session,
        }
    }

    /// The session-independent cache key.
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            peer: self.peer.clone(),
            path: self.path.clone(),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({}{}, session {})", self.peer, self.path, self.session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_ignores_session() {
        let a = ObjectId::new("peer.1", "/o1", SessionId(1));
        let b = ObjectId::new("peer.1", "/o1", SessionId(7));
        assert_ne!(a, b);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_generated_peer_ids_are_unique() {
        let a = PeerId::generate("ddbus.A");
        let b = PeerId::generate("ddbus.A");
        assert!(a.as_str().starts_with("ddbus.A"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_key_display() {
        let key = SessionKey::new("peer.1", 5001);
        assert_eq!(key.to_string(), "peer.1:5001");
    }
}
