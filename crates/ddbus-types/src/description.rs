//! Object descriptions carried by discovery announcements.
//!
//! An [`ObjectDescription`] maps every object path a peer exposes to the set
//! of interfaces implemented at that path. The discovery coordinator diffs
//! consecutive descriptions from the same peer at (path, interface)
//! granularity.

use crate::ids::{InterfaceName, ObjectPath, PeerId, SessionPort};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Objects and interfaces a peer currently exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectDescription {
    objects: BTreeMap<ObjectPath, BTreeSet<InterfaceName>>,
}

impl ObjectDescription {
    /// Create an empty description.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add an object implementing `interfaces`.
    pub fn with_object<I, S>(mut self, path: impl Into<ObjectPath>, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<InterfaceName>,
    {
        let entry = self.objects.entry(path.into()).or_default();
        entry.extend(interfaces.into_iter().map(Into::into));
        self
    }

    /// Record that `path` implements `interface`.
    pub fn insert(&mut self, path: ObjectPath, interface: InterfaceName) {
        self.objects.entry(path).or_default().insert(interface);
    }

    /// Drop an object entirely. Returns true if it was present.
    pub fn remove_object(&mut self, path: &ObjectPath) -> bool {
        self.objects.remove(path).is_some()
    }

    /// Interfaces implemented at `path`, if the object is described.
    pub fn interfaces(&self, path: &ObjectPath) -> Option<&BTreeSet<InterfaceName>> {
        self.objects.get(path)
    }

    /// Whether `path` implements `interface`.
    pub fn implements(&self, path: &ObjectPath, interface: &InterfaceName) -> bool {
        self.objects
            .get(path)
            .map(|set| set.contains(interface))
            .unwrap_or(false)
    }

    /// Paths of all objects implementing `interface`.
    pub fn objects_implementing<'a>(
        &'a self,
        interface: &'a InterfaceName,
    ) -> impl Iterator<Item = &'a ObjectPath> + 'a {
        self.objects
            .iter()
            .filter(move |(_, ifaces)| ifaces.contains(interface))
            .map(|(path, _)| path)
    }

    /// Iterate over all objects.
    pub fn iter(&self) -> impl Iterator<Item = (&ObjectPath, &BTreeSet<InterfaceName>)> {
        self.objects.iter()
    }

    /// Number of described objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether no objects are described.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// (path, interface) pairs present in `self` but absent from `other`,
    /// grouped by path. Paths with no remaining interfaces are omitted.
    pub fn difference(&self, other: &ObjectDescription) -> BTreeMap<ObjectPath, Vec<InterfaceName>> {
        let mut out = BTreeMap::new();
        for (path, ifaces) in &self.objects {
            let missing: Vec<InterfaceName> = match other.objects.get(path) {
                Some(theirs) => ifaces.difference(theirs).cloned().collect(),
                None => ifaces.iter().cloned().collect(),
            };
            if !missing.is_empty() {
                out.insert(path.clone(), missing);
            }
        }
        out
    }
}

/// A discovery announcement received from a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Unique bus name of the announcing peer.
    pub peer: PeerId,
    /// Session port the peer accepts joins on.
    pub port: SessionPort,
    /// Objects the peer currently exposes.
    pub description: ObjectDescription,
    /// Free-form metadata (application name, device id, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difference_whole_object() {
        let old = ObjectDescription::new().with_object("/a", ["X"]);
        let new = ObjectDescription::new().with_object("/b", ["X"]);

        let removed = old.difference(&new);
        let added = new.difference(&old);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[&ObjectPath::from("/a")], vec![InterfaceName::from("X")]);
        assert_eq!(added[&ObjectPath::from("/b")], vec![InterfaceName::from("X")]);
    }

    #[test]
    fn test_difference_is_per_interface() {
        // Same path: X survives, Y goes away, Z shows up.
        let old = ObjectDescription::new().with_object("/a", ["X", "Y"]);
        let new = ObjectDescription::new().with_object("/a", ["X", "Z"]);

        let removed = old.difference(&new);
        let added = new.difference(&old);
        assert_eq!(removed[&ObjectPath::from("/a")], vec![InterfaceName::from("Y")]);
        assert_eq!(added[&ObjectPath::from("/a")], vec![InterfaceName::from("Z")]);
    }

    #[test]
    fn test_difference_identical_is_empty() {
        let desc = ObjectDescription::new()
            .with_object("/a", ["X"])
            .with_object("/b", ["X", "Y"]);
        assert!(desc.difference(&desc.clone()).is_empty());
    }

    #[test]
    fn test_objects_implementing() {
        let desc = ObjectDescription::new()
            .with_object("/a", ["X"])
            .with_object("/b", ["Y"])
            .with_object("/c", ["X", "Y"]);
        let x = InterfaceName::from("X");
        let paths: Vec<_> = desc.objects_implementing(&x).map(|p| p.as_str()).collect();
        assert_eq!(paths, vec!["/a", "/c"]);
        assert!(desc.implements(&ObjectPath::from("/c"), &x));
        assert!(!desc.implements(&ObjectPath::from("/b"), &x));
    }

    #[test]
    fn test_announcement_json_shape() {
        let ann = Announcement {
            peer: PeerId::from("ddbus.Aprov"),
            port: 5001,
            description: ObjectDescription::new().with_object("/o1", ["X"]),
            metadata: BTreeMap::new(),
        };
        let json = serde_json::to_value(&ann).unwrap();
        assert_eq!(json["description"]["/o1"][0], "X");
        let back: Announcement = serde_json::from_value(json).unwrap();
        assert_eq!(back, ann);
    }
}
