//! Property state held by remote object handles.
//!
//! Providers push property snapshots as JSON objects. A handle's
//! [`ProxyState`] merges each snapshot into its local view; a snapshot it
//! cannot interpret is an [`UnmarshalError`], which the object cache treats
//! as a failed object.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use thiserror::Error;

/// A property snapshot could not be applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnmarshalError {
    /// The snapshot was not a JSON object.
    #[error("Property snapshot is not an object (got {0})")]
    NotAnObject(&'static str),
    /// The merged properties do not decode into the typed state.
    #[error("Failed to decode properties: {0}")]
    Decode(String),
}

/// Local view of one remote object's properties.
pub trait ProxyState: Send + Sync + fmt::Debug {
    /// Merge a property snapshot. On error the state is left unchanged.
    fn apply(&mut self, properties: &Value) -> Result<(), UnmarshalError>;

    /// Current properties as a JSON object.
    fn snapshot(&self) -> Value;

    /// Downcasting hook for typed access.
    fn as_any(&self) -> &dyn Any;
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_object(value: &Value) -> Result<&Map<String, Value>, UnmarshalError> {
    value
        .as_object()
        .ok_or_else(|| UnmarshalError::NotAnObject(value_kind(value)))
}

/// Untyped property bag. Accepts any JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyMap {
    values: Map<String, Value>,
}

impl PropertyMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a single property.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Number of known properties.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no property has been received yet.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ProxyState for PropertyMap {
    fn apply(&mut self, properties: &Value) -> Result<(), UnmarshalError> {
        let incoming = as_object(properties)?;
        for (name, value) in incoming {
            self.values.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    fn snapshot(&self) -> Value {
        Value::Object(self.values.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Strongly typed property state. Snapshots are merged over the current
/// value and re-decoded into `T`, so partial updates work as long as `T`
/// serializes to an object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Typed<T> {
    value: T,
}

impl<T> Typed<T> {
    /// Wrap an initial value.
    pub fn new(value: T) -> Self {
        Self { value }
    }

    /// Borrow the decoded value.
    pub fn get(&self) -> &T {
        &self.value
    }
}

impl<T> ProxyState for Typed<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static,
{
    fn apply(&mut self, properties: &Value) -> Result<(), UnmarshalError> {
        let incoming = as_object(properties)?;
        let mut merged = match serde_json::to_value(&self.value) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(e) => return Err(UnmarshalError::Decode(e.to_string())),
        };
        for (name, value) in incoming {
            merged.insert(name.clone(), value.clone());
        }
        let decoded: T = serde_json::from_value(Value::Object(merged))
            .map_err(|e| UnmarshalError::Decode(e.to_string()))?;
        self.value = decoded;
        Ok(())
    }

    fn snapshot(&self) -> Value {
        serde_json::to_value(&self.value).unwrap_or(Value::Null)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Door {
        open: bool,
        location: String,
    }

    #[test]
    fn test_property_map_merges() {
        let mut map = PropertyMap::new();
        map.apply(&json!({"open": false, "location": "hall"})).unwrap();
        map.apply(&json!({"open": true})).unwrap();
        assert_eq!(map.get("open"), Some(&json!(true)));
        assert_eq!(map.get("location"), Some(&json!("hall")));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_property_map_rejects_non_object() {
        let mut map = PropertyMap::new();
        let err = map.apply(&json!([1, 2])).unwrap_err();
        assert_eq!(err, UnmarshalError::NotAnObject("array"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_typed_partial_update() {
        let mut door = Typed::new(Door::default());
        door.apply(&json!({"open": true, "location": "front"})).unwrap();
        door.apply(&json!({"open": false})).unwrap();
        assert_eq!(
            door.get(),
            &Door {
                open: false,
                location: "front".to_string()
            }
        );
    }

    #[test]
    fn test_typed_bad_field_leaves_state_unchanged() {
        let mut door = Typed::new(Door {
            open: true,
            location: "back".to_string(),
        });
        let err = door.apply(&json!({"open": "maybe"})).unwrap_err();
        assert!(matches!(err, UnmarshalError::Decode(_)));
        assert!(door.get().open);
    }

    #[test]
    fn test_downcast_through_trait_object() {
        let state: Box<dyn ProxyState> = Box::new(Typed::new(Door::default()));
        let typed = state.as_any().downcast_ref::<Typed<Door>>();
        assert!(typed.is_some());
    }
}
