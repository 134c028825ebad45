//! Contexts carried inside values.
//!
//! An argument or a result may stand for a context rather than plain data.
//! Two shapes exist on the wire:
//!
//! - `{"$definition": {...}}` hands out a context owned by the sender. The
//!   receiver reaches it through the sender using the definition's id.
//! - `{"$ref": 7}` points back at definition 7 of the receiver, for example
//!   an interface passed back to the runtime that issued it.
//!
//! Anything else is plain data.

use crate::definition::Definition;
use crate::error::NetronResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key marking a handed-out definition.
pub const DEFINITION_KEY: &str = "$definition";

/// Key marking a reference to one of the receiver's definitions.
pub const REFERENCE_KEY: &str = "$ref";

/// A context embedded in a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Embedded {
    /// A context owned by the sender.
    Definition(Definition),
    /// A definition id of the receiver.
    Reference(u64),
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefinitionEnvelope {
    #[serde(rename = "$definition")]
    definition: Definition,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReferenceEnvelope {
    #[serde(rename = "$ref")]
    def_id: u64,
}

impl Embedded {
    /// Recognize an embedded context. Plain data yields `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.len() != 1 {
            return None;
        }
        if object.contains_key(DEFINITION_KEY) {
            serde_json::from_value::<DefinitionEnvelope>(value.clone())
                .ok()
                .map(|e| Embedded::Definition(e.definition))
        } else if object.contains_key(REFERENCE_KEY) {
            serde_json::from_value::<ReferenceEnvelope>(value.clone())
                .ok()
                .map(|e| Embedded::Reference(e.def_id))
        } else {
            None
        }
    }

    pub fn into_value(self) -> Value {
        let mut object = Map::new();
        match self {
            Embedded::Definition(definition) => {
                let encoded = serde_json::to_value(DefinitionEnvelope { definition });
                if let Ok(Value::Object(envelope)) = encoded {
                    object = envelope;
                }
            }
            Embedded::Reference(def_id) => {
                object.insert(REFERENCE_KEY.to_string(), Value::from(def_id));
            }
        }
        Value::Object(object)
    }
}

/// Rewrite every embedded context inside `value` with `f`.
///
/// Arrays and objects are walked recursively; plain data is kept as is.
pub fn rewrite_embedded<F>(value: Value, f: &mut F) -> NetronResult<Value>
where
    F: FnMut(Embedded) -> NetronResult<Value>,
{
    if let Some(embedded) = Embedded::from_value(&value) {
        return f(embedded);
    }
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| rewrite_embedded(item, f))
            .collect::<NetronResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut rewritten = Map::with_capacity(map.len());
            for (key, item) in map {
                rewritten.insert(key, rewrite_embedded(item, f)?);
            }
            Ok(Value::Object(rewritten))
        }
        other => Ok(other),
    }
}

/// Whether `value` carries an embedded context anywhere.
pub fn has_embedded(value: &Value) -> bool {
    if Embedded::from_value(value).is_some() {
        return true;
    }
    match value {
        Value::Array(items) => items.iter().any(has_embedded),
        Value::Object(map) => map.values().any(has_embedded),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetronError;
    use serde_json::json;

    fn definition() -> Definition {
        Definition {
            id: 12,
            name: "Child".to_string(),
            methods: vec!["ping".to_string()],
            properties: vec![],
        }
    }

    #[test]
    fn test_definition_shape() {
        let value = Embedded::Definition(definition()).into_value();
        assert_eq!(value["$definition"]["id"], 12);
        assert_eq!(
            Embedded::from_value(&value),
            Some(Embedded::Definition(definition()))
        );
    }

    #[test]
    fn test_reference_shape() {
        let value = Embedded::Reference(4).into_value();
        assert_eq!(value, json!({"$ref": 4}));
        assert_eq!(Embedded::from_value(&value), Some(Embedded::Reference(4)));
    }

    #[test]
    fn test_plain_data_is_not_embedded() {
        assert!(Embedded::from_value(&json!({"$ref": 4, "other": 1})).is_none());
        assert!(Embedded::from_value(&json!({"$ref": "x"})).is_none());
        assert!(Embedded::from_value(&json!([1, 2])).is_none());
        assert!(!has_embedded(&json!({"a": [1, {"b": null}]})));
    }

    #[test]
    fn test_rewrite_nested() {
        let value = json!({
            "first": {"$ref": 1},
            "list": [{"$ref": 2}, 3],
        });
        assert!(has_embedded(&value));
        let rewritten = rewrite_embedded(value, &mut |embedded| match embedded {
            Embedded::Reference(id) => Ok(Embedded::Reference(id * 10).into_value()),
            Embedded::Definition(_) => Err(NetronError::Unknown("unexpected".into())),
        })
        .unwrap();
        assert_eq!(
            rewritten,
            json!({"first": {"$ref": 10}, "list": [{"$ref": 20}, 3]})
        );
    }

    #[test]
    fn test_rewrite_error_propagates() {
        let err = rewrite_embedded(json!([{"$ref": 1}]), &mut |_| {
            Err(NetronError::Unknown("gone".into()))
        })
        .unwrap_err();
        assert!(matches!(err, NetronError::Unknown(_)));
    }
}
