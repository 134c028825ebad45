//! Serde helpers for values that distinguish "absent" from `null`.
//!
//! A remote property can be undefined, which is not the same as holding
//! `null`. Fields of type `Option<Value>` annotated with
//! `#[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "deserialize_some")]`
//! encode undefined by omitting the field, and decode an explicit `null` as
//! `Some(Value::Null)` instead of collapsing it to `None`.

use serde::{Deserialize, Deserializer};

/// Deserialize a present field as `Some`, even when it holds `null`.
pub fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}
