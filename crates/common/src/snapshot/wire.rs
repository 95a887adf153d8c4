//! Lenient serde helpers for snapshot documents
//!
//! Snapshot files come from PHP's `json_encode`, which writes empty
//! associative arrays as `[]`, ids as either numbers or strings, and
//! `0` for "no parent".

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

use super::EntityId;

/// Decode a JSON object (or PHP's `[]` / `null` for an empty map)
pub(crate) fn map_from_value<V>(
    value: Value,
    item: impl Fn(Value) -> Result<V, String>,
) -> Result<BTreeMap<String, V>, String> {
    match value {
        Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| match item(value) {
                Ok(v) => Ok((key, v)),
                Err(e) => Err(format!("{}: {}", key, e)),
            })
            .collect(),
        Value::Array(items) if items.is_empty() => Ok(BTreeMap::new()),
        Value::Null => Ok(BTreeMap::new()),
        other => Err(format!("expected an object, found {}", kind(&other))),
    }
}

/// Decode a list of scalars; a bare scalar becomes a one-element list
pub(crate) fn scalar_list(value: Value) -> Result<Vec<String>, String> {
    match value {
        Value::Array(items) => items.into_iter().map(scalar_string).collect(),
        Value::Null => Ok(Vec::new()),
        other => scalar_string(other).map(|s| vec![s]),
    }
}

/// Render a scalar the way PHP stores it in a string column
pub(crate) fn scalar_string(value: Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(true) => Ok("1".to_string()),
        Value::Bool(false) => Ok(String::new()),
        Value::Null => Ok(String::new()),
        nested => serde_json::to_string(&nested).map_err(|e| e.to_string()),
    }
}

fn id_from_value(value: Value) -> Result<Option<EntityId>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Ok(None),
            Some(id) => Ok(Some(EntityId(id))),
            None => Err(format!("invalid id {}", n)),
        },
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => match s.trim().parse::<u64>() {
            Ok(0) => Ok(None),
            Ok(id) => Ok(Some(EntityId(id))),
            Err(_) => Err(format!("invalid id '{}'", s)),
        },
        other => Err(format!("expected an id, found {}", kind(&other))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// `ID` fields: number or numeric string, `0`/empty meaning absent
pub(crate) mod optional_id {
    use super::*;

    pub fn serialize<S: Serializer>(id: &Option<EntityId>, serializer: S) -> Result<S::Ok, S::Error> {
        match id {
            Some(id) => serializer.serialize_u64(id.0),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<EntityId>, D::Error> {
        id_from_value(Value::deserialize(deserializer)?).map_err(D::Error::custom)
    }
}

/// `post_parent`: written as `0` when there is no parent
pub(crate) mod parent_id {
    use super::*;

    pub fn serialize<S: Serializer>(id: &Option<EntityId>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(id.map(|id| id.0).unwrap_or(0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<EntityId>, D::Error> {
        id_from_value(Value::deserialize(deserializer)?).map_err(D::Error::custom)
    }
}

/// Text that may arrive as a number and where `""` means unset (SKU, price)
pub(crate) mod optional_text {
    use super::*;

    pub fn serialize<S: Serializer>(text: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
        match text {
            Some(text) => serializer.serialize_str(text),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        let text = scalar_string(Value::deserialize(deserializer)?).map_err(D::Error::custom)?;
        Ok(if text.is_empty() { None } else { Some(text) })
    }
}

/// Free text that PHP may have emitted as a number
pub(crate) mod text {
    use super::*;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        scalar_string(Value::deserialize(deserializer)?).map_err(D::Error::custom)
    }
}
