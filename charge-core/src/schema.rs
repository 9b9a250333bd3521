//! Validation schemas for records crossing the client/storage boundary.
//!
//! Every entity stored in a room collection implements [`Schema`]. A schema
//! has two shapes:
//!
//! ```text
//!   Input (draft, all optional) ──from_input──► Item (canonical, defaults applied)
//!   untrusted JSON value ─────────parse──────► Item | SchemaError
//! ```
//!
//! Values read back from shared storage are never trusted: `parse` either
//! yields a complete canonical item or an error, never a partial object.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A set of top-level fields to overwrite on an existing item.
pub type Patch = Map<String, Value>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("invalid {kind}: {reason}")]
    Invalid { kind: &'static str, reason: String },
    #[error("{kind} field '{field}' out of range: {reason}")]
    OutOfRange {
        kind: &'static str,
        field: String,
        reason: String,
    },
    #[error("{kind} has no field '{field}'")]
    UnknownField { kind: &'static str, field: String },
    #[error("{kind} does not serialize to an object")]
    NotAnObject { kind: &'static str },
}

/// Canonical record shape for one collection's items.
pub trait Schema: Sized + Clone + Serialize + DeserializeOwned {
    /// Draft shape accepted by `create`/`append`.
    type Input: Default;

    /// Human-readable kind, used in diagnostics.
    const KIND: &'static str;

    /// Build the canonical item from a draft, applying declared defaults.
    fn from_input(input: Self::Input) -> Self;

    /// Coercion and range checks applied after every decode.
    fn normalize(self) -> Result<Self, SchemaError> {
        Ok(self)
    }

    /// Decode an untrusted value into a canonical item.
    fn parse(value: &Value) -> Result<Self, SchemaError> {
        let item: Self = serde_json::from_value(value.clone()).map_err(|e| {
            SchemaError::Invalid {
                kind: Self::KIND,
                reason: e.to_string(),
            }
        })?;
        item.normalize()
    }

    /// The canonical item as a JSON object of top-level fields.
    fn to_fields(&self) -> Result<Map<String, Value>, SchemaError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => Ok(fields),
            Ok(_) => Err(SchemaError::NotAnObject { kind: Self::KIND }),
            Err(e) => Err(SchemaError::Invalid {
                kind: Self::KIND,
                reason: e.to_string(),
            }),
        }
    }

    /// Overwrite exactly the keys in `patch` and re-validate.
    ///
    /// Returns the new item together with the normalized values of the
    /// patched keys (normalization may coerce, e.g. clamp, a value).
    fn patched(&self, patch: &Patch) -> Result<(Self, Patch), SchemaError> {
        let mut fields = self.to_fields()?;
        for (key, value) in patch {
            if !fields.contains_key(key) {
                return Err(SchemaError::UnknownField {
                    kind: Self::KIND,
                    field: key.clone(),
                });
            }
            fields.insert(key.clone(), value.clone());
        }
        let item = Self::parse(&Value::Object(fields))?;
        let normalized = item.to_fields()?;
        let written = patch
            .keys()
            .filter_map(|k| normalized.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        Ok((item, written))
    }
}

/// An item of a keyed collection together with its storage key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<T> {
    pub id: String,
    #[serde(flatten)]
    pub value: T,
}

impl<T> Entry<T> {
    pub fn new(id: impl Into<String>, value: T) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

/// Build a [`Patch`] from a `serde_json::json!({...})` object literal.
///
/// Non-object values produce an empty patch.
pub fn patch(value: Value) -> Patch {
    match value {
        Value::Object(map) => map,
        _ => Patch::new(),
    }
}
