//! Self-describing encoding of arbitrary per-step values.
//!
//! Snapshots must survive restarts and minor code changes, so flow data is
//! never persisted as raw Rust values. Everything goes through [`encode`],
//! which produces a tagged [`SafeValue`] tree with bounded depth and
//! collection length, and comes back through [`decode`], which restores any
//! `DeserializeOwned` target. Encoding never fails: shapes the encoder
//! cannot represent are replaced by a safe summary string.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Maximum nesting depth before the cycle sentinel is substituted.
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Maximum sequence/mapping length before truncation.
pub const DEFAULT_MAX_LEN: usize = 50;

/// Sentinel substituted where nesting exceeds the depth bound. The serde
/// data model is tree-shaped, so identity cycles surface as unbounded
/// depth rather than as repeated references.
pub const CYCLE_SENTINEL: &str = "[cycle]";

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("cannot decode value as {target}: {detail}")]
    Decode {
        target: &'static str,
        detail: String,
    },
}

/// Encoding limits. The defaults keep snapshots finite even for
/// pathological inputs.
#[derive(Debug, Clone, Copy)]
pub struct EncodeLimits {
    pub max_depth: usize,
    pub max_len: usize,
}

impl Default for EncodeLimits {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_len: DEFAULT_MAX_LEN,
        }
    }
}

/// A restorable, language-neutral wrapper around a runtime value.
///
/// Dictionaries always decode as mappings, never as record objects;
/// records carry an optional type hint and are restored by field-name
/// lookup against the target type's schema at decode time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum SafeValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Arbitrary-precision decimal carried as its string form.
    Decimal(String),
    Str(String),
    Timestamp(DateTime<Utc>),
    Duration { secs: u64, nanos: u32 },
    Uuid(Uuid),
    Seq(Vec<SafeValue>),
    Map(BTreeMap<String, SafeValue>),
    Record {
        #[serde(skip_serializing_if = "Option::is_none")]
        type_hint: Option<String>,
        fields: BTreeMap<String, SafeValue>,
    },
    /// Safe summary of a shape the encoder could not represent.
    Opaque(String),
}

impl SafeValue {
    pub fn record(type_hint: impl Into<String>, fields: BTreeMap<String, SafeValue>) -> Self {
        SafeValue::Record {
            type_hint: Some(type_hint.into()),
            fields,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SafeValue::Null)
    }

    /// Short human-readable form for summaries and error records.
    pub fn summary(&self) -> String {
        match self {
            SafeValue::Null => "null".to_string(),
            SafeValue::Bool(b) => b.to_string(),
            SafeValue::Int(n) => n.to_string(),
            SafeValue::UInt(n) => n.to_string(),
            SafeValue::Float(f) => f.to_string(),
            SafeValue::Decimal(s) | SafeValue::Str(s) | SafeValue::Opaque(s) => s.clone(),
            SafeValue::Timestamp(t) => t.to_rfc3339(),
            SafeValue::Duration { secs, nanos } => format!("{}.{:09}s", secs, nanos),
            SafeValue::Uuid(u) => u.to_string(),
            SafeValue::Seq(items) => format!("[{} items]", items.len()),
            SafeValue::Map(m) => format!("{{{} entries}}", m.len()),
            SafeValue::Record { type_hint, fields } => match type_hint {
                Some(hint) => format!("{}{{{} fields}}", hint, fields.len()),
                None => format!("{{{} fields}}", fields.len()),
            },
        }
    }

    /// Convert back to the serde data model for decoding.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SafeValue::Null => serde_json::Value::Null,
            SafeValue::Bool(b) => serde_json::Value::Bool(*b),
            SafeValue::Int(n) => serde_json::json!(n),
            SafeValue::UInt(n) => serde_json::json!(n),
            SafeValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            SafeValue::Decimal(s) => serde_json::Value::String(s.clone()),
            SafeValue::Str(s) => serde_json::Value::String(s.clone()),
            SafeValue::Timestamp(t) => {
                serde_json::to_value(t).unwrap_or(serde_json::Value::Null)
            }
            SafeValue::Duration { secs, nanos } => {
                serde_json::json!({ "secs": secs, "nanos": nanos })
            }
            SafeValue::Uuid(u) => serde_json::Value::String(u.to_string()),
            SafeValue::Seq(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
            SafeValue::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            SafeValue::Record { fields, .. } => serde_json::Value::Object(
                fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            SafeValue::Opaque(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl From<bool> for SafeValue {
    fn from(v: bool) -> Self {
        SafeValue::Bool(v)
    }
}

impl From<i64> for SafeValue {
    fn from(v: i64) -> Self {
        SafeValue::Int(v)
    }
}

impl From<u64> for SafeValue {
    fn from(v: u64) -> Self {
        SafeValue::UInt(v)
    }
}

impl From<f64> for SafeValue {
    fn from(v: f64) -> Self {
        SafeValue::Float(v)
    }
}

impl From<&str> for SafeValue {
    fn from(v: &str) -> Self {
        SafeValue::Str(v.to_string())
    }
}

impl From<String> for SafeValue {
    fn from(v: String) -> Self {
        SafeValue::Str(v)
    }
}

impl From<DateTime<Utc>> for SafeValue {
    fn from(v: DateTime<Utc>) -> Self {
        SafeValue::Timestamp(v)
    }
}

impl From<std::time::Duration> for SafeValue {
    fn from(v: std::time::Duration) -> Self {
        SafeValue::Duration {
            secs: v.as_secs(),
            nanos: v.subsec_nanos(),
        }
    }
}

impl From<Uuid> for SafeValue {
    fn from(v: Uuid) -> Self {
        SafeValue::Uuid(v)
    }
}

/// Encode any serializable value. Never fails: unsupported shapes are
/// replaced by an [`SafeValue::Opaque`] summary.
pub fn encode<T: Serialize>(value: &T) -> SafeValue {
    encode_with(value, EncodeLimits::default())
}

/// [`encode`] tagging record-shaped values with the source type name, so
/// snapshots stay legible after schema drift. Scalars and sequences pass
/// through unchanged.
pub fn encode_as<T: Serialize>(value: &T) -> SafeValue {
    match encode(value) {
        SafeValue::Map(fields) => SafeValue::Record {
            type_hint: Some(std::any::type_name::<T>().to_string()),
            fields,
        },
        other => other,
    }
}

pub fn encode_with<T: Serialize>(value: &T, limits: EncodeLimits) -> SafeValue {
    match serde_json::to_value(value) {
        Ok(json) => from_json_bounded(&json, 0, &limits),
        Err(e) => SafeValue::Opaque(format!("[unencodable:{}]", e)),
    }
}

/// Decode a safe value into any deserializable target. Fails only when the
/// target type is structurally incompatible with the stored shape.
pub fn decode<T: DeserializeOwned>(value: &SafeValue) -> Result<T, ValueError> {
    serde_json::from_value(value.to_json()).map_err(|e| ValueError::Decode {
        target: std::any::type_name::<T>(),
        detail: e.to_string(),
    })
}

fn from_json_bounded(
    json: &serde_json::Value,
    depth: usize,
    limits: &EncodeLimits,
) -> SafeValue {
    if depth >= limits.max_depth {
        return SafeValue::Opaque(CYCLE_SENTINEL.to_string());
    }

    match json {
        serde_json::Value::Null => SafeValue::Null,
        serde_json::Value::Bool(b) => SafeValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SafeValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                SafeValue::UInt(u)
            } else if let Some(f) = n.as_f64() {
                SafeValue::Float(f)
            } else {
                SafeValue::Opaque("[unencodable:number]".to_string())
            }
        }
        serde_json::Value::String(s) => SafeValue::Str(s.clone()),
        serde_json::Value::Array(items) => {
            let mut out: Vec<SafeValue> = items
                .iter()
                .take(limits.max_len)
                .map(|v| from_json_bounded(v, depth + 1, limits))
                .collect();
            if items.len() > limits.max_len {
                out.push(SafeValue::Opaque(format!(
                    "[overflow:{}]",
                    items.len() - limits.max_len
                )));
            }
            SafeValue::Seq(out)
        }
        serde_json::Value::Object(map) => {
            let mut fields = BTreeMap::new();
            for (k, v) in map.iter().take(limits.max_len) {
                fields.insert(k.clone(), from_json_bounded(v, depth + 1, limits));
            }
            if map.len() > limits.max_len {
                fields.insert(
                    "[overflow]".to_string(),
                    SafeValue::UInt((map.len() - limits.max_len) as u64),
                );
            }
            SafeValue::Map(fields)
        }
    }
}
