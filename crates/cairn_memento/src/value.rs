//! Field values carried by mementos.
//!
//! A value is a primitive, a list, a nested record, or a typed reference to
//! another memento. References serialize as `{"$ref": "<id>"}`.

use crate::encoding::EncodingError;
use cairn_core::ObjectId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Key marking a reference object in the serialized form
pub const REF_KEY: &str = "$ref";

/// A memento field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Value", try_from = "Value")]
pub enum FieldValue {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Integer above `i64::MAX`
    UInt(u64),
    /// Floating point; non-finite values serialize as null
    Float(f64),
    /// String
    Text(String),
    /// Reference to another memento by id
    Ref(ObjectId),
    /// Ordered list
    List(Vec<FieldValue>),
    /// Nested record
    Record(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Build a list of references
    #[must_use]
    pub fn refs<'a>(ids: impl IntoIterator<Item = &'a ObjectId>) -> Self {
        Self::List(ids.into_iter().cloned().map(Self::Ref).collect())
    }

    /// Get as string slice
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get as integer
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as unsigned integer
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(i) => u64::try_from(*i).ok(),
            Self::UInt(u) => Some(*u),
            _ => None,
        }
    }

    /// Get as boolean
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get the referenced id, if this is a reference
    #[must_use]
    pub fn as_ref_id(&self) -> Option<&ObjectId> {
        match self {
            Self::Ref(id) => Some(id),
            _ => None,
        }
    }

    /// Get as list
    #[must_use]
    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Get as nested record
    #[must_use]
    pub fn as_record(&self) -> Option<&BTreeMap<String, FieldValue>> {
        match self {
            Self::Record(map) => Some(map),
            _ => None,
        }
    }

    /// Check if null
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Every id referenced anywhere inside this value
    #[must_use]
    pub fn references(&self) -> BTreeSet<ObjectId> {
        let mut out = BTreeSet::new();
        self.collect_references(&mut out);
        out
    }

    pub(crate) fn collect_references(&self, out: &mut BTreeSet<ObjectId>) {
        match self {
            Self::Ref(id) => {
                out.insert(id.clone());
            }
            Self::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Self::Record(map) => map.values().for_each(|v| v.collect_references(out)),
            _ => {}
        }
    }
}

impl From<FieldValue> for Value {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(b),
            FieldValue::Int(i) => Value::Number(i.into()),
            FieldValue::UInt(u) => Value::Number(u.into()),
            FieldValue::Float(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
            FieldValue::Text(s) => Value::String(s),
            FieldValue::Ref(id) => {
                let mut map = Map::new();
                map.insert(REF_KEY.to_string(), Value::String(id.into()));
                Value::Object(map)
            }
            FieldValue::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            FieldValue::Record(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl TryFrom<Value> for FieldValue {
    type Error = EncodingError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Ok(match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => Self::Int(i),
                (None, Some(u)) => Self::UInt(u),
                (None, None) => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Text(s),
            Value::Array(items) => Self::List(
                items
                    .into_iter()
                    .map(Self::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(target) = map.get(REF_KEY) {
                        let raw = target.as_str().ok_or_else(|| EncodingError::InvalidReference {
                            reason: format!("{} must be a string, found {}", REF_KEY, target),
                        })?;
                        let id = ObjectId::parse(raw).map_err(|e| EncodingError::InvalidReference {
                            reason: e.to_string(),
                        })?;
                        return Ok(Self::Ref(id));
                    }
                }
                Self::Record(
                    map.into_iter()
                        .map(|(k, v)| Self::try_from(v).map(|v| (k, v)))
                        .collect::<Result<_, _>>()?,
                )
            }
        })
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for FieldValue {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u32> for FieldValue {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<ObjectId> for FieldValue {
    fn from(id: ObjectId) -> Self {
        Self::Ref(id)
    }
}
