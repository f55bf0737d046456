use std::fmt::Display;

use serde::{
    Deserialize,
    Serialize,
};

/// Hash map used for WAMP dictionaries and the session's lookup tables.
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// Positional arguments of a WAMP message.
pub type List = Vec<Value>;

/// Keyword arguments and option/detail dictionaries of a WAMP message.
pub type Dictionary = HashMap<String, Value>;

/// Any value that can be carried in a WAMP payload.
///
/// Variant order matters for deserialization: integers are tried before floats so that whole
/// numbers keep their integer type. Integers above [`i64::MAX`] land in
/// [`Value::UnsignedInteger`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    UnsignedInteger(u64),
    Float(f64),
    String(String),
    List(List),
    Dictionary(Dictionary),
}

impl Value {
    /// The value as an integer.
    pub fn integer(&self) -> Option<i64> {
        match self {
            Self::Integer(val) => Some(*val),
            Self::UnsignedInteger(val) => i64::try_from(*val).ok(),
            _ => None,
        }
    }

    /// The value as an unsigned integer.
    pub fn unsigned_integer(&self) -> Option<u64> {
        match self {
            Self::UnsignedInteger(val) => Some(*val),
            Self::Integer(val) => u64::try_from(*val).ok(),
            _ => None,
        }
    }

    /// The value as a float, converting integers.
    pub fn float(&self) -> Option<f64> {
        match self {
            Self::Float(val) => Some(*val),
            Self::Integer(val) => Some(*val as f64),
            Self::UnsignedInteger(val) => Some(*val as f64),
            _ => None,
        }
    }

    /// The value as a string.
    pub fn string(&self) -> Option<&str> {
        match self {
            Self::String(val) => Some(val),
            _ => None,
        }
    }

    /// The value as a bool.
    pub fn bool(&self) -> Option<bool> {
        match self {
            Self::Bool(val) => Some(*val),
            _ => None,
        }
    }

    /// The value as a [`List`].
    pub fn list(&self) -> Option<&List> {
        match self {
            Self::List(val) => Some(val),
            _ => None,
        }
    }

    /// The value as a [`Dictionary`].
    pub fn dictionary(&self) -> Option<&Dictionary> {
        match self {
            Self::Dictionary(val) => Some(val),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(value) => Self::Integer(value),
            Err(_) => Self::UnsignedInteger(value),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<List> for Value {
    fn from(value: List) -> Self {
        Self::List(value)
    }
}

impl From<Dictionary> for Value {
    fn from(value: Dictionary) -> Self {
        Self::Dictionary(value)
    }
}
