//! Decoded PackStream values.

use std::collections::HashMap;
use std::fmt;

use crate::error::ProxyError;

/// A string-keyed PackStream map. Wire order is not preserved on decode;
/// consumers read fields by name.
pub type Map = HashMap<String, Value>;

/// A dynamically typed PackStream value.
///
/// Floats exist on the wire but are never decoded by this proxy, so they
/// have no variant here.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    String(String),
    List(Vec<Value>),
    Map(Map),
}

impl Value {
    /// Returns the value as a string reference, if it is a `String` variant.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as an i64, if it is an `Integer` variant.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::String(s) => write!(f, "\"{s}\""),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Extracts a required string field from a decoded map.
///
/// A missing or differently-typed field is an error, never a panic.
pub fn require_str<'a>(map: &'a Map, key: &str) -> Result<&'a str, ProxyError> {
    match map.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(ProxyError::Malformed(format!(
            "field `{key}` is not a string: {other}"
        ))),
        None => Err(ProxyError::Malformed(format!("map has no field `{key}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_str_variants() {
        let map = Map::from([
            ("name".to_string(), Value::from("alice")),
            ("age".to_string(), Value::Integer(30)),
        ]);
        assert_eq!(require_str(&map, "name").unwrap(), "alice");
        assert!(require_str(&map, "age").is_err());
        assert!(require_str(&map, "missing").is_err());
    }
}
