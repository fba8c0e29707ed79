//! Values on either side of the boundary.
//!
//! [`HostValue`] is what host code passes and receives; [`ScriptValue`] is
//! what the engine sees. The [`marshal`](crate::marshal) module converts
//! between them under a declared type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A value as represented inside the script engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum ScriptValue {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// Number with the engine's small-integer tag
    Int(i32),
    /// Number
    Float(f64),
    /// String
    String(String),
    /// Byte array
    Bytes(Vec<u8>),
    /// Array
    Array(Vec<ScriptValue>),
    /// Any other script value (object, function, date, ...), described by its tag
    Opaque(String),
}

impl ScriptValue {
    /// Whether this is `null` or `undefined`
    pub fn is_nullish(&self) -> bool {
        matches!(self, ScriptValue::Null | ScriptValue::Undefined)
    }

    /// Get as f64 if numeric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScriptValue::Int(i) => Some(*i as f64),
            ScriptValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get as string if string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Undefined => f.write_str("undefined"),
            ScriptValue::Null => f.write_str("null"),
            ScriptValue::Bool(b) => write!(f, "{}", b),
            ScriptValue::Int(i) => write!(f, "{}", i),
            ScriptValue::Float(v) => write!(f, "{}", v),
            ScriptValue::String(s) => f.write_str(s),
            ScriptValue::Bytes(b) => write!(f, "[{} bytes]", b.len()),
            ScriptValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            ScriptValue::Opaque(tag) => f.write_str(tag),
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Bool(b)
    }
}

impl From<i32> for ScriptValue {
    fn from(i: i32) -> Self {
        ScriptValue::Int(i)
    }
}

impl From<f64> for ScriptValue {
    fn from(f: f64) -> Self {
        ScriptValue::Float(f)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(s.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::String(s)
    }
}

/// A value as represented on the host side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum HostValue {
    /// Null
    Null,
    /// Boolean
    Bool(bool),
    /// 32-bit signed integer
    Int(i32),
    /// 64-bit float
    Double(f64),
    /// String
    String(String),
    /// Byte array
    Bytes(Vec<u8>),
    /// Array
    Array(Vec<HostValue>),
    /// A host object outside the supported set, described by its type name
    Object(String),
}

impl HostValue {
    /// Check if null
    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    /// Get as bool if boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as i32 if integer
    pub fn as_int(&self) -> Option<i32> {
        match self {
            HostValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as f64 if numeric
    pub fn as_double(&self) -> Option<f64> {
        match self {
            HostValue::Double(d) => Some(*d),
            HostValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Get as string if string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as slice if array
    pub fn as_array(&self) -> Option<&[HostValue]> {
        match self {
            HostValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Type name used in error messages
    pub fn type_name(&self) -> &str {
        match self {
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Int(_) => "int",
            HostValue::Double(_) => "double",
            HostValue::String(_) => "String",
            HostValue::Bytes(_) => "bytes",
            HostValue::Array(_) => "array",
            HostValue::Object(type_name) => type_name,
        }
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Null => f.write_str("null"),
            HostValue::Bool(b) => write!(f, "{}", b),
            HostValue::Int(i) => write!(f, "{}", i),
            HostValue::Double(d) => write!(f, "{}", d),
            HostValue::String(s) => f.write_str(s),
            HostValue::Bytes(b) => write!(f, "[{} bytes]", b.len()),
            HostValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            HostValue::Object(type_name) => write!(f, "{} object", type_name),
        }
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<i32> for HostValue {
    fn from(i: i32) -> Self {
        HostValue::Int(i)
    }
}

impl From<f64> for HostValue {
    fn from(d: f64) -> Self {
        HostValue::Double(d)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(items: Vec<HostValue>) -> Self {
        HostValue::Array(items)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(HostValue::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_value_accessors() {
        assert_eq!(HostValue::from(3).as_int(), Some(3));
        assert_eq!(HostValue::from(3).as_double(), Some(3.0));
        assert_eq!(HostValue::from("x").as_str(), Some("x"));
        assert!(HostValue::from(None::<i32>).is_null());
        assert_eq!(HostValue::from(Some(true)).as_bool(), Some(true));
    }

    #[test]
    fn test_script_value_display() {
        let v = ScriptValue::Array(vec![1.into(), 2.5.into(), "a".into()]);
        assert_eq!(v.to_string(), "[1, 2.5, a]");
        assert_eq!(ScriptValue::Undefined.to_string(), "undefined");
    }

    #[test]
    fn test_host_value_serialization() {
        let json = serde_json::to_string(&HostValue::Int(7)).unwrap();
        assert_eq!(json, r#"{"type":"int","value":7}"#);
    }
}
