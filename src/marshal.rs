//! Typed value conversion between host and script representations.
//!
//! Every conversion happens under a [`DeclaredType`] taken from a capability
//! set. The engine's number type is a double, so the integer rules are:
//!
//! - host `int` to script is exact;
//! - script number to host `int` must be integral and in `i32` range;
//! - script `int` to host `double` is promoted.
//!
//! Nullable types carry `null` both ways; every other type rejects it. Array
//! conversion is all-or-nothing and names the first element that failed.

use crate::error::BridgeError;
use crate::value::{HostValue, ScriptValue};
use std::fmt;

/// A parameter or return type declared on a capability-set method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeclaredType {
    /// No value (return position only)
    Void,
    /// `boolean`
    Boolean,
    /// 32-bit signed integer
    Integer,
    /// 64-bit float
    Double,
    /// UTF-8 string
    String,
    /// Byte array
    Bytes,
    /// Boxed variant that also accepts `null`
    Nullable(Box<DeclaredType>),
    /// Homogeneous array of the element type
    Array(Box<DeclaredType>),
    /// Dynamically typed value, checked at call time
    Any,
    /// A named host type outside the supported set (e.g. `Date`)
    Named(String),
}

impl DeclaredType {
    /// `T?`
    pub fn nullable(inner: DeclaredType) -> Self {
        DeclaredType::Nullable(Box::new(inner))
    }

    /// `T[]`
    pub fn array(element: DeclaredType) -> Self {
        DeclaredType::Array(Box::new(element))
    }

    /// A named type
    pub fn named(name: impl Into<String>) -> Self {
        DeclaredType::Named(name.into())
    }

    /// Number of nested array levels
    pub fn array_depth(&self) -> usize {
        match self {
            DeclaredType::Array(element) => 1 + element.array_depth(),
            DeclaredType::Nullable(inner) => inner.array_depth(),
            _ => 0,
        }
    }

    /// Find the first part of this type outside the supported set.
    ///
    /// Returns the offending type, or `None` when the whole type is supported.
    pub fn find_unsupported(&self, max_array_depth: usize) -> Option<DeclaredType> {
        if self.array_depth() > max_array_depth {
            return Some(self.clone());
        }
        match self {
            DeclaredType::Named(_) => Some(self.clone()),
            DeclaredType::Nullable(inner) => match inner.as_ref() {
                DeclaredType::Void | DeclaredType::Nullable(_) | DeclaredType::Any => {
                    Some(self.clone())
                }
                other => other.find_unsupported(max_array_depth),
            },
            DeclaredType::Array(element) => match element.as_ref() {
                DeclaredType::Void => Some(self.clone()),
                other => other.find_unsupported(max_array_depth),
            },
            _ => None,
        }
    }
}

impl fmt::Display for DeclaredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclaredType::Void => f.write_str("void"),
            DeclaredType::Boolean => f.write_str("boolean"),
            DeclaredType::Integer => f.write_str("int"),
            DeclaredType::Double => f.write_str("double"),
            DeclaredType::String => f.write_str("String"),
            DeclaredType::Bytes => f.write_str("bytes"),
            DeclaredType::Nullable(inner) => write!(f, "{}?", inner),
            DeclaredType::Array(element) => write!(f, "{}[]", element),
            DeclaredType::Any => f.write_str("Object"),
            DeclaredType::Named(name) => f.write_str(name),
        }
    }
}

/// A single value failed to convert
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionError {
    /// Rendering of the offending value
    pub value: String,
    /// Target type name
    pub target: String,
    /// Array indices leading to the offending element, outermost first
    pub path: Vec<usize>,
    /// Whether the failure is a type outside the supported set
    pub unsupported: bool,
}

impl ConversionError {
    fn mismatch(value: impl fmt::Display, target: &DeclaredType) -> Self {
        Self {
            value: value.to_string(),
            target: target.to_string(),
            path: Vec::new(),
            unsupported: false,
        }
    }

    fn unsupported(type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            value: type_name.clone(),
            target: type_name,
            path: Vec::new(),
            unsupported: true,
        }
    }

    fn at(mut self, index: usize) -> Self {
        self.path.insert(0, index);
        self
    }

    /// Turn into a bridge error naming where the value was being passed
    pub fn into_bridge(self, context: impl Into<String>) -> BridgeError {
        let context = context.into();
        if self.unsupported {
            BridgeError::unsupported(self.target, context)
        } else {
            BridgeError::Marshal {
                message: format!("{} in {}", self, context),
            }
        }
    }
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cannot convert value {} to {}", self.value, self.target)?;
        if !self.path.is_empty() {
            f.write_str(" at element ")?;
            for index in &self.path {
                write!(f, "[{}]", index)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ConversionError {}

/// Convert a host value into its script representation
pub fn to_script(value: &HostValue, ty: &DeclaredType) -> Result<ScriptValue, ConversionError> {
    match (ty, value) {
        (DeclaredType::Void, _) => Ok(ScriptValue::Undefined),
        (DeclaredType::Boolean, HostValue::Bool(b)) => Ok(ScriptValue::Bool(*b)),
        (DeclaredType::Integer, HostValue::Int(i)) => Ok(ScriptValue::Int(*i)),
        (DeclaredType::Double, HostValue::Double(d)) => Ok(ScriptValue::Float(*d)),
        (DeclaredType::Double, HostValue::Int(i)) => Ok(ScriptValue::Float(f64::from(*i))),
        (DeclaredType::String, HostValue::String(s)) => Ok(ScriptValue::String(s.clone())),
        (DeclaredType::Bytes, HostValue::Bytes(b)) => Ok(ScriptValue::Bytes(b.clone())),
        (DeclaredType::Nullable(_), HostValue::Null) => Ok(ScriptValue::Null),
        (DeclaredType::Nullable(inner), other) => to_script(other, inner),
        (DeclaredType::Array(element), HostValue::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| to_script(item, element).map_err(|e| e.at(i)))
            .collect::<Result<Vec<_>, _>>()
            .map(ScriptValue::Array),
        (DeclaredType::Any, other) => any_to_script(other),
        (DeclaredType::Named(name), _) => Err(ConversionError::unsupported(name.clone())),
        (_, other) => Err(ConversionError::mismatch(other, ty)),
    }
}

fn any_to_script(value: &HostValue) -> Result<ScriptValue, ConversionError> {
    match value {
        HostValue::Null => Ok(ScriptValue::Null),
        HostValue::Bool(b) => Ok(ScriptValue::Bool(*b)),
        HostValue::Int(i) => Ok(ScriptValue::Int(*i)),
        HostValue::Double(d) => Ok(ScriptValue::Float(*d)),
        HostValue::String(s) => Ok(ScriptValue::String(s.clone())),
        HostValue::Bytes(b) => Ok(ScriptValue::Bytes(b.clone())),
        HostValue::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| any_to_script(item).map_err(|e| e.at(i)))
            .collect::<Result<Vec<_>, _>>()
            .map(ScriptValue::Array),
        HostValue::Object(type_name) => Err(ConversionError::unsupported(type_name.clone())),
    }
}

/// Convert a script value into its host representation
pub fn to_host(value: &ScriptValue, ty: &DeclaredType) -> Result<HostValue, ConversionError> {
    match (ty, value) {
        (DeclaredType::Void, _) => Ok(HostValue::Null),
        (DeclaredType::Boolean, ScriptValue::Bool(b)) => Ok(HostValue::Bool(*b)),
        (DeclaredType::Integer, ScriptValue::Int(i)) => Ok(HostValue::Int(*i)),
        (DeclaredType::Integer, ScriptValue::Float(f)) => float_to_int(*f)
            .map(HostValue::Int)
            .ok_or_else(|| ConversionError::mismatch(value, ty)),
        (DeclaredType::Double, ScriptValue::Float(f)) => Ok(HostValue::Double(*f)),
        (DeclaredType::Double, ScriptValue::Int(i)) => Ok(HostValue::Double(f64::from(*i))),
        (DeclaredType::String, ScriptValue::String(s)) => Ok(HostValue::String(s.clone())),
        (DeclaredType::Bytes, ScriptValue::Bytes(b)) => Ok(HostValue::Bytes(b.clone())),
        (DeclaredType::Nullable(_), v) if v.is_nullish() => Ok(HostValue::Null),
        (DeclaredType::Nullable(inner), other) => to_host(other, inner),
        (DeclaredType::Array(element), ScriptValue::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| to_host(item, element).map_err(|e| e.at(i)))
            .collect::<Result<Vec<_>, _>>()
            .map(HostValue::Array),
        (DeclaredType::Any, other) => any_to_host(other),
        (DeclaredType::Named(name), _) => Err(ConversionError::unsupported(name.clone())),
        (_, other) => Err(ConversionError::mismatch(other, ty)),
    }
}

/// Convert a script value with no declared type (e.g. an `evaluate` result)
pub fn any_to_host(value: &ScriptValue) -> Result<HostValue, ConversionError> {
    match value {
        ScriptValue::Undefined | ScriptValue::Null => Ok(HostValue::Null),
        ScriptValue::Bool(b) => Ok(HostValue::Bool(*b)),
        ScriptValue::Int(i) => Ok(HostValue::Int(*i)),
        ScriptValue::Float(f) => Ok(HostValue::Double(*f)),
        ScriptValue::String(s) => Ok(HostValue::String(s.clone())),
        ScriptValue::Bytes(b) => Ok(HostValue::Bytes(b.clone())),
        ScriptValue::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| any_to_host(item).map_err(|e| e.at(i)))
            .collect::<Result<Vec<_>, _>>()
            .map(HostValue::Array),
        ScriptValue::Opaque(tag) => Err(ConversionError::unsupported(tag.clone())),
    }
}

fn float_to_int(f: f64) -> Option<i32> {
    if f.is_finite() && f.fract() == 0.0 && f >= f64::from(i32::MIN) && f <= f64::from(i32::MAX) {
        Some(f as i32)
    } else {
        None
    }
}

/// A Rust type with a fixed [`DeclaredType`]
pub trait HostType: Sized {
    /// The declared type for this Rust type
    fn declared_type() -> DeclaredType;

    /// Convert into a host value
    fn into_host(self) -> HostValue;

    /// Convert from a host value
    fn from_host(value: HostValue) -> Result<Self, ConversionError>;
}

impl HostType for () {
    fn declared_type() -> DeclaredType {
        DeclaredType::Void
    }

    fn into_host(self) -> HostValue {
        HostValue::Null
    }

    fn from_host(_value: HostValue) -> Result<Self, ConversionError> {
        Ok(())
    }
}

macro_rules! host_type {
    ($ty:ty, $declared:expr, $variant:ident) => {
        impl HostType for $ty {
            fn declared_type() -> DeclaredType {
                $declared
            }

            fn into_host(self) -> HostValue {
                HostValue::$variant(self)
            }

            fn from_host(value: HostValue) -> Result<Self, ConversionError> {
                match value {
                    HostValue::$variant(v) => Ok(v),
                    other => Err(ConversionError::mismatch(other, &$declared)),
                }
            }
        }
    };
}

host_type!(bool, DeclaredType::Boolean, Bool);
host_type!(i32, DeclaredType::Integer, Int);
host_type!(String, DeclaredType::String, String);

impl HostType for f64 {
    fn declared_type() -> DeclaredType {
        DeclaredType::Double
    }

    fn into_host(self) -> HostValue {
        HostValue::Double(self)
    }

    fn from_host(value: HostValue) -> Result<Self, ConversionError> {
        value
            .as_double()
            .ok_or_else(|| ConversionError::mismatch(value, &DeclaredType::Double))
    }
}

impl<T: HostType> HostType for Option<T> {
    fn declared_type() -> DeclaredType {
        DeclaredType::nullable(T::declared_type())
    }

    fn into_host(self) -> HostValue {
        self.map_or(HostValue::Null, HostType::into_host)
    }

    fn from_host(value: HostValue) -> Result<Self, ConversionError> {
        match value {
            HostValue::Null => Ok(None),
            other => T::from_host(other).map(Some),
        }
    }
}

impl<T: HostType> HostType for Vec<T> {
    fn declared_type() -> DeclaredType {
        DeclaredType::array(T::declared_type())
    }

    fn into_host(self) -> HostValue {
        HostValue::Array(self.into_iter().map(HostType::into_host).collect())
    }

    fn from_host(value: HostValue) -> Result<Self, ConversionError> {
        match value {
            HostValue::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| T::from_host(item).map_err(|e| e.at(i)))
                .collect(),
            other => Err(ConversionError::mismatch(other, &Self::declared_type())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: HostValue, ty: DeclaredType) {
        let script = to_script(&value, &ty).unwrap();
        assert_eq!(to_host(&script, &ty).unwrap(), value, "round trip through {}", ty);
    }

    #[test]
    fn test_round_trip_supported_types() {
        round_trip(HostValue::Bool(true), DeclaredType::Boolean);
        round_trip(HostValue::Int(i32::MIN), DeclaredType::Integer);
        round_trip(HostValue::Double(-0.5), DeclaredType::Double);
        round_trip(HostValue::from("héllo 🎉 𝄞"), DeclaredType::String);
        round_trip(HostValue::Bytes(vec![0, 255]), DeclaredType::Bytes);
        round_trip(HostValue::Null, DeclaredType::nullable(DeclaredType::Integer));
        round_trip(HostValue::Int(4), DeclaredType::nullable(DeclaredType::Integer));
        round_trip(HostValue::Array(vec![]), DeclaredType::array(DeclaredType::Double));
        round_trip(
            HostValue::Array(vec![
                HostValue::Array(vec![1.into(), 2.into()]),
                HostValue::Array(vec![]),
            ]),
            DeclaredType::array(DeclaredType::array(DeclaredType::Integer)),
        );
    }

    #[test]
    fn test_integral_double_converts_to_int() {
        assert_eq!(
            to_host(&ScriptValue::Float(42.0), &DeclaredType::Integer).unwrap(),
            HostValue::Int(42)
        );
    }

    #[test]
    fn test_non_integral_or_out_of_range_double_fails() {
        for f in [1.5, 3e10, f64::NAN, f64::INFINITY] {
            let err = to_host(&ScriptValue::Float(f), &DeclaredType::Integer).unwrap_err();
            assert_eq!(err.target, "int");
            assert!(!err.unsupported);
        }
    }

    #[test]
    fn test_int_promotes_to_double() {
        assert_eq!(
            to_host(&ScriptValue::Int(2), &DeclaredType::Double).unwrap(),
            HostValue::Double(2.0)
        );
        assert_eq!(
            to_script(&HostValue::Int(2), &DeclaredType::Double).unwrap(),
            ScriptValue::Float(2.0)
        );
    }

    #[test]
    fn test_null_rejected_by_primitive() {
        let err = to_script(&HostValue::Null, &DeclaredType::Boolean).unwrap_err();
        assert_eq!(err.to_string(), "Cannot convert value null to boolean");
        assert!(to_host(&ScriptValue::Undefined, &DeclaredType::Double).is_err());
        assert!(to_host(&ScriptValue::Null, &DeclaredType::String).is_err());
    }

    #[test]
    fn test_boolean_is_strict() {
        assert!(to_host(&ScriptValue::Int(1), &DeclaredType::Boolean).is_err());
        assert!(to_host(&ScriptValue::Bool(true), &DeclaredType::Double).is_err());
    }

    #[test]
    fn test_array_failure_names_element() {
        let value = ScriptValue::Array(vec![1.into(), 2.into(), "three".into()]);
        let err = to_host(&value, &DeclaredType::array(DeclaredType::Integer)).unwrap_err();
        assert_eq!(err.value, "three");
        assert_eq!(err.path, vec![2]);
        assert_eq!(err.to_string(), "Cannot convert value three to int at element [2]");
    }

    #[test]
    fn test_any_rejects_opaque_values() {
        let err = any_to_host(&ScriptValue::Opaque("Date".into())).unwrap_err();
        assert!(err.unsupported);
        match err.into_bridge("Clock.now") {
            BridgeError::Unsupported { type_name, context } => {
                assert_eq!(type_name, "Date");
                assert_eq!(context, "Clock.now");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_find_unsupported() {
        assert_eq!(DeclaredType::Integer.find_unsupported(2), None);
        assert_eq!(
            DeclaredType::array(DeclaredType::named("Date")).find_unsupported(2),
            Some(DeclaredType::named("Date"))
        );
        let cube = DeclaredType::array(DeclaredType::array(DeclaredType::array(
            DeclaredType::Integer,
        )));
        assert_eq!(cube.find_unsupported(2), Some(cube.clone()));
        assert!(DeclaredType::nullable(DeclaredType::Void).find_unsupported(2).is_some());
    }

    #[test]
    fn test_host_type_impls() {
        assert_eq!(<Vec<Option<i32>>>::declared_type().to_string(), "int?[]");
        let v = vec![Some(1), None].into_host();
        assert_eq!(<Vec<Option<i32>>>::from_host(v).unwrap(), vec![Some(1), None]);
        assert_eq!(f64::from_host(HostValue::Int(3)).unwrap(), 3.0);
        assert!(i32::from_host(HostValue::Double(3.0)).is_err());
    }
}
