//! Wire encoding of calls and results.
//!
//! A call is a JSON object naming the service, the function's signature id,
//! an optional callback service for suspending calls, and the ordered
//! arguments. A result is exactly one of `success`, `failure` or
//! `cancelCallback`.

use crate::config::ConfigError;
use crate::error::{BridgeError, ErrorCode, HostException, ScriptException};
use crate::trace::{self, CallFrame};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Failure type marking a call to a service the callee does not have
pub(crate) const UNKNOWN_SERVICE: &str = "UNKNOWN_SERVICE";

/// Failure type marking a call to a function the service does not have
pub(crate) const UNKNOWN_FUNCTION: &str = "UNKNOWN_FUNCTION";

/// An encoded call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedCall {
    /// Target service name
    pub service: String,
    /// Signature id of the called function
    pub function: String,
    /// Suspend callback service for suspending calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    /// Ordered arguments
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Serializable form of a failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrowableSurrogate {
    /// Failure types, most specific first
    pub types: Vec<String>,
    /// `kind: message` followed by one frame per line
    pub stacktrace_string: String,
    /// Structured fields of a bridge failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Frames of a host exception; preferred over the rendered text
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<CallFrame>,
}

/// Fields of the bridge failures that carry more than a message
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Details {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    actual: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exception: Option<ScriptException>,
    /// `invalidValue`, `io` or `serialization`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl Details {
    fn of(err: &BridgeError) -> Option<Self> {
        let details = match err {
            BridgeError::Unsupported { type_name, context } => Details {
                type_name: Some(type_name.clone()),
                context: Some(context.clone()),
                ..Default::default()
            },
            BridgeError::Arity {
                target,
                expected,
                actual,
            } => Details {
                target: Some(target.clone()),
                expected: Some(expected.clone()),
                actual: Some(*actual),
                ..Default::default()
            },
            BridgeError::NotCallable { path } => Details {
                path: Some(path.clone()),
                ..Default::default()
            },
            BridgeError::DuplicateName { name } => Details {
                name: Some(name.clone()),
                ..Default::default()
            },
            BridgeError::Cancelled { function } => Details {
                function: Some(function.clone()),
                ..Default::default()
            },
            BridgeError::ScriptRuntime(exception) => Details {
                exception: Some(exception.clone()),
                ..Default::default()
            },
            BridgeError::Config(config) => {
                let (kind, field, reason) = match config {
                    ConfigError::InvalidValue { field, reason } => ("invalidValue", Some(field.clone()), reason.clone()),
                    ConfigError::Io(err) => ("io", None, err.to_string()),
                    ConfigError::Serialization(err) => ("serialization", None, err.to_string()),
                };
                Details {
                    config: Some(kind.to_string()),
                    field,
                    reason: Some(reason),
                    ..Default::default()
                }
            }
            _ => return None,
        };
        Some(details)
    }

    /// Rebuild the error for `code`, or `None` when a field is missing
    fn rebuild(self, code: ErrorCode) -> Option<BridgeError> {
        let err = match code {
            ErrorCode::Unsupported => BridgeError::Unsupported {
                type_name: self.type_name?,
                context: self.context?,
            },
            ErrorCode::Arity => BridgeError::Arity {
                target: self.target?,
                expected: self.expected?,
                actual: self.actual?,
            },
            ErrorCode::NotCallable => BridgeError::NotCallable { path: self.path? },
            ErrorCode::DuplicateName => BridgeError::DuplicateName { name: self.name? },
            ErrorCode::Cancelled => BridgeError::Cancelled {
                function: self.function?,
            },
            ErrorCode::ScriptRuntime => BridgeError::ScriptRuntime(self.exception?),
            ErrorCode::Config => {
                let reason = self.reason?;
                BridgeError::Config(match self.config.as_deref()? {
                    "invalidValue" => ConfigError::InvalidValue {
                        field: self.field?,
                        reason,
                    },
                    "io" => ConfigError::Io(std::io::Error::other(reason)),
                    _ => ConfigError::Serialization(<serde_json::Error as serde::de::Error>::custom(reason)),
                })
            }
            _ => return None,
        };
        Some(err)
    }
}

/// An encoded call result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EncodedResult {
    /// The call returned
    #[serde(rename = "success")]
    Success(Value),
    /// The call failed
    #[serde(rename = "failure")]
    Failure(ThrowableSurrogate),
    /// A suspending call started; cancel it through this service
    #[serde(rename = "cancelCallback")]
    CancelCallback(String),
}

impl EncodedResult {
    /// Result of a returning call
    pub(crate) fn from_result(result: crate::error::Result<Value>) -> Self {
        match result {
            Ok(value) => EncodedResult::Success(value),
            Err(err) => EncodedResult::Failure(encode_failure(&err)),
        }
    }
}

/// Encode a failure for the wire
pub(crate) fn encode_failure(err: &BridgeError) -> ThrowableSurrogate {
    match err {
        BridgeError::HostRethrow(exception) => ThrowableSurrogate {
            types: vec![exception.kind().to_string()],
            stacktrace_string: exception.stack_trace(),
            details: None,
            frames: exception.frames().to_vec(),
        },
        other => ThrowableSurrogate {
            types: vec![other.code().to_string()],
            stacktrace_string: format!("{}: {}", other.code(), other),
            details: Details::of(other).and_then(|details| serde_json::to_value(details).ok()),
            frames: Vec::new(),
        },
    }
}

/// Failure marking a routing miss on the callee
pub(crate) fn mismatch_failure(marker: &str, message: String) -> ThrowableSurrogate {
    ThrowableSurrogate {
        types: vec![ErrorCode::ApiMismatch.to_string(), marker.to_string()],
        stacktrace_string: format!("{}: {}", ErrorCode::ApiMismatch, message),
        details: None,
        frames: Vec::new(),
    }
}

/// Decode a failure received from the other side
pub(crate) fn decode_failure(surrogate: &ThrowableSurrogate) -> BridgeError {
    let kind = surrogate
        .types
        .first()
        .cloned()
        .unwrap_or_else(|| "Exception".to_string());
    let (first_line, rest) = trace::split_message(&surrogate.stacktrace_string);
    let message = first_line
        .strip_prefix(kind.as_str())
        .and_then(|m| m.strip_prefix(": "))
        .unwrap_or(first_line)
        .to_string();

    let remote = |kind: String, message: String| {
        let frames = if surrogate.frames.is_empty() {
            trace::parse_stack_trace(rest)
        } else {
            surrogate.frames.clone()
        };
        BridgeError::HostRethrow(HostException::remote(kind, message, frames))
    };
    let unprefixed = |prefix: &str| message.strip_prefix(prefix).unwrap_or(&message).to_string();

    let code = match ErrorCode::from_name(&kind) {
        Some(ErrorCode::HostRethrow) | None => return remote(kind, message),
        Some(code) => code,
    };
    match code {
        ErrorCode::Shape => BridgeError::Shape(message),
        ErrorCode::Marshal => BridgeError::Marshal { message },
        ErrorCode::NullContext => BridgeError::NullContext,
        ErrorCode::OutOfMemory => BridgeError::OutOfMemory(unprefixed("Out of memory: ")),
        ErrorCode::ApiMismatch => BridgeError::ApiMismatch(message),
        ErrorCode::Closed => BridgeError::Closed(message),
        ErrorCode::Serialization => BridgeError::Serialization(unprefixed("Serialization error: ")),
        structured => {
            let details = surrogate
                .details
                .clone()
                .and_then(|value| serde_json::from_value::<Details>(value).ok());
            match details.and_then(|details| details.rebuild(structured)) {
                Some(err) => err,
                None => remote(kind, message),
            }
        }
    }
}

/// Serde helpers for `i64` values that must survive a double-based runtime.
///
/// Values within ±(2^53 − 1) are written as numbers; anything larger is
/// written as a decimal string. Both forms are accepted on input.
pub mod longs {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Largest integer a double represents exactly
    pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

    /// Serialize an `i64`
    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(value) {
            serializer.serialize_i64(*value)
        } else {
            serializer.serialize_str(&value.to_string())
        }
    }

    /// Deserialize an `i64` from a number or a string
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(i64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
