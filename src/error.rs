//! Error types for the script bridge.
//!
//! This module defines the error codes, the exception records that cross the
//! boundary, and the main error type used throughout the bridge.

use crate::config::ConfigError;
use crate::trace::{self, CallFrame};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Error codes for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed capability set (extends another, overloaded, missing member)
    Shape,
    /// Type outside the supported set
    Unsupported,
    /// Value/type mismatch during conversion
    Marshal,
    /// Argument count mismatch
    Arity,
    /// Script property exists but cannot be called
    NotCallable,
    /// A global with the same name is already registered
    DuplicateName,
    /// The engine context was already destroyed
    NullContext,
    /// Uncaught script-side error
    ScriptRuntime,
    /// Exception thrown by a host-implemented method
    HostRethrow,
    /// Context or proxy creation ran out of memory
    OutOfMemory,
    /// Called service or function is unknown to the other side
    ApiMismatch,
    /// Call on a closed service or scope
    Closed,
    /// Suspending call was abandoned
    Cancelled,
    /// Wire payload could not be encoded or decoded
    Serialization,
    /// Invalid configuration
    Config,
}

impl ErrorCode {
    /// Every error code
    pub const ALL: [ErrorCode; 15] = [
        ErrorCode::Shape,
        ErrorCode::Unsupported,
        ErrorCode::Marshal,
        ErrorCode::Arity,
        ErrorCode::NotCallable,
        ErrorCode::DuplicateName,
        ErrorCode::NullContext,
        ErrorCode::ScriptRuntime,
        ErrorCode::HostRethrow,
        ErrorCode::OutOfMemory,
        ErrorCode::ApiMismatch,
        ErrorCode::Closed,
        ErrorCode::Cancelled,
        ErrorCode::Serialization,
        ErrorCode::Config,
    ];

    /// Look up a code by its display name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.to_string() == name)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Shape => write!(f, "SHAPE"),
            ErrorCode::Unsupported => write!(f, "UNSUPPORTED"),
            ErrorCode::Marshal => write!(f, "MARSHAL"),
            ErrorCode::Arity => write!(f, "ARITY"),
            ErrorCode::NotCallable => write!(f, "NOT_CALLABLE"),
            ErrorCode::DuplicateName => write!(f, "DUPLICATE_NAME"),
            ErrorCode::NullContext => write!(f, "NULL_CONTEXT"),
            ErrorCode::ScriptRuntime => write!(f, "SCRIPT_RUNTIME"),
            ErrorCode::HostRethrow => write!(f, "HOST_RETHROW"),
            ErrorCode::OutOfMemory => write!(f, "OUT_OF_MEMORY"),
            ErrorCode::ApiMismatch => write!(f, "API_MISMATCH"),
            ErrorCode::Closed => write!(f, "CLOSED"),
            ErrorCode::Cancelled => write!(f, "CANCELLED"),
            ErrorCode::Serialization => write!(f, "SERIALIZATION"),
            ErrorCode::Config => write!(f, "CONFIG"),
        }
    }
}

/// An uncaught error raised by script code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptException {
    message: String,
    frames: Vec<CallFrame>,
}

impl ScriptException {
    /// Create a script exception
    pub fn new(message: impl Into<String>, frames: Vec<CallFrame>) -> Self {
        Self {
            message: message.into(),
            frames,
        }
    }

    /// The first line of the engine's error text
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Merged frames, innermost first
    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    /// Message followed by the rendered frames
    pub fn stack_trace(&self) -> String {
        format!("{}\n{}", self.message, trace::render(&self.frames))
    }
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ScriptException {}

/// An exception thrown by host code, carried across the boundary.
///
/// The original error value is kept so callers can downcast to it after the
/// exception has travelled through script frames.
#[derive(Debug, Clone)]
pub struct HostException {
    kind: String,
    message: String,
    frames: Vec<CallFrame>,
    origin: Option<(&'static str, u32)>,
    spliced: bool,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl HostException {
    /// Create an exception of the given kind, recording where it was raised
    #[track_caller]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            kind: kind.into(),
            message: message.into(),
            frames: Vec::new(),
            origin: Some((location.file(), location.line())),
            spliced: false,
            source: None,
        }
    }

    /// Wrap a host error, keeping it available through [`downcast_ref`](Self::downcast_ref)
    #[track_caller]
    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let type_name = std::any::type_name::<E>();
        let base = type_name.split('<').next().unwrap_or(type_name);
        let kind = base.rsplit("::").next().unwrap_or(base);
        let mut exception = Self::new(kind, error.to_string());
        exception.source = Some(Arc::new(error));
        exception
    }

    /// Rebuild an exception that was received from the other side of a channel
    pub(crate) fn remote(kind: String, message: String, frames: Vec<CallFrame>) -> Self {
        Self {
            kind,
            message,
            frames,
            origin: None,
            spliced: true,
            source: None,
        }
    }

    /// Exception kind (the original error type name)
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Exception message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Merged frames, innermost first
    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    /// The original error, if it has type `E`
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.source.as_deref()?.downcast_ref::<E>()
    }

    /// `kind: message` followed by the rendered frames
    pub fn stack_trace(&self) -> String {
        format!("{}\n{}", self, trace::render(&self.frames))
    }

    /// Record the host method that threw as the innermost frame
    pub(crate) fn thrown_from(mut self, function: &str) -> Self {
        if self.frames.is_empty() {
            let frame = match self.origin {
                Some((file, line)) => CallFrame::host(function, file, line),
                None => CallFrame {
                    origin: crate::trace::FrameOrigin::Host,
                    function: function.to_string(),
                    location: crate::trace::FrameLocation::Unknown,
                },
            };
            self.frames.push(frame);
        }
        self
    }

    /// Merge the script frames and the host frames that led into the engine
    pub(crate) fn spliced(mut self, script_frames: Vec<CallFrame>, host_frames: &[CallFrame]) -> Self {
        if !self.spliced {
            self.frames.extend(trace::splice(host_frames, script_frames));
            self.spliced = true;
        }
        self
    }
}

impl fmt::Display for HostException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HostException {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Main error type for the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Malformed capability set or unresolvable script target
    #[error("{0}")]
    Shape(String),

    /// Type outside the supported set
    #[error("Unsupported type {type_name} in {context}")]
    Unsupported {
        /// The offending type
        type_name: String,
        /// Method or value the type was declared on
        context: String,
    },

    /// Value/type mismatch during conversion
    #[error("{message}")]
    Marshal {
        /// Offending value, target type and position
        message: String,
    },

    /// Argument count mismatch
    #[error("Wrong number of arguments calling {target}: expected {expected}, got {actual}")]
    Arity {
        /// `service.method` being called
        target: String,
        /// Accepted count, e.g. `2` or `at least 1`
        expected: String,
        /// Count supplied
        actual: usize,
    },

    /// Script property is not callable
    #[error("JavaScript property {path} not callable")]
    NotCallable {
        /// `global.member` path
        path: String,
    },

    /// A global with this name already exists
    #[error("A global object called {name} already exists")]
    DuplicateName {
        /// The global name
        name: String,
    },

    /// The context was destroyed
    #[error("Script context is closed")]
    NullContext,

    /// Uncaught script-side error
    #[error("{0}")]
    ScriptRuntime(ScriptException),

    /// Exception thrown by host code, with merged trace
    #[error("{0}")]
    HostRethrow(HostException),

    /// Context or proxy creation failed for lack of memory
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// The other side of a channel does not know the called service or function
    #[error("{0}")]
    ApiMismatch(String),

    /// Call on a closed service or scope
    #[error("{0}")]
    Closed(String),

    /// A suspending call was abandoned before it completed
    #[error("Call to {function} was cancelled")]
    Cancelled {
        /// Signature of the abandoned function
        function: String,
    },

    /// Wire payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::Shape(_) => ErrorCode::Shape,
            BridgeError::Unsupported { .. } => ErrorCode::Unsupported,
            BridgeError::Marshal { .. } => ErrorCode::Marshal,
            BridgeError::Arity { .. } => ErrorCode::Arity,
            BridgeError::NotCallable { .. } => ErrorCode::NotCallable,
            BridgeError::DuplicateName { .. } => ErrorCode::DuplicateName,
            BridgeError::NullContext => ErrorCode::NullContext,
            BridgeError::ScriptRuntime(_) => ErrorCode::ScriptRuntime,
            BridgeError::HostRethrow(_) => ErrorCode::HostRethrow,
            BridgeError::OutOfMemory(_) => ErrorCode::OutOfMemory,
            BridgeError::ApiMismatch(_) => ErrorCode::ApiMismatch,
            BridgeError::Closed(_) => ErrorCode::Closed,
            BridgeError::Cancelled { .. } => ErrorCode::Cancelled,
            BridgeError::Serialization(_) => ErrorCode::Serialization,
            BridgeError::Config(_) => ErrorCode::Config,
        }
    }

    /// Create an arity error
    pub fn arity(target: impl Into<String>, expected: impl Into<String>, actual: usize) -> Self {
        BridgeError::Arity {
            target: target.into(),
            expected: expected.into(),
            actual,
        }
    }

    /// Create an unsupported-type error
    pub fn unsupported(type_name: impl Into<String>, context: impl Into<String>) -> Self {
        BridgeError::Unsupported {
            type_name: type_name.into(),
            context: context.into(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
