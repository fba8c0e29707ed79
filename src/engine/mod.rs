//! Script engine boundary.
//!
//! The bridge never interprets script itself. It drives an [`Engine`] through
//! the narrow set of calls below and owns each engine context through a
//! [`ContextHandle`]. [`ScriptedEngine`] is an in-process implementation used
//! by the tests and by hosts that embed without a native interpreter.

pub mod handle;
pub mod scripted;

pub use handle::ContextHandle;
pub use scripted::{Js, JsError, Member, ScriptBody, ScriptFunction, ScriptedEngine, CONTEXT_BASE_SIZE, FRAME_SIZE};

use crate::error::BridgeError;
use crate::value::ScriptValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Message of the error an engine throws when an allocation would exceed its
/// memory limit
pub const OUT_OF_MEMORY: &str = "InternalError: out of memory";

/// Message of the error an engine throws when its interrupt handler asks it
/// to stop
pub const INTERRUPTED: &str = "InternalError: interrupted";

/// Message of the error an engine throws when a call would exceed its maximum
/// stack size
pub const STACK_OVERFLOW: &str = "InternalError: stack overflow";

/// Opaque handle to one engine context. Zero is the closed sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawContext(u64);

impl RawContext {
    /// The cleared handle value
    pub const NULL: RawContext = RawContext(0);

    /// Wrap a raw handle value
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw handle value
    pub fn get(self) -> u64 {
        self.0
    }

    /// Whether this is the cleared sentinel
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Engine-side handle to a resolved script object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyId(pub u64);

/// An error thrown inside the engine and not caught by script
#[derive(Debug)]
pub struct ScriptThrow {
    /// The error's string form
    pub message: String,
    /// Engine stack text, one frame per line
    pub stack: String,
    /// The bridge error raised by a host method the script called, if any
    pub cause: Option<Box<BridgeError>>,
}

impl ScriptThrow {
    /// Create a throw without a host cause
    pub fn new(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: stack.into(),
            cause: None,
        }
    }

    /// Attach the host failure that caused this throw
    pub fn with_cause(mut self, cause: BridgeError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for ScriptThrow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Why a script global could not be used as a proxy target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveFailure {
    /// No global with that name
    NotFound,
    /// The global is not an object
    NotAnObject,
    /// The object has no member with this name
    MissingMethod(String),
    /// The member exists but is not a function
    NotCallable(String),
    /// The engine could not allocate the proxy
    OutOfMemory,
}

/// Why an invocation through a proxy failed
#[derive(Debug)]
pub enum InvokeFailure {
    /// Script threw
    Thrown(ScriptThrow),
    /// The target could no longer be resolved
    Unresolved(ResolveFailure),
}

/// Resource limits of one context.
///
/// A negative memory limit or GC threshold means none; a zero maximum stack
/// size disables the stack check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineLimits {
    /// Bytes the context may allocate (default: -1, unlimited)
    pub memory_limit: i64,
    /// Bytes allocated between garbage collections (default: 256 KiB)
    pub gc_threshold: i64,
    /// Bytes of stack script calls may use (default: 512 KiB)
    pub max_stack_size: i64,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            memory_limit: -1,
            gc_threshold: 256 * 1024,
            max_stack_size: 512 * 1024,
        }
    }
}

/// Allocation statistics of one context
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    /// Live allocations
    pub memory_allocated_count: i64,
    /// Bytes allocated
    pub memory_allocated_size: i64,
    /// Memory limit in bytes, -1 when unlimited
    pub memory_allocated_limit: i64,
    /// Allocations in use
    pub memory_used_count: i64,
    /// Bytes in use
    pub memory_used_size: i64,
    /// String values
    pub strings_count: i64,
    /// Bytes of string data
    pub strings_size: i64,
    /// Objects, host objects included
    pub objects_count: i64,
    /// Global and object properties
    pub properties_count: i64,
    /// Script functions
    pub js_functions_count: i64,
    /// Host methods callable from script
    pub c_functions_count: i64,
    /// Byte arrays
    pub binary_objects_count: i64,
    /// Bytes of byte-array data
    pub binary_objects_size: i64,
}

/// Polled while script runs; returning `true` stops it with [`INTERRUPTED`].
///
/// Polls are not re-entrant: script the handler runs in the same context is
/// not interrupted by it.
pub trait InterruptHandler: Send + Sync {
    /// Whether to stop the running script
    fn poll(&self) -> bool;
}

impl<F> InterruptHandler for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn poll(&self) -> bool {
        self()
    }
}

/// A host object bound as a script global
pub trait HostObject: Send + Sync {
    /// Capability set name
    fn type_name(&self) -> &str;

    /// Names of the callable members
    fn method_names(&self) -> Vec<String>;

    /// Call a member with script arguments
    fn call(&self, method: &str, args: Vec<ScriptValue>) -> Result<ScriptValue, BridgeError>;
}

/// The operations the bridge needs from a script engine.
///
/// A context must only be used by one call at a time; [`ContextHandle`]
/// enforces that for every caller inside this crate.
pub trait Engine: Send + Sync {
    /// Create a context, returning [`RawContext::NULL`] when out of memory
    fn create(&self) -> RawContext;

    /// Destroy a context
    fn destroy(&self, context: RawContext);

    /// Evaluate source text
    fn evaluate(
        &self,
        context: RawContext,
        source: &str,
        file_name: &str,
    ) -> Result<ScriptValue, ScriptThrow>;

    /// Compile source text to bytecode
    fn compile(
        &self,
        context: RawContext,
        source: &str,
        file_name: &str,
    ) -> Result<Vec<u8>, ScriptThrow>;

    /// Execute bytecode produced by [`compile`](Self::compile)
    fn execute(&self, context: RawContext, bytecode: &[u8]) -> Result<ScriptValue, ScriptThrow>;

    /// Whether a global with this name exists
    fn has_global(&self, context: RawContext, name: &str) -> bool;

    /// Register a host object as a global
    fn bind_global(
        &self,
        context: RawContext,
        name: &str,
        object: Arc<dyn HostObject>,
    ) -> Result<(), ScriptThrow>;

    /// Resolve a global object and check it has every named method
    fn resolve_global(
        &self,
        context: RawContext,
        name: &str,
        method_names: &[String],
    ) -> Result<ProxyId, ResolveFailure>;

    /// Call a method of a resolved object by index
    fn invoke(
        &self,
        context: RawContext,
        proxy: ProxyId,
        method_index: usize,
        args: Vec<ScriptValue>,
    ) -> Result<ScriptValue, InvokeFailure>;

    /// Forget a resolved object
    fn release_proxy(&self, context: RawContext, proxy: ProxyId);

    /// Current limits of a context
    fn limits(&self, context: RawContext) -> Option<EngineLimits>;

    /// Replace the limits of a context
    fn set_limits(&self, context: RawContext, limits: EngineLimits);

    /// Allocation statistics of a context
    fn memory_usage(&self, context: RawContext) -> Option<MemoryUsage>;

    /// Run a garbage collection now
    fn gc(&self, context: RawContext);

    /// Install or clear the interrupt handler of a context
    fn set_interrupt_handler(&self, context: RawContext, handler: Option<Arc<dyn InterruptHandler>>);
}
