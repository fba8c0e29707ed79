//! # Script Bridge
//!
//! This library connects a host program to sandboxed ECMAScript contexts. It
//! exposes host services to script as globals, hands script objects back to
//! the host as typed proxies, and carries service calls between two
//! endpoints over a JSON call channel.
//!
//! ## Architecture
//!
//! ```text
//! Host code
//!     │
//!     │ Endpoint (typed services, suspending calls, scopes)
//!     ▼
//! CallChannel (JSON calls and results)
//!     │
//!     │ ScriptContext (bind / proxy, marshalling, stack splicing)
//!     ▼
//! Engine context (ContextHandle)
//! ```
//!
//! ## Features
//!
//! - **Typed bindings**: capability sets are validated before they touch the engine
//! - **Marshalling**: primitives, strings, byte arrays and nested arrays in both directions
//! - **Merged stack traces**: failures show script and host frames in call order
//! - **Suspending calls**: async services with cancellation through dropped futures
//! - **Scopes and leak detection**: services close together and unclosed ones are reported

#![deny(missing_docs)]

pub mod binder;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod logging;
pub mod marshal;
pub mod metrics;
pub mod trace;
pub mod value;

// Re-export commonly used types
pub use binder::{BindingState, FnService, HostService, MethodDescriptor, RemoteProxy, ScriptContext, ServiceDescriptor};
pub use config::{BridgeConfig, EndpointConfig};
pub use endpoint::{
    endpoint_pair, Endpoint, OutboundCallHandler, ServiceAdapter, ServiceFunction, ServiceReference, ServiceScope,
};
pub use engine::{ContextHandle, Engine, EngineLimits, InterruptHandler, MemoryUsage, ScriptedEngine};
pub use error::{BridgeError, ErrorCode, HostException, Result, ScriptException};
pub use marshal::{DeclaredType, HostType};
pub use metrics::{CallMetrics, CallStats};
pub use value::{HostValue, ScriptValue};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
