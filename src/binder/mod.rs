//! Capability-set binding and proxying over one script context.
//!
//! [`ScriptContext`] owns an engine context and offers the two directions of
//! the bridge: [`bind`](ScriptContext::bind) exposes a host service as a
//! script global, [`proxy`](ScriptContext::proxy) returns a host value that
//! calls a script object. Both validate the capability set before touching
//! the engine, and a failed bind leaves the context exactly as it was.
//!
//! Proxies are bound to the global *name*: every call looks the global up
//! again, so rebinding the name is observed and deleting it makes later
//! calls fail with a shape error.

pub mod descriptor;
pub mod inbound;
pub mod proxy;

pub use descriptor::{MethodDescriptor, ServiceDescriptor};
pub use inbound::{FnService, HostService};
pub use proxy::RemoteProxy;

use crate::config::BridgeConfig;
use crate::engine::{ContextHandle, Engine, EngineLimits, InterruptHandler, MemoryUsage, ResolveFailure, ScriptThrow, OUT_OF_MEMORY};
use crate::error::{BridgeError, Result};
use crate::marshal;
use crate::trace::{self, CallFrame};
use crate::value::{HostValue, ScriptValue};
use inbound::DispatchTable;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::Location;
use std::sync::Arc;
use tracing::{debug, info, instrument};

const EVALUATE_ENTRY: &str = "ScriptContext::evaluate";
const EXECUTE_ENTRY: &str = "ScriptContext::execute";

/// Lifecycle of a capability set within one context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    /// Never seen by this context
    Unvalidated,
    /// Validated but not registered
    Validated,
    /// Exposed to script as a global
    Bound,
    /// Consumed through a proxy
    Proxied,
    /// The context was closed
    Released,
}

/// A script context with typed bindings in both directions
pub struct ScriptContext {
    handle: Arc<ContextHandle>,
    config: BridgeConfig,
    states: Mutex<HashMap<String, BindingState>>,
}

impl ScriptContext {
    /// Create a context with the default configuration
    pub fn create(engine: Arc<dyn Engine>) -> Result<Self> {
        Self::with_config(engine, BridgeConfig::default())
    }

    /// Create a context
    pub fn with_config(engine: Arc<dyn Engine>, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let handle = ContextHandle::create(engine, config.leak_warnings)?;
        handle.set_limits(config.limits())?;
        Ok(Self {
            handle: Arc::new(handle),
            config,
            states: Mutex::new(HashMap::new()),
        })
    }

    /// Evaluate source under the default file name
    #[track_caller]
    pub fn evaluate(&self, source: &str) -> Result<HostValue> {
        self.evaluate_file(source, &self.config.default_file_name)
    }

    /// Evaluate source, reporting `file_name` in script frames
    #[track_caller]
    pub fn evaluate_file(&self, source: &str, file_name: &str) -> Result<HostValue> {
        let frames = entry_frames(EVALUATE_ENTRY, line!(), Location::caller());
        self.handle.enter(frames, |engine, raw| {
            debug!(file_name, "Evaluating script");
            let value = engine
                .evaluate(raw, source, file_name)
                .map_err(|throw| classify_throw(throw, &self.handle.host_frames()))?;
            evaluation_result(&value)
        })
    }

    /// Compile source to bytecode for [`execute`](Self::execute)
    #[instrument(skip(self, source))]
    pub fn compile(&self, source: &str, file_name: &str) -> Result<Vec<u8>> {
        self.handle.enter(Vec::new(), |engine, raw| {
            engine
                .compile(raw, source, file_name)
                .map_err(|throw| classify_throw(throw, &[]))
        })
    }

    /// Execute bytecode from [`compile`](Self::compile)
    #[track_caller]
    pub fn execute(&self, bytecode: &[u8]) -> Result<HostValue> {
        let frames = entry_frames(EXECUTE_ENTRY, line!(), Location::caller());
        self.handle.enter(frames, |engine, raw| {
            let value = engine
                .execute(raw, bytecode)
                .map_err(|throw| classify_throw(throw, &self.handle.host_frames()))?;
            evaluation_result(&value)
        })
    }

    /// Expose `service` to script as the global `name`
    #[instrument(skip(self, descriptor, service), fields(service = %descriptor.name()))]
    pub fn bind(
        &self,
        name: &str,
        descriptor: &ServiceDescriptor,
        service: Arc<dyn HostService>,
    ) -> Result<()> {
        descriptor.validate(self.config.max_array_depth)?;
        self.set_state(descriptor, BindingState::Validated);

        self.handle.enter(Vec::new(), |engine, raw| {
            if engine.has_global(raw, name) {
                return Err(BridgeError::DuplicateName {
                    name: name.to_string(),
                });
            }
            let table = DispatchTable::new(Arc::new(descriptor.clone()), service);
            engine
                .bind_global(raw, name, Arc::new(table))
                .map_err(|throw| {
                    if throw.message == OUT_OF_MEMORY {
                        BridgeError::OutOfMemory(format!("cannot bind {}", name))
                    } else {
                        classify_throw(throw, &[])
                    }
                })
        })?;

        self.set_state(descriptor, BindingState::Bound);
        info!(name, service = descriptor.name(), "Bound host service");
        Ok(())
    }

    /// Get a host proxy for the script global `name`
    #[instrument(skip(self, descriptor), fields(service = %descriptor.name()))]
    pub fn proxy(&self, name: &str, descriptor: &ServiceDescriptor) -> Result<RemoteProxy> {
        descriptor.validate(self.config.max_array_depth)?;
        self.set_state(descriptor, BindingState::Validated);

        let proxy = self.handle.enter(Vec::new(), |engine, raw| {
            engine
                .resolve_global(raw, name, &descriptor.method_names())
                .map_err(|failure| resolve_error(name, failure))
        })?;

        self.set_state(descriptor, BindingState::Proxied);
        debug!(name, service = descriptor.name(), "Created script proxy");
        Ok(RemoteProxy::new(
            name.to_string(),
            Arc::new(descriptor.clone()),
            proxy,
            self.handle.clone(),
        ))
    }

    /// Lifecycle state of a capability set in this context
    pub fn binding_state(&self, descriptor: &ServiceDescriptor) -> BindingState {
        self.states
            .lock()
            .get(descriptor.name())
            .copied()
            .unwrap_or(BindingState::Unvalidated)
    }

    /// Destroy the context; proxies fail with `NullContext` afterwards
    pub fn close(&self) {
        self.handle.close();
        for state in self.states.lock().values_mut() {
            *state = BindingState::Released;
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Current engine limits of the context
    pub fn limits(&self) -> Result<EngineLimits> {
        self.handle.limits()
    }

    /// Bytes the context may allocate; -1 for no limit
    pub fn set_memory_limit(&self, bytes: i64) -> Result<()> {
        self.handle.set_memory_limit(bytes)
    }

    /// Bytes allocated between garbage collections; -1 disables automatic collection
    pub fn set_gc_threshold(&self, bytes: i64) -> Result<()> {
        self.handle.set_gc_threshold(bytes)
    }

    /// Bytes of stack script calls may use; 0 disables the check
    pub fn set_max_stack_size(&self, bytes: i64) -> Result<()> {
        self.handle.set_max_stack_size(bytes)
    }

    /// Allocation statistics of the context
    pub fn memory_usage(&self) -> Result<MemoryUsage> {
        self.handle.memory_usage()
    }

    /// Run a garbage collection now
    pub fn gc(&self) -> Result<()> {
        self.handle.gc()
    }

    /// Install or clear the handler polled while script runs. Returning
    /// `true` from it stops the running script with an `InternalError`.
    pub fn set_interrupt_handler(&self, handler: Option<Arc<dyn InterruptHandler>>) -> Result<()> {
        self.handle.set_interrupt_handler(handler)
    }

    /// Active configuration
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn set_state(&self, descriptor: &ServiceDescriptor, state: BindingState) {
        let mut states = self.states.lock();
        let entry = states
            .entry(descriptor.name().to_string())
            .or_insert(BindingState::Unvalidated);
        // A set already bound or proxied stays so when revalidated.
        if state != BindingState::Validated || *entry == BindingState::Unvalidated {
            *entry = state;
        }
    }
}

impl std::fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptContext")
            .field("handle", &self.handle)
            .finish()
    }
}

fn entry_frames(entry: &str, line: u32, caller: &Location<'_>) -> Vec<CallFrame> {
    vec![
        CallFrame::native(entry),
        CallFrame::host(entry, file!(), line),
        CallFrame::caller(caller),
    ]
}

fn evaluation_result(value: &ScriptValue) -> Result<HostValue> {
    marshal::any_to_host(value).map_err(|e| e.into_bridge("evaluation result"))
}

/// Turn an uncaught script error into the host-visible failure.
///
/// A throw caused by a host method surfaces as that method's failure; a host
/// exception gains the script frames and `host_frames` as its merged trace.
pub(crate) fn classify_throw(throw: ScriptThrow, host_frames: &[CallFrame]) -> BridgeError {
    let ScriptThrow {
        message,
        stack,
        cause,
    } = throw;
    match cause.map(|cause| *cause) {
        Some(BridgeError::HostRethrow(exception)) => {
            let script_frames = trace::parse_stack_trace(&stack);
            BridgeError::HostRethrow(exception.spliced(script_frames, host_frames))
        }
        Some(other) => other,
        None => BridgeError::ScriptRuntime(trace::wrap(&message, &stack, host_frames)),
    }
}

/// Describe why the global `name` could not serve as a proxy target
pub(crate) fn resolve_error(name: &str, failure: ResolveFailure) -> BridgeError {
    match failure {
        ResolveFailure::NotFound => {
            BridgeError::Shape(format!("A global JavaScript object called {} was not found", name))
        }
        ResolveFailure::NotAnObject => {
            BridgeError::Shape(format!("JavaScript global called {} is not an object", name))
        }
        ResolveFailure::MissingMethod(method) => BridgeError::Shape(format!(
            "JavaScript global {} has no method called {}",
            name, method
        )),
        ResolveFailure::NotCallable(method) => BridgeError::NotCallable {
            path: format!("{}.{}", name, method),
        },
        ResolveFailure::OutOfMemory => {
            BridgeError::OutOfMemory(format!("cannot create a proxy for {}", name))
        }
    }
}
