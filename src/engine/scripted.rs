//! In-process engine driven by registered Rust closures.
//!
//! Programs are registered per source text; evaluating that text runs the
//! closure against a [`Js`] scope that behaves like a small script runtime:
//! it keeps globals, calls script functions with real call frames, calls
//! bound host objects, and reports uncaught errors with engine-style stack
//! text (`    at f2 (test.js:10)`). Source text with no registered program
//! is evaluated as a literal or a global property path.
//!
//! Each context charges a fixed cost per global, member, value and proxy
//! against its memory limit and a fixed [`FRAME_SIZE`] per script call
//! against its stack size, and polls its interrupt handler on every call and
//! every [`Js::tick`].

use super::{
    Engine, EngineLimits, HostObject, InterruptHandler, InvokeFailure, MemoryUsage, ProxyId, RawContext,
    ResolveFailure, ScriptThrow, OUT_OF_MEMORY,
};
use crate::error::BridgeError;
use crate::value::ScriptValue;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

const BYTECODE_VERSION: u32 = 1;

/// Bytes an empty context occupies
pub const CONTEXT_BASE_SIZE: usize = 16 * 1024;

/// Stack bytes one script call frame occupies
pub const FRAME_SIZE: usize = 256;

const BASE_ALLOCATIONS: usize = 64;
const OBJECT_SIZE: usize = 64;
const PROPERTY_SIZE: usize = 32;
const PROXY_SIZE: usize = 32;
const VALUE_SIZE: usize = 16;

/// Body of a script function or top-level program
pub type ScriptBody =
    Arc<dyn Fn(&mut Js, Vec<ScriptValue>) -> Result<ScriptValue, JsError> + Send + Sync>;

/// An error value thrown by script
#[derive(Debug)]
pub struct JsError {
    /// Constructor name (`Error`, `TypeError`, ...)
    pub name: String,
    /// The `message` property
    pub message: String,
    /// Stack text captured where the error was created
    pub stack: String,
    /// Host failure that caused the throw
    pub cause: Option<Box<BridgeError>>,
}

impl fmt::Display for JsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl From<JsError> for ScriptThrow {
    fn from(err: JsError) -> Self {
        ScriptThrow {
            message: err.to_string(),
            stack: err.stack,
            cause: err.cause,
        }
    }
}

/// A named script function with a definition site
#[derive(Clone)]
pub struct ScriptFunction {
    name: String,
    file: String,
    line: u32,
    body: ScriptBody,
}

impl ScriptFunction {
    /// Define a function `name` at `file:line`
    pub fn new<F>(name: impl Into<String>, file: impl Into<String>, line: u32, body: F) -> Self
    where
        F: Fn(&mut Js, Vec<ScriptValue>) -> Result<ScriptValue, JsError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            file: file.into(),
            line,
            body: Arc::new(body),
        }
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ScriptFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function {}() ({}:{})", self.name, self.file, self.line)
    }
}

/// A property of a script object
#[derive(Debug, Clone)]
pub enum Member {
    /// Plain value
    Value(ScriptValue),
    /// Function
    Function(ScriptFunction),
}

#[derive(Clone)]
enum Global {
    Value(ScriptValue),
    Object(HashMap<String, Member>),
    Host(Arc<dyn HostObject>),
}

enum Callable {
    Script(ScriptFunction),
    Host(Arc<dyn HostObject>),
}

struct ProxyTarget {
    global: String,
    methods: Vec<String>,
}

fn value_size(value: &ScriptValue) -> usize {
    VALUE_SIZE
        + match value {
            ScriptValue::String(text) | ScriptValue::Opaque(text) => text.len(),
            ScriptValue::Bytes(bytes) => bytes.len(),
            ScriptValue::Array(items) => items.iter().map(value_size).sum(),
            _ => 0,
        }
}

fn member_size(member: &Member) -> usize {
    PROPERTY_SIZE
        + match member {
            Member::Value(value) => value_size(value),
            Member::Function(_) => OBJECT_SIZE,
        }
}

fn global_size(global: &Global) -> usize {
    PROPERTY_SIZE
        + match global {
            Global::Value(value) => value_size(value),
            Global::Object(members) => OBJECT_SIZE + members.values().map(member_size).sum::<usize>(),
            Global::Host(_) => OBJECT_SIZE,
        }
}

fn count_value(usage: &mut MemoryUsage, value: &ScriptValue) {
    match value {
        ScriptValue::String(text) => {
            usage.strings_count += 1;
            usage.strings_size += text.len() as i64;
        }
        ScriptValue::Bytes(bytes) => {
            usage.binary_objects_count += 1;
            usage.binary_objects_size += bytes.len() as i64;
        }
        ScriptValue::Array(items) => {
            usage.objects_count += 1;
            for item in items {
                count_value(usage, item);
            }
        }
        _ => {}
    }
}

#[derive(Default)]
struct ContextState {
    globals: HashMap<String, Global>,
    proxies: HashMap<u64, ProxyTarget>,
    next_proxy: u64,
    limits: EngineLimits,
    allocated_since_gc: usize,
    gc_runs: u64,
    stack_depth: usize,
    interrupt: Option<Arc<dyn InterruptHandler>>,
    polling: bool,
}

impl ContextState {
    fn used_size(&self) -> usize {
        CONTEXT_BASE_SIZE
            + self.globals.values().map(global_size).sum::<usize>()
            + self.proxies.len() * PROXY_SIZE
    }

    /// Account for `added` bytes replacing `released` ones; false when that
    /// would exceed the memory limit
    fn charge(&mut self, released: usize, added: usize) -> bool {
        if self.limits.memory_limit >= 0 {
            let after = (self.used_size() + added).saturating_sub(released);
            if after as i64 > self.limits.memory_limit {
                return false;
            }
        }
        self.allocated_since_gc += added;
        if self.limits.gc_threshold >= 0 && self.allocated_since_gc as i64 >= self.limits.gc_threshold {
            self.collect();
        }
        true
    }

    fn collect(&mut self) {
        self.gc_runs += 1;
        self.allocated_since_gc = 0;
    }

    fn insert_global(&mut self, name: &str, global: Global) -> bool {
        let released = self.globals.get(name).map_or(0, global_size);
        if !self.charge(released, global_size(&global)) {
            return false;
        }
        self.globals.insert(name.to_string(), global);
        true
    }

    fn memory_usage(&self) -> MemoryUsage {
        let mut usage = MemoryUsage {
            memory_allocated_limit: self.limits.memory_limit,
            properties_count: self.globals.len() as i64,
            ..MemoryUsage::default()
        };
        for global in self.globals.values() {
            match global {
                Global::Value(value) => count_value(&mut usage, value),
                Global::Object(members) => {
                    usage.objects_count += 1;
                    usage.properties_count += members.len() as i64;
                    for member in members.values() {
                        match member {
                            Member::Value(value) => count_value(&mut usage, value),
                            Member::Function(_) => {
                                usage.objects_count += 1;
                                usage.js_functions_count += 1;
                            }
                        }
                    }
                }
                Global::Host(object) => {
                    usage.objects_count += 1;
                    usage.c_functions_count += object.method_names().len() as i64;
                }
            }
        }
        let count = (BASE_ALLOCATIONS + self.proxies.len()) as i64
            + usage.properties_count
            + usage.objects_count
            + usage.strings_count
            + usage.binary_objects_count;
        let size = self.used_size() as i64;
        usage.memory_allocated_count = count;
        usage.memory_used_count = count;
        usage.memory_allocated_size = size;
        usage.memory_used_size = size;
        usage
    }

    /// Resolve `global.method` to something callable
    fn callable(&self, global: &str, method: &str) -> Result<Callable, ResolveFailure> {
        match self.globals.get(global) {
            None => Err(ResolveFailure::NotFound),
            Some(Global::Value(_)) => Err(ResolveFailure::NotAnObject),
            Some(Global::Host(object)) => {
                if object.method_names().iter().any(|m| m == method) {
                    Ok(Callable::Host(object.clone()))
                } else {
                    Err(ResolveFailure::MissingMethod(method.to_string()))
                }
            }
            Some(Global::Object(members)) => match members.get(method) {
                Some(Member::Function(function)) => Ok(Callable::Script(function.clone())),
                Some(Member::Value(_)) => Err(ResolveFailure::NotCallable(method.to_string())),
                None => Err(ResolveFailure::MissingMethod(method.to_string())),
            },
        }
    }
}

struct Frame {
    function: String,
    file: String,
    line: u32,
}

/// Scope handed to program and function bodies
pub struct Js {
    state: Arc<Mutex<ContextState>>,
    frames: Vec<Frame>,
}

impl Js {
    /// Set the current line of the innermost frame
    pub fn at(&mut self, line: u32) {
        if let Some(frame) = self.frames.last_mut() {
            frame.line = line;
        }
    }

    /// Current stack text, innermost first
    pub fn stack(&self) -> String {
        self.frames
            .iter()
            .rev()
            .map(|f| format!("    at {} ({}:{})\n", f.function, f.file, f.line))
            .collect()
    }

    /// Count one unit of script work, polling the interrupt handler
    pub fn tick(&mut self) -> Result<(), JsError> {
        let handler = {
            let mut state = self.state.lock();
            if state.polling {
                return Ok(());
            }
            let Some(handler) = state.interrupt.clone() else {
                return Ok(());
            };
            state.polling = true;
            handler
        };
        let interrupted = handler.poll();
        self.state.lock().polling = false;
        if interrupted {
            return Err(self.error("InternalError", "interrupted"));
        }
        Ok(())
    }

    fn out_of_memory(&self) -> JsError {
        self.error("InternalError", "out of memory")
    }

    /// Create an error of the given constructor at the current position
    pub fn error(&self, name: &str, message: impl Into<String>) -> JsError {
        JsError {
            name: name.to_string(),
            message: message.into(),
            stack: self.stack(),
            cause: None,
        }
    }

    /// Throw an `Error` with this message
    pub fn throw<T>(&self, message: impl Into<String>) -> Result<T, JsError> {
        Err(self.error("Error", message))
    }

    /// Read a global
    pub fn get(&self, name: &str) -> Result<ScriptValue, JsError> {
        match self.state.lock().globals.get(name) {
            Some(Global::Value(value)) => Ok(value.clone()),
            Some(_) => Ok(ScriptValue::Opaque("[object Object]".to_string())),
            None => Err(self.error("ReferenceError", format!("{} is not defined", name))),
        }
    }

    /// Read `object.member`
    pub fn get_member(&self, object: &str, member: &str) -> Result<ScriptValue, JsError> {
        let state = self.state.lock();
        match state.globals.get(object) {
            Some(Global::Object(members)) => Ok(match members.get(member) {
                Some(Member::Value(value)) => value.clone(),
                Some(Member::Function(_)) => ScriptValue::Opaque("function".to_string()),
                None => ScriptValue::Undefined,
            }),
            Some(Global::Host(host)) => Ok(if host.method_names().iter().any(|m| m == member) {
                ScriptValue::Opaque("function".to_string())
            } else {
                ScriptValue::Undefined
            }),
            Some(Global::Value(_)) => Ok(ScriptValue::Undefined),
            None => Err(self.error("ReferenceError", format!("{} is not defined", object))),
        }
    }

    /// Assign a global
    pub fn set(&mut self, name: &str, value: ScriptValue) -> Result<(), JsError> {
        if !self.state.lock().insert_global(name, Global::Value(value)) {
            return Err(self.out_of_memory());
        }
        Ok(())
    }

    /// Define a global object with the given members
    pub fn define_object(&mut self, name: &str, members: Vec<(&str, Member)>) -> Result<(), JsError> {
        let members = members
            .into_iter()
            .map(|(key, member)| (key.to_string(), member))
            .collect();
        if !self.state.lock().insert_global(name, Global::Object(members)) {
            return Err(self.out_of_memory());
        }
        Ok(())
    }

    /// Assign `object.member`
    pub fn set_member(&mut self, object: &str, member: &str, value: Member) -> Result<(), JsError> {
        let mut state = self.state.lock();
        let released = match state.globals.get(object) {
            Some(Global::Object(members)) => members.get(member).map_or(0, member_size),
            Some(_) => {
                return Err(self.error(
                    "TypeError",
                    format!("cannot set property '{}' of {}", member, object),
                ))
            }
            None => return Err(self.error("ReferenceError", format!("{} is not defined", object))),
        };
        if !state.charge(released, member_size(&value)) {
            return Err(self.out_of_memory());
        }
        if let Some(Global::Object(members)) = state.globals.get_mut(object) {
            members.insert(member.to_string(), value);
        }
        Ok(())
    }

    /// `delete globalThis[name]`
    pub fn delete(&mut self, name: &str) -> bool {
        self.state.lock().globals.remove(name).is_some()
    }

    /// Call `object.method(...args)`
    pub fn call(
        &mut self,
        object: &str,
        method: &str,
        args: Vec<ScriptValue>,
    ) -> Result<ScriptValue, JsError> {
        let callable = self.state.lock().callable(object, method);
        match callable {
            Ok(Callable::Script(function)) => self.invoke(&function, args),
            Ok(Callable::Host(host)) => host.call(method, args).map_err(|cause| {
                let name = match cause {
                    BridgeError::Arity { .. } => "RangeError",
                    _ => "InternalError",
                };
                let mut err = self.error(name, cause.to_string());
                err.cause = Some(Box::new(cause));
                err
            }),
            Err(ResolveFailure::NotFound) => {
                Err(self.error("ReferenceError", format!("{} is not defined", object)))
            }
            Err(_) => Err(self.error("TypeError", format!("{}.{} is not a function", object, method))),
        }
    }

    /// Call a script function, pushing its frame
    pub fn invoke(
        &mut self,
        function: &ScriptFunction,
        args: Vec<ScriptValue>,
    ) -> Result<ScriptValue, JsError> {
        self.tick()?;
        {
            let mut state = self.state.lock();
            let max_stack_size = state.limits.max_stack_size;
            if max_stack_size > 0 && ((state.stack_depth + 1) * FRAME_SIZE) as i64 > max_stack_size {
                drop(state);
                return Err(self.error("InternalError", "stack overflow"));
            }
            state.stack_depth += 1;
        }
        self.frames.push(Frame {
            function: function.name.clone(),
            file: function.file.clone(),
            line: function.line,
        });
        let result = (function.body)(self, args);
        self.frames.pop();
        self.state.lock().stack_depth -= 1;
        result
    }
}

#[derive(Serialize, Deserialize)]
struct Bytecode {
    version: u32,
    file_name: String,
    source: String,
}

/// Closure-driven implementation of [`Engine`]
pub struct ScriptedEngine {
    programs: RwLock<HashMap<String, ScriptBody>>,
    contexts: Mutex<HashMap<u64, Arc<Mutex<ContextState>>>>,
    next_context: AtomicU64,
    capacity: Option<usize>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    /// Create an engine with no context limit
    pub fn new() -> Self {
        Self {
            programs: RwLock::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
            next_context: AtomicU64::new(1),
            capacity: None,
        }
    }

    /// Create an engine that runs out of memory after `capacity` live contexts
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Register the program run when `source` is evaluated
    pub fn register<F>(&self, source: impl Into<String>, body: F)
    where
        F: Fn(&mut Js, Vec<ScriptValue>) -> Result<ScriptValue, JsError> + Send + Sync + 'static,
    {
        self.programs.write().insert(source.into(), Arc::new(body));
    }

    /// Number of contexts created and not destroyed
    pub fn live_contexts(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Garbage collections run in a context so far
    pub fn gc_runs(&self, context: RawContext) -> u64 {
        self.context(context).map_or(0, |state| state.lock().gc_runs)
    }

    fn context(&self, context: RawContext) -> Option<Arc<Mutex<ContextState>>> {
        self.contexts.lock().get(&context.get()).cloned()
    }

    fn dead_context() -> ScriptThrow {
        ScriptThrow::new("InternalError: context is not live", "")
    }

    fn run(
        &self,
        state: Arc<Mutex<ContextState>>,
        source: &str,
        file_name: &str,
    ) -> Result<ScriptValue, ScriptThrow> {
        let mut js = Js {
            state,
            frames: vec![Frame {
                function: "<eval>".to_string(),
                file: file_name.to_string(),
                line: 1,
            }],
        };

        let program = self.programs.read().get(source).cloned();
        let result = js.tick().and_then(|()| match program {
            Some(body) => body(&mut js, Vec::new()),
            None => evaluate_expression(&js, source.trim()),
        });
        result.map_err(ScriptThrow::from)
    }

    fn is_known(&self, source: &str) -> bool {
        self.programs.read().contains_key(source) || parse_literal(source.trim()).is_some()
            || is_property_path(source.trim())
    }
}

fn parse_literal(source: &str) -> Option<ScriptValue> {
    match source {
        "undefined" => return Some(ScriptValue::Undefined),
        "null" => return Some(ScriptValue::Null),
        "true" => return Some(ScriptValue::Bool(true)),
        "false" => return Some(ScriptValue::Bool(false)),
        _ => {}
    }
    if let Ok(i) = source.parse::<i32>() {
        return Some(ScriptValue::Int(i));
    }
    if let Ok(f) = source.parse::<f64>() {
        if source.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | 'e' | 'E' | '+')) {
            return Some(ScriptValue::Float(f));
        }
    }
    let quoted = source.len() >= 2
        && ((source.starts_with('"') && source.ends_with('"'))
            || (source.starts_with('\'') && source.ends_with('\'')));
    if quoted {
        return Some(ScriptValue::String(source[1..source.len() - 1].to_string()));
    }
    None
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

fn is_property_path(source: &str) -> bool {
    let mut segments = source.split('.');
    segments.clone().count() <= 2 && segments.all(is_identifier)
}

fn evaluate_expression(js: &Js, source: &str) -> Result<ScriptValue, JsError> {
    if let Some(literal) = parse_literal(source) {
        return Ok(literal);
    }
    if is_property_path(source) {
        return match source.split_once('.') {
            Some((object, member)) => js.get_member(object, member),
            None => js.get(source),
        };
    }
    Err(js.error("SyntaxError", format!("unexpected token in expression: '{}'", source)))
}

impl Engine for ScriptedEngine {
    fn create(&self) -> RawContext {
        let mut contexts = self.contexts.lock();
        if matches!(self.capacity, Some(capacity) if contexts.len() >= capacity) {
            debug!(live = contexts.len(), "Scripted engine at capacity");
            return RawContext::NULL;
        }
        let id = self.next_context.fetch_add(1, Ordering::SeqCst);
        contexts.insert(id, Arc::new(Mutex::new(ContextState::default())));
        RawContext::new(id)
    }

    fn destroy(&self, context: RawContext) {
        self.contexts.lock().remove(&context.get());
    }

    fn evaluate(
        &self,
        context: RawContext,
        source: &str,
        file_name: &str,
    ) -> Result<ScriptValue, ScriptThrow> {
        let state = self.context(context).ok_or_else(Self::dead_context)?;
        self.run(state, source, file_name)
    }

    fn compile(
        &self,
        context: RawContext,
        source: &str,
        file_name: &str,
    ) -> Result<Vec<u8>, ScriptThrow> {
        self.context(context).ok_or_else(Self::dead_context)?;
        if !self.is_known(source) {
            return Err(ScriptThrow::new(
                format!("SyntaxError: unexpected token in expression: '{}'", source.trim()),
                format!("    at <eval> ({}:1)\n", file_name),
            ));
        }
        let bytecode = Bytecode {
            version: BYTECODE_VERSION,
            file_name: file_name.to_string(),
            source: source.to_string(),
        };
        rmp_serde::to_vec_named(&bytecode)
            .map_err(|e| ScriptThrow::new(format!("InternalError: {}", e), ""))
    }

    fn execute(&self, context: RawContext, bytecode: &[u8]) -> Result<ScriptValue, ScriptThrow> {
        let state = self.context(context).ok_or_else(Self::dead_context)?;
        let bytecode: Bytecode = rmp_serde::from_slice(bytecode)
            .map_err(|e| ScriptThrow::new(format!("InternalError: invalid bytecode: {}", e), ""))?;
        if bytecode.version != BYTECODE_VERSION {
            return Err(ScriptThrow::new(
                format!("InternalError: unsupported bytecode version {}", bytecode.version),
                "",
            ));
        }
        self.run(state, &bytecode.source, &bytecode.file_name)
    }

    fn has_global(&self, context: RawContext, name: &str) -> bool {
        self.context(context)
            .map_or(false, |state| state.lock().globals.contains_key(name))
    }

    fn bind_global(
        &self,
        context: RawContext,
        name: &str,
        object: Arc<dyn HostObject>,
    ) -> Result<(), ScriptThrow> {
        let state = self.context(context).ok_or_else(Self::dead_context)?;
        let mut state = state.lock();
        if state.globals.contains_key(name) {
            return Err(ScriptThrow::new(
                format!("InternalError: global {} already exists", name),
                "",
            ));
        }
        if !state.insert_global(name, Global::Host(object)) {
            return Err(ScriptThrow::new(OUT_OF_MEMORY, ""));
        }
        Ok(())
    }

    fn resolve_global(
        &self,
        context: RawContext,
        name: &str,
        method_names: &[String],
    ) -> Result<ProxyId, ResolveFailure> {
        let state = self.context(context).ok_or(ResolveFailure::NotFound)?;
        let mut state = state.lock();
        for method in method_names {
            state.callable(name, method)?;
        }
        if !state.globals.contains_key(name) {
            return Err(ResolveFailure::NotFound);
        }
        if !state.charge(0, PROXY_SIZE) {
            return Err(ResolveFailure::OutOfMemory);
        }
        state.next_proxy += 1;
        let id = state.next_proxy;
        state.proxies.insert(
            id,
            ProxyTarget {
                global: name.to_string(),
                methods: method_names.to_vec(),
            },
        );
        Ok(ProxyId(id))
    }

    fn invoke(
        &self,
        context: RawContext,
        proxy: ProxyId,
        method_index: usize,
        args: Vec<ScriptValue>,
    ) -> Result<ScriptValue, InvokeFailure> {
        let state = self
            .context(context)
            .ok_or_else(|| InvokeFailure::Thrown(Self::dead_context()))?;
        let (method, callable) = {
            let guard = state.lock();
            let target = guard
                .proxies
                .get(&proxy.0)
                .ok_or(InvokeFailure::Unresolved(ResolveFailure::NotFound))?;
            let method = target
                .methods
                .get(method_index)
                .cloned()
                .ok_or(InvokeFailure::Unresolved(ResolveFailure::NotFound))?;
            let callable = guard
                .callable(&target.global, &method)
                .map_err(InvokeFailure::Unresolved)?;
            (method, callable)
        };

        match callable {
            Callable::Script(function) => {
                let mut js = Js {
                    state,
                    frames: Vec::new(),
                };
                js.invoke(&function, args)
                    .map_err(|e| InvokeFailure::Thrown(e.into()))
            }
            Callable::Host(host) => host.call(&method, args).map_err(|cause| {
                InvokeFailure::Thrown(ScriptThrow::new(cause.to_string(), "").with_cause(cause))
            }),
        }
    }

    fn release_proxy(&self, context: RawContext, proxy: ProxyId) {
        if let Some(state) = self.context(context) {
            state.lock().proxies.remove(&proxy.0);
        }
    }

    fn limits(&self, context: RawContext) -> Option<EngineLimits> {
        self.context(context).map(|state| state.lock().limits)
    }

    fn set_limits(&self, context: RawContext, limits: EngineLimits) {
        if let Some(state) = self.context(context) {
            debug!(
                memory_limit = limits.memory_limit,
                gc_threshold = limits.gc_threshold,
                max_stack_size = limits.max_stack_size,
                "Setting context limits"
            );
            state.lock().limits = limits;
        }
    }

    fn memory_usage(&self, context: RawContext) -> Option<MemoryUsage> {
        self.context(context).map(|state| state.lock().memory_usage())
    }

    fn gc(&self, context: RawContext) {
        if let Some(state) = self.context(context) {
            state.lock().collect();
        }
    }

    fn set_interrupt_handler(&self, context: RawContext, handler: Option<Arc<dyn InterruptHandler>>) {
        if let Some(state) = self.context(context) {
            state.lock().interrupt = handler;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(engine: &ScriptedEngine) -> RawContext {
        let raw = engine.create();
        assert!(!raw.is_null());
        raw
    }

    #[test]
    fn test_literals_and_globals() {
        let engine = ScriptedEngine::new();
        let ctx = context(&engine);
        engine.register("var x = 'hi'", |js, _| {
            js.set("x", "hi".into())?;
            Ok(ScriptValue::Undefined)
        });
        engine.evaluate(ctx, "var x = 'hi'", "a.js").unwrap();
        assert_eq!(engine.evaluate(ctx, "x", "a.js").unwrap(), ScriptValue::from("hi"));
        assert_eq!(engine.evaluate(ctx, "1.5", "a.js").unwrap(), ScriptValue::Float(1.5));
        assert_eq!(engine.evaluate(ctx, "'s'", "a.js").unwrap(), ScriptValue::from("s"));
    }

    #[test]
    fn test_reference_error() {
        let engine = ScriptedEngine::new();
        let ctx = context(&engine);
        let err = engine.evaluate(ctx, "nope", "a.js").unwrap_err();
        assert_eq!(err.message, "ReferenceError: nope is not defined");
        assert_eq!(err.stack, "    at <eval> (a.js:1)\n");
    }

    #[test]
    fn test_frames_in_stack_text() {
        let engine = ScriptedEngine::new();
        let ctx = context(&engine);
        let inner = ScriptFunction::new("inner", "t.js", 7, |js, _| {
            js.at(8);
            js.throw("bad")
        });
        engine.register("run()", move |js, _| {
            js.at(3);
            js.invoke(&inner, vec![])
        });
        let err = engine.evaluate(ctx, "run()", "t.js").unwrap_err();
        assert_eq!(err.message, "Error: bad");
        assert_eq!(err.stack, "    at inner (t.js:8)\n    at <eval> (t.js:3)\n");
    }

    #[test]
    fn test_compile_and_execute() {
        let engine = ScriptedEngine::new();
        let ctx = context(&engine);
        let bytecode = engine.compile(ctx, "42", "n.js").unwrap();
        assert_eq!(engine.execute(ctx, &bytecode).unwrap(), ScriptValue::Int(42));
        assert!(engine.compile(ctx, "1 +", "n.js").is_err());
        assert!(engine.execute(ctx, b"garbage").is_err());
    }

    #[test]
    fn test_resolve_and_invoke_by_name() {
        let engine = ScriptedEngine::new();
        let ctx = context(&engine);
        engine.register("setup", |js, _| {
            js.define_object(
                "value",
                vec![
                    ("get", Member::Function(ScriptFunction::new("get", "v.js", 1, |_, _| Ok(1.into())))),
                    ("field", Member::Value(2.into())),
                ],
            )?;
            Ok(ScriptValue::Undefined)
        });
        engine.evaluate(ctx, "setup", "v.js").unwrap();

        let names = |n: &[&str]| n.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            engine.resolve_global(ctx, "value", &names(&["missing"])),
            Err(ResolveFailure::MissingMethod("missing".into()))
        );
        assert_eq!(
            engine.resolve_global(ctx, "value", &names(&["field"])),
            Err(ResolveFailure::NotCallable("field".into()))
        );
        assert_eq!(
            engine.resolve_global(ctx, "other", &names(&["get"])),
            Err(ResolveFailure::NotFound)
        );

        let proxy = engine.resolve_global(ctx, "value", &names(&["get"])).unwrap();
        assert_eq!(engine.invoke(ctx, proxy, 0, vec![]).unwrap(), ScriptValue::Int(1));
        engine.release_proxy(ctx, proxy);
        assert!(matches!(
            engine.invoke(ctx, proxy, 0, vec![]),
            Err(InvokeFailure::Unresolved(ResolveFailure::NotFound))
        ));
    }

    #[test]
    fn test_memory_limit_throws_out_of_memory() {
        let engine = ScriptedEngine::new();
        let ctx = context(&engine);
        let limit = (CONTEXT_BASE_SIZE + 1024) as i64;
        engine.set_limits(
            ctx,
            EngineLimits {
                memory_limit: limit,
                ..EngineLimits::default()
            },
        );
        engine.register("small", |js, _| {
            js.set("small", "x".into())?;
            Ok(ScriptValue::Undefined)
        });
        engine.register("big", |js, _| {
            js.set("big", ScriptValue::Bytes(vec![0; 4096]))?;
            Ok(ScriptValue::Undefined)
        });
        engine.evaluate(ctx, "small", "m.js").unwrap();
        let err = engine.evaluate(ctx, "big", "m.js").unwrap_err();
        assert_eq!(err.message, OUT_OF_MEMORY);
        assert!(!engine.has_global(ctx, "big"));

        let usage = engine.memory_usage(ctx).unwrap();
        assert_eq!(usage.memory_allocated_limit, limit);
        assert!(usage.memory_used_size <= limit);
    }

    #[test]
    fn test_proxy_allocation_respects_limit() {
        let engine = ScriptedEngine::new();
        let ctx = context(&engine);
        engine.register("setup", |js, _| {
            let get = ScriptFunction::new("get", "v.js", 1, |_, _| Ok(1.into()));
            js.define_object("value", vec![("get", Member::Function(get))])?;
            Ok(ScriptValue::Undefined)
        });
        engine.evaluate(ctx, "setup", "v.js").unwrap();
        let used = engine.memory_usage(ctx).unwrap().memory_used_size;
        engine.set_limits(
            ctx,
            EngineLimits {
                memory_limit: used,
                ..EngineLimits::default()
            },
        );
        assert_eq!(
            engine.resolve_global(ctx, "value", &["get".to_string()]),
            Err(ResolveFailure::OutOfMemory)
        );
    }

    #[test]
    fn test_memory_usage_counts() {
        let engine = ScriptedEngine::new();
        let ctx = context(&engine);
        let before = engine.memory_usage(ctx).unwrap();
        assert!(before.memory_allocated_count > 0);
        assert!(before.memory_used_size > 0 && before.memory_used_size <= before.memory_allocated_size);
        assert_eq!(before.memory_allocated_limit, -1);

        engine.register("define", |js, _| {
            js.set("hello", "hello".into())?;
            let f = ScriptFunction::new("hypotenuse", "h.js", 1, |_, _| Ok(5.into()));
            js.define_object("geometry", vec![("hypotenuse", Member::Function(f))])?;
            Ok(ScriptValue::Undefined)
        });
        engine.evaluate(ctx, "define", "h.js").unwrap();
        let after = engine.memory_usage(ctx).unwrap();
        assert_eq!(after.properties_count - before.properties_count, 3);
        assert_eq!(after.js_functions_count - before.js_functions_count, 1);
        assert_eq!(after.strings_count - before.strings_count, 1);
        assert!(after.memory_used_size > before.memory_used_size);
    }

    #[test]
    fn test_gc_threshold() {
        let engine = ScriptedEngine::new();
        let ctx = context(&engine);
        engine.set_limits(
            ctx,
            EngineLimits {
                gc_threshold: 1024,
                ..EngineLimits::default()
            },
        );
        engine.register("fill", |js, _| {
            for i in 0..8 {
                js.set(&format!("chunk{}", i), ScriptValue::Bytes(vec![0; 512]))?;
            }
            Ok(ScriptValue::Undefined)
        });
        engine.evaluate(ctx, "fill", "gc.js").unwrap();
        let runs = engine.gc_runs(ctx);
        assert!(runs >= 3, "{runs}");

        engine.gc(ctx);
        assert_eq!(engine.gc_runs(ctx), runs + 1);

        engine.set_limits(
            ctx,
            EngineLimits {
                gc_threshold: -1,
                ..EngineLimits::default()
            },
        );
        engine.evaluate(ctx, "fill", "gc.js").unwrap();
        assert_eq!(engine.gc_runs(ctx), runs + 1);
    }

    fn define_recursion(engine: &ScriptedEngine) {
        engine.register("recurse", |js, _| {
            let go = ScriptFunction::new("go", "r.js", 2, |js, _| js.call("rec", "go", vec![]));
            js.define_object("rec", vec![("go", Member::Function(go))])?;
            js.call("rec", "go", vec![])
        });
    }

    #[test]
    fn test_max_stack_size() {
        let engine = ScriptedEngine::new();
        let ctx = context(&engine);
        engine.set_limits(
            ctx,
            EngineLimits {
                max_stack_size: (8 * FRAME_SIZE) as i64,
                ..EngineLimits::default()
            },
        );
        define_recursion(&engine);
        let err = engine.evaluate(ctx, "recurse", "r.js").unwrap_err();
        assert_eq!(err.message, "InternalError: stack overflow");
        assert_eq!(err.stack.lines().filter(|l| l.contains("at go")).count(), 8);

        // The depth unwinds with the error
        let again = engine.evaluate(ctx, "recurse", "r.js").unwrap_err();
        assert_eq!(again.stack, err.stack);
    }

    #[test]
    fn test_interrupt_handler_stops_script() {
        let engine = ScriptedEngine::new();
        let ctx = context(&engine);
        let polls = Arc::new(AtomicU64::new(0));
        let counter = polls.clone();
        engine.set_interrupt_handler(
            ctx,
            Some(Arc::new(move || counter.fetch_add(1, Ordering::SeqCst) >= 4)),
        );
        engine.register("spin", |js, _| loop {
            js.tick()?;
        });
        let err = engine.evaluate(ctx, "spin", "spin.js").unwrap_err();
        assert!(err.message.starts_with("InternalError: interrupted"), "{}", err.message);
        assert_eq!(polls.load(Ordering::SeqCst), 5);

        engine.set_interrupt_handler(ctx, None);
        assert_eq!(engine.evaluate(ctx, "1", "spin.js").unwrap(), ScriptValue::Int(1));
    }

    #[test]
    fn test_interrupt_polls_are_not_reentrant() {
        let engine = Arc::new(ScriptedEngine::new());
        let ctx = context(&engine);
        engine.register("work", |js, _| {
            for _ in 0..3 {
                js.tick()?;
            }
            Ok(ScriptValue::Undefined)
        });
        let polls = Arc::new(AtomicU64::new(0));
        let (inner_engine, counter) = (engine.clone(), polls.clone());
        engine.set_interrupt_handler(
            ctx,
            Some(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                inner_engine.evaluate(ctx, "work", "poll.js").is_err()
            })),
        );
        engine.evaluate(ctx, "work", "work.js").unwrap();
        // One poll on entry and one per tick; the handler's own script adds none
        assert_eq!(polls.load(Ordering::SeqCst), 4);
        engine.set_interrupt_handler(ctx, None);
    }

    #[test]
    fn test_capacity() {
        let engine = ScriptedEngine::with_capacity(1);
        let ctx = context(&engine);
        assert!(engine.create().is_null());
        engine.destroy(ctx);
        assert_eq!(engine.live_contexts(), 0);
        assert!(!engine.create().is_null());
    }
}
