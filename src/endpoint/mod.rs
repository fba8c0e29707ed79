//! Service endpoints.
//!
//! An [`Endpoint`] binds services for the other side to call and takes
//! services the other side bound. Calls cross a [`CallChannel`] as JSON text:
//! one channel per direction, each answering synchronously. Suspending calls
//! answer with a cancel callback and complete later through a suspend
//! callback, both of which are temporary services named
//! `<pass-by-reference prefix><n>`.
//!
//! ```text
//!   Endpoint A                                Endpoint B
//!  ┌──────────────┐  call(json) -> json   ┌──────────────┐
//!  │ outbound ────┼──────────────────────►│ inbound      │
//!  │              │                       │  services    │
//!  │ inbound   ◄──┼───────────────────────┼── outbound   │
//!  └──────────────┘                       └──────────────┘
//! ```

mod call;
mod function;
mod inbound;
mod listener;
mod outbound;
mod reference;
mod scope;
pub mod script;

pub use call::{longs, EncodedCall, EncodedResult, ThrowableSurrogate};
pub use function::{
    signature_id, CallFuture, ServiceAdapter, ServiceFunction, ServiceType, ServiceTypeInfo, Signature,
    CLOSE_SIGNATURE, SIGNATURE_ID_BYTES,
};
pub use listener::{Call, CallOutcome, CallResult, EventListener, NoopListener};
pub use outbound::OutboundCallHandler;
pub use reference::ServiceReference;
pub use scope::ServiceScope;

use crate::config::EndpointConfig;
use crate::error::{BridgeError, Result};
use call::{encode_failure, mismatch_failure, UNKNOWN_FUNCTION, UNKNOWN_SERVICE};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use inbound::{CancelCallback, InboundHandler, InboundService, Invocation, SUSPEND_FAILURE, SUSPEND_SUCCESS};
use parking_lot::RwLock;
use scope::WeakScope;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// One direction of an endpoint connection
pub trait CallChannel: Send + Sync {
    /// Names of the services bound on the receiving side
    fn service_names(&self) -> Vec<String>;

    /// Function table of a bound service
    fn service_type(&self, name: &str) -> Option<ServiceTypeInfo>;

    /// Deliver an encoded call and return the encoded result
    fn call(&self, encoded_call: &str) -> String;

    /// Remove a bound service; returns whether it existed
    fn disconnect(&self, name: &str) -> bool;
}

pub(crate) struct EndpointInner {
    pub(crate) config: EndpointConfig,
    pub(crate) listener: Arc<dyn EventListener>,
    inbound: DashMap<String, Arc<dyn InboundHandler>>,
    bound_scopes: DashMap<String, WeakScope>,
    outbound: RwLock<Option<Arc<dyn CallChannel>>>,
    next_reference: AtomicU64,
    next_handler: AtomicU64,
    closed: AtomicBool,
}

impl EndpointInner {
    /// Fresh name for a pass-by-reference service
    pub(crate) fn generate_name(&self) -> String {
        let n = self.next_reference.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}{}", self.config.pass_by_reference_prefix, n)
    }

    pub(crate) fn insert_inbound(&self, name: &str, handler: Arc<dyn InboundHandler>) {
        self.inbound.insert(name.to_string(), handler);
    }

    pub(crate) fn remove_inbound(&self, name: &str) -> bool {
        self.bound_scopes.remove(name);
        self.inbound.remove(name).is_some()
    }

    pub(crate) fn bind_service<A: ServiceAdapter>(&self, name: &str, service: Arc<A::Service>, adapter: &A) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Closed("endpoint is closed".to_string()));
        }
        let (service_type, functions) = function::service_type(adapter)?;
        match self.inbound.entry(name.to_string()) {
            Entry::Occupied(_) => {
                return Err(BridgeError::DuplicateName {
                    name: name.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(InboundService::new(service, service_type, functions)));
            }
        }
        self.listener.bind_service(name);
        debug!(name, "Bound service");
        Ok(())
    }

    /// Scope that references received by calls to `service` are taken into
    fn take_scope(&self, service: &str) -> Option<ServiceScope> {
        self.bound_scopes.get(service)?.upgrade()
    }

    fn channel(&self) -> Result<Arc<dyn CallChannel>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Closed("endpoint is closed".to_string()));
        }
        self.outbound
            .read()
            .clone()
            .ok_or_else(|| BridgeError::Closed("endpoint is not connected".to_string()))
    }

    /// Send one call to the other side
    pub(crate) fn send(&self, call: &EncodedCall, function: &Signature, report: bool) -> Result<EncodedResult> {
        let channel = self.channel()?;
        let encoded = serde_json::to_string(call)?;
        let info = report.then(|| Call {
            service_name: call.service.clone(),
            function: function.clone(),
            inbound: false,
            encoded_call: encoded.clone(),
        });
        if let Some(info) = &info {
            self.listener.call_start(info);
        }

        let started = Instant::now();
        let response = channel.call(&encoded);
        let decoded = serde_json::from_str::<EncodedResult>(&response).map_err(BridgeError::from);

        if let Some(info) = &info {
            let outcome = match &decoded {
                Ok(result) => outcome_of(result),
                Err(err) => CallOutcome::Failure(err.code().to_string()),
            };
            self.listener.call_end(
                info,
                &CallResult {
                    outcome,
                    encoded_result: response,
                    elapsed: started.elapsed(),
                },
            );
        }
        decoded
    }

    /// Decode a failure, explaining routing misses with what the other side offers
    pub(crate) fn decode_failure(&self, service: &str, function: &Signature, failure: &ThrowableSurrogate) -> BridgeError {
        let marker = |m: &str| failure.types.iter().any(|t| t == m);
        if marker(UNKNOWN_SERVICE) {
            let available = self
                .channel()
                .map(|c| c.service_names())
                .unwrap_or_default();
            return BridgeError::ApiMismatch(format!(
                "no such service (service closed?)\n\tcalled service:\n\t\t{}\n\tavailable services:\n\t\t{}",
                service,
                available.join("\n\t\t")
            ));
        }
        if marker(UNKNOWN_FUNCTION) {
            let available = self
                .channel()
                .ok()
                .and_then(|c| c.service_type(service))
                .map(|info| info.functions)
                .unwrap_or_default();
            return BridgeError::ApiMismatch(format!(
                "no such method (incompatible API versions?)\n\tcalled service:\n\t\t{}\n\tcalled function:\n\t\t{}\n\tavailable functions:\n\t\t{}",
                service,
                function.descriptor(),
                available.join("\n\t\t")
            ));
        }
        call::decode_failure(failure)
    }

    /// Answer one call from the other side
    fn dispatch(self: &Arc<Self>, encoded: &str) -> String {
        let started = Instant::now();
        let (result, info) = self.route(encoded);
        let text = match serde_json::to_string(&result) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "Failed to encode call result");
                r#"{"failure":{"types":["SERIALIZATION"],"stacktraceString":"SERIALIZATION: result could not be encoded"}}"#
                    .to_string()
            }
        };
        if let Some(info) = info {
            self.listener.call_end(
                &info,
                &CallResult {
                    outcome: outcome_of(&result),
                    encoded_result: text.clone(),
                    elapsed: started.elapsed(),
                },
            );
        }
        text
    }

    fn route(self: &Arc<Self>, encoded: &str) -> (EncodedResult, Option<Call>) {
        let failure = |err: BridgeError| (EncodedResult::Failure(encode_failure(&err)), None);
        if self.closed.load(Ordering::SeqCst) {
            return failure(BridgeError::Closed("endpoint is closed".to_string()));
        }
        let call: EncodedCall = match serde_json::from_str(encoded) {
            Ok(call) => call,
            Err(err) => return failure(err.into()),
        };

        let Some(handler) = self.inbound.get(&call.service).map(|h| h.value().clone()) else {
            let message = format!("no such service {}", call.service);
            return (EncodedResult::Failure(mismatch_failure(UNKNOWN_SERVICE, message)), None);
        };
        let Some(function) = handler.service_type().function(&call.function).cloned() else {
            let message = format!("no such function {} in {}", call.function, call.service);
            return (EncodedResult::Failure(mismatch_failure(UNKNOWN_FUNCTION, message)), None);
        };
        let scope = self.take_scope(&call.service);
        if function.is_close() || handler.is_internal() {
            self.remove_inbound(&call.service);
        }
        if call.args.len() != function.arity() {
            return failure(BridgeError::arity(
                function.descriptor(),
                function.arity().to_string(),
                call.args.len(),
            ));
        }

        let info = (!handler.is_internal()).then(|| Call {
            service_name: call.service.clone(),
            function: function.clone(),
            inbound: true,
            encoded_call: encoded.to_string(),
        });
        if let Some(info) = &info {
            self.listener.call_start(info);
        }

        let invocation = reference::within(self, scope.clone(), || handler.invoke(&function, call.args));
        let result = match invocation {
            Invocation::Done(result) => EncodedResult::from_result(result),
            Invocation::Pending(future) => match call.callback {
                Some(callback) => match self.launch(callback, future, scope) {
                    Ok(cancel_name) => EncodedResult::CancelCallback(cancel_name),
                    Err(err) => EncodedResult::Failure(encode_failure(&err)),
                },
                None => EncodedResult::Failure(encode_failure(&BridgeError::Serialization(format!(
                    "{} was called without a callback",
                    function.descriptor()
                )))),
            },
        };
        (result, info)
    }

    /// Run a suspended call and report its result to `callback`
    fn launch(self: &Arc<Self>, callback: String, future: CallFuture, scope: Option<ServiceScope>) -> Result<String> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| BridgeError::Closed("suspending calls need a running tokio runtime".to_string()))?;

        let cancel_name = self.generate_name();
        let cancel = Arc::new(CancelCallback::new());
        self.insert_inbound(&cancel_name, cancel.clone());

        let endpoint = Arc::downgrade(self);
        let future = reference::WithinCall::new(future, endpoint.clone(), scope);
        let key = cancel_name.clone();
        let task = runtime.spawn(async move {
            let result = future.await;
            if let Some(endpoint) = endpoint.upgrade() {
                endpoint.remove_inbound(&key);
                endpoint.complete_remote(&callback, result);
            }
        });
        cancel.attach(task.abort_handle());
        Ok(cancel_name)
    }

    fn complete_remote(&self, callback: &str, result: Result<Value>) {
        let (function, args) = match result {
            Ok(value) => (&*SUSPEND_SUCCESS, vec![value]),
            Err(err) => (
                &*SUSPEND_FAILURE,
                vec![serde_json::to_value(encode_failure(&err)).unwrap_or(Value::Null)],
            ),
        };
        let call = EncodedCall {
            service: callback.to_string(),
            function: function.id().to_string(),
            callback: None,
            args,
        };
        match self.send(&call, function, false) {
            Ok(EncodedResult::Failure(failure)) => {
                debug!(callback, types = ?failure.types, "Suspended call result was not accepted")
            }
            Err(err) => debug!(callback, error = %err, "Suspended call result was not delivered"),
            Ok(_) => {}
        }
    }
}

fn outcome_of(result: &EncodedResult) -> CallOutcome {
    match result {
        EncodedResult::Success(_) => CallOutcome::Success,
        EncodedResult::Failure(failure) => {
            CallOutcome::Failure(failure.types.first().cloned().unwrap_or_default())
        }
        EncodedResult::CancelCallback(_) => CallOutcome::Suspended,
    }
}

/// Inbound side of an endpoint as seen by the other side
struct EndpointChannel {
    endpoint: Weak<EndpointInner>,
}

impl CallChannel for EndpointChannel {
    fn service_names(&self) -> Vec<String> {
        self.endpoint
            .upgrade()
            .map(|e| sorted_names(&e))
            .unwrap_or_default()
    }

    fn service_type(&self, name: &str) -> Option<ServiceTypeInfo> {
        let endpoint = self.endpoint.upgrade()?;
        let handler = endpoint.inbound.get(name)?;
        Some(handler.service_type().info())
    }

    fn call(&self, encoded_call: &str) -> String {
        match self.endpoint.upgrade() {
            Some(endpoint) => endpoint.dispatch(encoded_call),
            None => {
                let failure = encode_failure(&BridgeError::Closed("endpoint is closed".to_string()));
                serde_json::to_string(&EncodedResult::Failure(failure)).unwrap_or_default()
            }
        }
    }

    fn disconnect(&self, name: &str) -> bool {
        self.endpoint
            .upgrade()
            .map(|e| e.remove_inbound(name))
            .unwrap_or(false)
    }
}

fn take_service<A: ServiceAdapter>(
    endpoint: &Arc<EndpointInner>,
    name: &str,
    adapter: &A,
    scope: Option<&ServiceScope>,
) -> Result<A::Outbound> {
    let (service_type, _) = function::service_type(adapter)?;
    let id = endpoint.next_handler.fetch_add(1, Ordering::SeqCst);
    let weak = scope.map(ServiceScope::downgrade).unwrap_or_default();
    let handler = OutboundCallHandler::new(id, name, service_type, endpoint.clone(), weak);
    if let Some(scope) = scope {
        if let Err(err) = scope.add_handler(handler.clone()) {
            handler.discard();
            return Err(err);
        }
    }
    endpoint.listener.take_service(name);
    debug!(name, service_type = adapter.serial_name(), "Took service");
    Ok(adapter.outbound_service(handler))
}

fn sorted_names(endpoint: &EndpointInner) -> Vec<String> {
    let mut names: Vec<String> = endpoint.inbound.iter().map(|e| e.key().clone()).collect();
    names.sort();
    names
}

/// One side of a service connection
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    /// Create an unconnected endpoint
    pub fn new(config: EndpointConfig) -> Result<Self> {
        Self::with_listener(config, Arc::new(NoopListener))
    }

    /// Create an unconnected endpoint reporting to `listener`
    pub fn with_listener(config: EndpointConfig, listener: Arc<dyn EventListener>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EndpointInner {
                config,
                listener,
                inbound: DashMap::new(),
                bound_scopes: DashMap::new(),
                outbound: RwLock::new(None),
                next_reference: AtomicU64::new(0),
                next_handler: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Options this endpoint was created with
    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    /// Send outbound calls through `channel`
    pub fn connect(&self, channel: Arc<dyn CallChannel>) {
        *self.inner.outbound.write() = Some(channel);
    }

    /// The channel the other side calls this endpoint through
    pub fn inbound_channel(&self) -> Arc<dyn CallChannel> {
        Arc::new(EndpointChannel {
            endpoint: Arc::downgrade(&self.inner),
        })
    }

    /// Bind `service` for the other side to call under `name`
    #[instrument(skip(self, service, adapter), fields(service_type = adapter.serial_name()))]
    pub fn bind<A: ServiceAdapter>(&self, name: &str, service: Arc<A::Service>, adapter: &A) -> Result<()> {
        self.inner.bind_service(name, service, adapter)
    }

    /// Bind `service` and remove it again when `scope` closes. Services
    /// passed by reference to it are taken into `scope` as well.
    pub fn bind_scoped<A: ServiceAdapter>(
        &self,
        name: &str,
        service: Arc<A::Service>,
        adapter: &A,
        scope: &ServiceScope,
    ) -> Result<()> {
        if scope.is_closed() {
            return Err(BridgeError::Closed(format!("cannot bind {} in a closed scope", name)));
        }
        self.bind(name, service, adapter)?;
        if let Err(err) = scope.add_binding(&self.inner, name) {
            self.inner.remove_inbound(name);
            return Err(err);
        }
        self.inner.bound_scopes.insert(name.to_string(), scope.downgrade());
        Ok(())
    }

    /// Take the service the other side bound under `name`
    pub fn take<A: ServiceAdapter>(&self, name: &str, adapter: &A) -> Result<A::Outbound> {
        take_service(&self.inner, name, adapter, None)
    }

    /// Take a service that closes when `scope` closes
    pub fn take_scoped<A: ServiceAdapter>(&self, name: &str, adapter: &A, scope: &ServiceScope) -> Result<A::Outbound> {
        take_service(&self.inner, name, adapter, Some(scope))
    }

    /// Remove a bound service; returns whether it existed
    pub fn remove(&self, name: &str) -> bool {
        self.inner.remove_inbound(name)
    }

    /// Names of services bound on this endpoint, including temporary callbacks
    pub fn service_names(&self) -> Vec<String> {
        sorted_names(&self.inner)
    }

    /// Names of services bound on the other side
    pub fn remote_service_names(&self) -> Result<Vec<String>> {
        Ok(self.inner.channel()?.service_names())
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Drop every bound service, cancel running inbound calls and disconnect.
    /// Calling this twice is harmless.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handlers: Vec<_> = self.inner.inbound.iter().map(|e| e.value().clone()).collect();
        self.inner.inbound.clear();
        self.inner.bound_scopes.clear();
        for handler in &handlers {
            handler.shutdown();
        }
        *self.inner.outbound.write() = None;
        info!(services = handlers.len(), "Endpoint closed");
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("services", &self.service_names())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Connect two endpoints to each other
pub fn connect_pair(a: &Endpoint, b: &Endpoint) {
    a.connect(b.inbound_channel());
    b.connect(a.inbound_channel());
}

/// Two endpoints connected to each other in memory
pub fn endpoint_pair(config: EndpointConfig) -> Result<(Endpoint, Endpoint)> {
    let a = Endpoint::new(config.clone())?;
    let b = Endpoint::new(config)?;
    connect_pair(&a, &b);
    Ok((a, b))
}
