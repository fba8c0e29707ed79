//! Calls to services of the other side.

use super::call::{EncodedCall, EncodedResult};
use super::function::{encode_args, ServiceType, Signature};
use super::inbound::{SuspendCallback, CANCEL};
use super::reference;
use super::scope::WeakScope;
use super::EndpointInner;
use crate::error::{BridgeError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct HandlerState {
    id: u64,
    service_name: String,
    service_type: ServiceType,
    endpoint: Arc<EndpointInner>,
    scope: WeakScope,
    closed: AtomicBool,
}

impl Drop for HandlerState {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.endpoint.listener.service_leaked(&self.service_name);
        if self.endpoint.config.leak_warnings {
            warn!(
                service = %self.service_name,
                service_type = %self.service_type.name(),
                "Service dropped without being closed"
            );
        }
    }
}

/// Sends calls to one service taken from the other side.
///
/// Generated outbound proxies wrap one of these and address functions by
/// their index in the adapter's function list. Clones share one service;
/// closing any clone closes all of them.
#[derive(Clone)]
pub struct OutboundCallHandler {
    state: Arc<HandlerState>,
}

impl OutboundCallHandler {
    pub(crate) fn new(
        id: u64,
        service_name: &str,
        service_type: ServiceType,
        endpoint: Arc<EndpointInner>,
        scope: WeakScope,
    ) -> Self {
        Self {
            state: Arc::new(HandlerState {
                id,
                service_name: service_name.to_string(),
                service_type,
                endpoint,
                scope,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn handler_id(&self) -> u64 {
        self.state.id
    }

    /// Name the service was taken under
    pub fn service_name(&self) -> &str {
        &self.state.service_name
    }

    /// Function table of the service
    pub fn service_type(&self) -> &ServiceType {
        &self.state.service_type
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Mark closed without telling the other side
    pub(crate) fn discard(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    fn function(&self, index: usize) -> Result<Signature> {
        let function = self
            .state
            .service_type
            .functions()
            .get(index)
            .cloned()
            .ok_or_else(|| {
                BridgeError::Shape(format!(
                    "{} has no function at index {}",
                    self.state.service_type.name(),
                    index
                ))
            })?;
        if self.is_closed() {
            return Err(BridgeError::Closed(format!(
                "{} {} is closed, failed to call:\n  {}",
                self.state.service_type.name(),
                self.state.service_name,
                function.descriptor()
            )));
        }
        Ok(function)
    }

    fn encode<A: Serialize>(&self, function: &Signature, args: &A, callback: Option<String>) -> Result<EncodedCall> {
        let args = reference::within(&self.state.endpoint, self.state.scope.upgrade(), || encode_args(args))?;
        if args.len() != function.arity() {
            return Err(BridgeError::arity(
                function.descriptor(),
                function.arity().to_string(),
                args.len(),
            ));
        }
        Ok(EncodedCall {
            service: self.state.service_name.clone(),
            function: function.id().to_string(),
            callback,
            args,
        })
    }

    /// Decode a result; service references in it are taken into this
    /// handler's scope
    fn decode<R: DeserializeOwned>(&self, function: &Signature, value: Value) -> Result<R> {
        reference::within(&self.state.endpoint, self.state.scope.upgrade(), || decode_result(function, value))
    }

    /// Call a returning function
    pub fn call<A, R>(&self, index: usize, args: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let function = self.function(index)?;
        let call = self.encode(&function, &args, None)?;
        if function.is_close() {
            self.close();
            return self.decode(&function, Value::Null);
        }

        let endpoint = &self.state.endpoint;
        match endpoint.send(&call, &function, true)? {
            EncodedResult::Success(value) => self.decode(&function, value),
            EncodedResult::Failure(failure) => Err(endpoint.decode_failure(&call.service, &function, &failure)),
            EncodedResult::CancelCallback(_) => Err(BridgeError::Serialization(format!(
                "{} answered a returning call as suspended",
                self.state.service_name
            ))),
        }
    }

    /// Call a suspending function and await its result.
    ///
    /// Dropping the returned future before it completes cancels the call on
    /// the other side.
    pub async fn call_suspending<A, R>(&self, index: usize, args: A) -> Result<R>
    where
        A: Serialize + Send,
        R: DeserializeOwned,
    {
        let function = self.function(index)?;
        let endpoint = self.state.endpoint.clone();
        let callback_name = endpoint.generate_name();
        let call = self.encode(&function, &args, Some(callback_name.clone()))?;

        let (sender, receiver) = oneshot::channel();
        endpoint.insert_inbound(&callback_name, Arc::new(SuspendCallback::new(sender)));

        let response = match endpoint.send(&call, &function, true) {
            Ok(response) => response,
            Err(err) => {
                endpoint.remove_inbound(&callback_name);
                return Err(err);
            }
        };

        match response {
            EncodedResult::CancelCallback(cancel_name) => {
                let mut guard = CancelGuard {
                    endpoint: endpoint.clone(),
                    callback_name,
                    cancel_name,
                    armed: true,
                };
                let outcome = receiver.await;
                guard.armed = false;
                match outcome {
                    Ok(Ok(value)) => self.decode(&function, value),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(BridgeError::Cancelled {
                        function: function.descriptor().to_string(),
                    }),
                }
            }
            EncodedResult::Success(value) => {
                endpoint.remove_inbound(&callback_name);
                self.decode(&function, value)
            }
            EncodedResult::Failure(failure) => {
                endpoint.remove_inbound(&callback_name);
                Err(endpoint.decode_failure(&call.service, &function, &failure))
            }
        }
    }

    /// Close the service. The other side's `close()` runs if the service
    /// declares one. Calling this twice is harmless.
    pub fn close(&self) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.scope.remove_handler(self.state.id);
        debug!(service = %self.state.service_name, "Closing outbound service");

        let Some(close) = self
            .state
            .service_type
            .functions()
            .iter()
            .find(|f| f.is_close())
        else {
            return;
        };
        let call = EncodedCall {
            service: self.state.service_name.clone(),
            function: close.id().to_string(),
            callback: None,
            args: Vec::new(),
        };
        match self.state.endpoint.send(&call, close, true) {
            Ok(EncodedResult::Failure(failure)) => {
                debug!(service = %self.state.service_name, types = ?failure.types, "Remote close failed")
            }
            Err(err) => debug!(service = %self.state.service_name, error = %err, "Remote close failed"),
            Ok(_) => {}
        }
    }
}

impl fmt::Debug for OutboundCallHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundCallHandler")
            .field("service_name", &self.state.service_name)
            .field("service_type", &self.state.service_type.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn decode_result<R: DeserializeOwned>(function: &Signature, value: Value) -> Result<R> {
    serde_json::from_value(value).map_err(|e| BridgeError::Marshal {
        message: format!("cannot decode result of {}: {}", function.descriptor(), e),
    })
}

/// Cancels a pending suspending call when its future is dropped
struct CancelGuard {
    endpoint: Arc<EndpointInner>,
    callback_name: String,
    cancel_name: String,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.endpoint.remove_inbound(&self.callback_name);
        warn!(callback = %self.cancel_name, "Cancelling suspended call");
        let call = EncodedCall {
            service: self.cancel_name.clone(),
            function: CANCEL.id().to_string(),
            callback: None,
            args: Vec::new(),
        };
        if let Err(err) = self.endpoint.send(&call, &CANCEL, false) {
            debug!(callback = %self.cancel_name, error = %err, "Cancel was not delivered");
        }
    }
}
