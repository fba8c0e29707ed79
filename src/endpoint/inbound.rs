//! Services this endpoint answers calls for.

use super::call::{decode_failure, ThrowableSurrogate};
use super::function::{CallFuture, FunctionBody, ServiceFunction, ServiceType, Signature};
use crate::error::{BridgeError, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// `success` of a suspend callback
pub(crate) static SUSPEND_SUCCESS: Lazy<Signature> =
    Lazy::new(|| Signature::builtin("fun success(Any?): Unit", "success", 1));

/// `failure` of a suspend callback
pub(crate) static SUSPEND_FAILURE: Lazy<Signature> =
    Lazy::new(|| Signature::builtin("fun failure(Throwable): Unit", "failure", 1));

/// `cancel` of a cancel callback
pub(crate) static CANCEL: Lazy<Signature> =
    Lazy::new(|| Signature::builtin("fun cancel(): Unit", "cancel", 0));

/// What invoking an inbound function produced
pub(crate) enum Invocation {
    /// The call completed
    Done(Result<Value>),
    /// The call suspended; the future yields its result
    Pending(CallFuture),
}

/// Anything the endpoint can route an inbound call to
pub(crate) trait InboundHandler: Send + Sync {
    fn service_type(&self) -> &ServiceType;

    fn invoke(&self, function: &Signature, args: Vec<Value>) -> Invocation;

    /// Internal handlers are one-shot and invisible to listeners
    fn is_internal(&self) -> bool {
        false
    }

    /// The endpoint is closing
    fn shutdown(&self) {}
}

/// A user service bound through its adapter
pub(crate) struct InboundService<S: ?Sized> {
    service: Arc<S>,
    service_type: ServiceType,
    functions: HashMap<String, ServiceFunction<S>>,
}

impl<S: ?Sized + Send + Sync + 'static> InboundService<S> {
    pub(crate) fn new(service: Arc<S>, service_type: ServiceType, functions: Vec<ServiceFunction<S>>) -> Self {
        let functions = service_type
            .functions()
            .iter()
            .map(|sig| sig.id().to_string())
            .zip(functions)
            .collect();
        Self {
            service,
            service_type,
            functions,
        }
    }
}

impl<S: ?Sized + Send + Sync + 'static> InboundHandler for InboundService<S> {
    fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    fn invoke(&self, function: &Signature, args: Vec<Value>) -> Invocation {
        let Some(entry) = self.functions.get(function.id()) else {
            return Invocation::Done(Err(BridgeError::ApiMismatch(format!(
                "{} has no function {}",
                self.service_type.name(),
                function.descriptor()
            ))));
        };
        match &entry.body {
            FunctionBody::Returning(body) => Invocation::Done(body(&self.service, args)),
            FunctionBody::Suspending(body) => match body(self.service.clone(), args) {
                Ok(future) => Invocation::Pending(future),
                Err(err) => Invocation::Done(Err(err)),
            },
        }
    }
}

/// Receives the result of one outbound suspending call
pub(crate) struct SuspendCallback {
    service_type: ServiceType,
    sender: Mutex<Option<oneshot::Sender<Result<Value>>>>,
}

impl SuspendCallback {
    pub(crate) fn new(sender: oneshot::Sender<Result<Value>>) -> Self {
        Self {
            service_type: ServiceType::builtin(
                "SuspendCallback",
                vec![SUSPEND_SUCCESS.clone(), SUSPEND_FAILURE.clone()],
            ),
            sender: Mutex::new(Some(sender)),
        }
    }
}

impl InboundHandler for SuspendCallback {
    fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    fn invoke(&self, function: &Signature, args: Vec<Value>) -> Invocation {
        let arg = args.into_iter().next().unwrap_or(Value::Null);
        let result = if function.id() == SUSPEND_SUCCESS.id() {
            Ok(arg)
        } else {
            match serde_json::from_value::<ThrowableSurrogate>(arg) {
                Ok(surrogate) => Err(decode_failure(&surrogate)),
                Err(err) => Err(BridgeError::Serialization(format!(
                    "cannot decode failure: {}",
                    err
                ))),
            }
        };
        // The awaiting side may already be gone
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(result);
        }
        Invocation::Done(Ok(Value::Null))
    }

    fn is_internal(&self) -> bool {
        true
    }
}

/// Cancels one inbound suspending call
pub(crate) struct CancelCallback {
    service_type: ServiceType,
    cancelled: AtomicBool,
    task: Mutex<Option<AbortHandle>>,
}

impl CancelCallback {
    pub(crate) fn new() -> Self {
        Self {
            service_type: ServiceType::builtin("CancelCallback", vec![CANCEL.clone()]),
            cancelled: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Attach the task running the call
    pub(crate) fn attach(&self, task: AbortHandle) {
        if self.cancelled.load(Ordering::SeqCst) {
            task.abort();
        } else {
            *self.task.lock() = Some(task);
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl InboundHandler for CancelCallback {
    fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    fn invoke(&self, _function: &Signature, _args: Vec<Value>) -> Invocation {
        self.cancel();
        Invocation::Done(Ok(Value::Null))
    }

    fn is_internal(&self) -> bool {
        true
    }

    fn shutdown(&self) {
        self.cancel();
    }
}
