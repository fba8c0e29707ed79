//! Host-side proxies for script objects.

use super::descriptor::ServiceDescriptor;
use super::{classify_throw, resolve_error};
use crate::engine::{ContextHandle, InvokeFailure, ProxyId};
use crate::error::{BridgeError, Result};
use crate::marshal::{self, HostType};
use crate::trace::CallFrame;
use crate::value::{HostValue, ScriptValue};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use uuid::Uuid;

const CALL_ENTRY: &str = "RemoteProxy::call";

/// A host value implementing a capability set by calling into script.
///
/// Each proxy is its own identity; two proxies for the same global are not
/// equal but reach the same script object, looked up by name on every call.
pub struct RemoteProxy {
    id: Uuid,
    name: String,
    descriptor: Arc<ServiceDescriptor>,
    proxy: ProxyId,
    handle: Arc<ContextHandle>,
}

impl RemoteProxy {
    pub(crate) fn new(
        name: String,
        descriptor: Arc<ServiceDescriptor>,
        proxy: ProxyId,
        handle: Arc<ContextHandle>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            descriptor,
            proxy,
            handle,
        }
    }

    /// Script global this proxy forwards to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capability set this proxy implements
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Call a method, blocking until script returns or throws
    #[track_caller]
    pub fn call(&self, method: &str, args: Vec<HostValue>) -> Result<HostValue> {
        let frames = vec![
            CallFrame::native(CALL_ENTRY),
            CallFrame::host(CALL_ENTRY, file!(), line!()),
            CallFrame::caller(Location::caller()),
        ];

        self.handle.enter(frames, |engine, raw| {
            let target = format!("{}.{}", self.name, method);
            let index = self.descriptor.method_index(method).ok_or_else(|| {
                BridgeError::Shape(format!(
                    "{} has no method called {}",
                    self.descriptor.name(),
                    method
                ))
            })?;
            let declared = &self.descriptor.methods()[index];

            if args.len() != declared.params().len() {
                return Err(BridgeError::arity(
                    &target,
                    declared.params().len().to_string(),
                    args.len(),
                ));
            }

            let mut script_args = Vec::with_capacity(args.len());
            for (i, (arg, ty)) in args.iter().zip(declared.params()).enumerate() {
                let value = marshal::to_script(arg, ty)
                    .map_err(|e| e.into_bridge(format!("argument {} of {}", i, target)))?;
                match value {
                    ScriptValue::Array(items) if declared.is_varargs() && i + 1 == args.len() => {
                        script_args.extend(items)
                    }
                    value => script_args.push(value),
                }
            }

            match engine.invoke(raw, self.proxy, index, script_args) {
                Ok(value) => marshal::to_host(&value, declared.return_type())
                    .map_err(|e| e.into_bridge(format!("return value of {}", target))),
                Err(InvokeFailure::Thrown(throw)) => {
                    Err(classify_throw(throw, &self.handle.host_frames()))
                }
                Err(InvokeFailure::Unresolved(failure)) => Err(resolve_error(&self.name, failure)),
            }
        })
    }

    /// Call a method and convert the result to `R`
    #[track_caller]
    pub fn call_as<R: HostType>(&self, method: &str, args: Vec<HostValue>) -> Result<R> {
        let value = self.call(method, args)?;
        R::from_host(value)
            .map_err(|e| e.into_bridge(format!("return value of {}.{}", self.name, method)))
    }
}

impl PartialEq for RemoteProxy {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RemoteProxy {}

impl std::hash::Hash for RemoteProxy {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for RemoteProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ScriptProxy{{name={}, type={}}}",
            self.name,
            self.descriptor.name()
        )
    }
}

impl fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.descriptor.name())
            .finish()
    }
}

impl Drop for RemoteProxy {
    fn drop(&mut self) {
        let proxy = self.proxy;
        // A closed context has already released everything.
        let _ = self.handle.enter(Vec::new(), |engine, raw| {
            engine.release_proxy(raw, proxy);
            Ok(())
        });
    }
}
