//! Host services exposed to script.

use super::descriptor::{MethodDescriptor, ServiceDescriptor};
use crate::engine::HostObject;
use crate::error::{BridgeError, HostException};
use crate::marshal;
use crate::value::{HostValue, ScriptValue};
use std::collections::HashMap;
use std::sync::Arc;

/// A host implementation of a capability set
pub trait HostService: Send + Sync {
    /// Invoke `method` with arguments already converted to the declared types
    fn invoke(&self, method: &str, args: Vec<HostValue>) -> Result<HostValue, HostException>;
}

type MethodFn = Box<dyn Fn(Vec<HostValue>) -> Result<HostValue, HostException> + Send + Sync>;

/// A [`HostService`] assembled from closures
#[derive(Default)]
pub struct FnService {
    methods: HashMap<String, MethodFn>,
}

impl FnService {
    /// An empty service
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method implementation
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<HostValue>) -> Result<HostValue, HostException> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Box::new(f));
        self
    }
}

impl HostService for FnService {
    fn invoke(&self, method: &str, args: Vec<HostValue>) -> Result<HostValue, HostException> {
        match self.methods.get(method) {
            Some(f) => f(args),
            None => Err(HostException::new(
                "UnsupportedOperation",
                format!("no implementation for {}", method),
            )),
        }
    }
}

/// Name-indexed method table registered as a script global
pub(crate) struct DispatchTable {
    descriptor: Arc<ServiceDescriptor>,
    service: Arc<dyn HostService>,
}

impl DispatchTable {
    pub(crate) fn new(descriptor: Arc<ServiceDescriptor>, service: Arc<dyn HostService>) -> Self {
        Self {
            descriptor,
            service,
        }
    }

    /// Fit script arguments to the declared parameters, gathering a varargs tail
    fn gather(
        &self,
        target: &str,
        method: &MethodDescriptor,
        mut args: Vec<ScriptValue>,
    ) -> Result<Vec<ScriptValue>, BridgeError> {
        let declared = method.params().len();
        if method.is_varargs() {
            if args.len() < method.min_args() {
                return Err(BridgeError::arity(target, method.expected_args(), args.len()));
            }
            let tail = args.split_off(method.min_args());
            args.push(ScriptValue::Array(tail));
        } else if args.len() != declared {
            return Err(BridgeError::arity(target, method.expected_args(), args.len()));
        }
        Ok(args)
    }
}

impl HostObject for DispatchTable {
    fn type_name(&self) -> &str {
        self.descriptor.name()
    }

    fn method_names(&self) -> Vec<String> {
        self.descriptor.method_names()
    }

    fn call(&self, method: &str, args: Vec<ScriptValue>) -> Result<ScriptValue, BridgeError> {
        let target = format!("{}.{}", self.descriptor.name(), method);
        let descriptor = self.descriptor.find(method).ok_or_else(|| {
            BridgeError::Shape(format!(
                "{} has no method called {}",
                self.descriptor.name(),
                method
            ))
        })?;

        let args = self.gather(&target, descriptor, args)?;
        let host_args = args
            .iter()
            .zip(descriptor.params())
            .enumerate()
            .map(|(i, (arg, ty))| {
                marshal::to_host(arg, ty)
                    .map_err(|e| e.into_bridge(format!("argument {} of {}", i, target)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        match self.service.invoke(method, host_args) {
            Ok(value) => marshal::to_script(&value, descriptor.return_type())
                .map_err(|e| e.into_bridge(format!("return value of {}", target))),
            Err(exception) => Err(BridgeError::HostRethrow(exception.thrown_from(&target))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::DeclaredType;

    fn table() -> DispatchTable {
        let descriptor = ServiceDescriptor::new("Math")
            .method(
                MethodDescriptor::new("d")
                    .param(DeclaredType::Integer)
                    .param(DeclaredType::Double)
                    .returns(DeclaredType::Double),
            )
            .method(
                MethodDescriptor::new("join")
                    .param(DeclaredType::String)
                    .varargs(DeclaredType::String)
                    .returns(DeclaredType::String),
            );
        let service = FnService::new()
            .method("d", |args| {
                let i = args[0].as_int().unwrap_or(1);
                let v = args[1].as_double().unwrap_or(0.0);
                Ok(HostValue::Double(v / f64::from(i)))
            })
            .method("join", |args| {
                let sep = args[0].as_str().unwrap_or_default().to_string();
                let parts: Vec<String> = args[1]
                    .as_array()
                    .unwrap_or_default()
                    .iter()
                    .map(|v| v.to_string())
                    .collect();
                Ok(HostValue::String(parts.join(&sep)))
            });
        DispatchTable::new(Arc::new(descriptor), Arc::new(service))
    }

    #[test]
    fn test_dispatch_marshals_arguments() {
        let result = table().call("d", vec![2.into(), 6.28318.into()]).unwrap();
        let value = result.as_f64().unwrap();
        assert!((value - 3.14159).abs() < 1e-9);
    }

    #[test]
    fn test_arity_is_enforced() {
        let table = table();
        for args in [vec![2.into()], vec![2.into(), 1.0.into(), 3.into()]] {
            let err = table.call("d", args).unwrap_err();
            assert!(matches!(err, BridgeError::Arity { ref target, .. } if target == "Math.d"));
        }
    }

    #[test]
    fn test_varargs_gathers_tail() {
        let table = table();
        let out = table
            .call("join", vec!["-".into(), "a".into(), "b".into(), "c".into()])
            .unwrap();
        assert_eq!(out, ScriptValue::from("a-b-c"));
        assert_eq!(table.call("join", vec!["-".into()]).unwrap(), ScriptValue::from(""));
        assert!(matches!(
            table.call("join", vec![]),
            Err(BridgeError::Arity { actual: 0, .. })
        ));
    }

    #[test]
    fn test_marshal_failure_names_position() {
        let err = table().call("d", vec![1.5.into(), 1.0.into()]).unwrap_err();
        match err {
            BridgeError::Marshal { message } => {
                assert_eq!(message, "Cannot convert value 1.5 to int in argument 0 of Math.d")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_host_exception_is_rethrown() {
        let descriptor = ServiceDescriptor::new("Boom").method(MethodDescriptor::new("go"));
        let service = FnService::new()
            .method("go", |_| Err(HostException::new("IllegalStateException", "boom!")));
        let table = DispatchTable::new(Arc::new(descriptor), Arc::new(service));
        match table.call("go", vec![]).unwrap_err() {
            BridgeError::HostRethrow(ex) => {
                assert_eq!(ex.to_string(), "IllegalStateException: boom!");
                assert_eq!(ex.frames()[0].function, "Boom.go");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
