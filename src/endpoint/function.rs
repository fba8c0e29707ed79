//! Function signatures and the adapter protocol.
//!
//! A service crosses an endpoint through a [`ServiceAdapter`]: a serial name,
//! an ordered list of [`ServiceFunction`]s, and a constructor for the
//! outbound proxy type. Adapters are the shape a code generator emits; they
//! can also be written by hand.

use crate::error::{BridgeError, HostException, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::outbound::OutboundCallHandler;

/// Bytes of the SHA-256 digest kept in a signature id
pub const SIGNATURE_ID_BYTES: usize = 6;

/// Descriptor of the function that closes a service
pub const CLOSE_SIGNATURE: &str = "fun close(): Unit";

/// Stable wire id for a function descriptor
pub fn signature_id(descriptor: &str) -> String {
    let digest = Sha256::digest(descriptor.as_bytes());
    hex::encode(&digest[..SIGNATURE_ID_BYTES])
}

/// A parsed function descriptor, e.g. `suspend fun echo(EchoRequest): EchoResponse`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    id: String,
    descriptor: String,
    name: String,
    arity: usize,
    suspending: bool,
}

impl Signature {
    /// Parse `[suspend ]fun name(T1, T2): R`
    pub fn parse(descriptor: &str) -> Result<Self> {
        let malformed = || BridgeError::Shape(format!("malformed function signature: {}", descriptor));

        let text = descriptor.trim();
        let (suspending, text) = match text.strip_prefix("suspend ") {
            Some(rest) => (true, rest.trim_start()),
            None => (false, text),
        };
        let text = text.strip_prefix("fun ").ok_or_else(malformed)?.trim_start();

        let open = text.find('(').ok_or_else(malformed)?;
        let name = text[..open].trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(malformed());
        }

        let mut depth = 0usize;
        let mut close = None;
        let mut arity = 0;
        let mut segment_has_text = false;
        for (i, c) in text[open + 1..].char_indices() {
            match c {
                '(' | '<' | '[' | '{' => depth += 1,
                ')' if depth == 0 => {
                    close = Some(open + 1 + i);
                    break;
                }
                ')' | '>' | ']' | '}' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    if !segment_has_text {
                        return Err(malformed());
                    }
                    arity += 1;
                    segment_has_text = false;
                    continue;
                }
                _ => {}
            }
            if !c.is_whitespace() {
                segment_has_text = true;
            }
        }
        let close = close.ok_or_else(malformed)?;
        if segment_has_text {
            arity += 1;
        } else if arity > 0 {
            return Err(malformed());
        }

        let returns = text[close + 1..].trim_start().strip_prefix(':').ok_or_else(malformed)?;
        if returns.trim().is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            id: signature_id(descriptor),
            descriptor: descriptor.to_string(),
            name: name.to_string(),
            arity,
            suspending,
        })
    }

    /// A fixed signature of an endpoint-internal service
    pub(crate) fn builtin(descriptor: &str, name: &str, arity: usize) -> Self {
        Self {
            id: signature_id(descriptor),
            descriptor: descriptor.to_string(),
            name: name.to_string(),
            arity,
            suspending: false,
        }
    }

    /// Wire id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable descriptor
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameter count
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Whether callers await a callback for the result
    pub fn is_suspending(&self) -> bool {
        self.suspending
    }

    /// Whether this is the service's close function
    pub fn is_close(&self) -> bool {
        self.descriptor == CLOSE_SIGNATURE
    }
}

/// Validated function table of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceType {
    name: String,
    functions: Vec<Signature>,
}

impl ServiceType {
    /// Parse and check a list of descriptors
    pub fn new(name: impl Into<String>, descriptors: &[&str]) -> Result<Self> {
        let name = name.into();
        let mut functions = Vec::with_capacity(descriptors.len());
        let mut ids = HashSet::new();
        for descriptor in descriptors {
            let signature = Signature::parse(descriptor)?;
            if !ids.insert(signature.id().to_string()) {
                return Err(BridgeError::Shape(format!(
                    "{} is declared twice in {}",
                    descriptor, name
                )));
            }
            functions.push(signature);
        }
        Ok(Self { name, functions })
    }

    pub(crate) fn builtin(name: &str, functions: Vec<Signature>) -> Self {
        Self {
            name: name.to_string(),
            functions,
        }
    }

    /// Serial name of the service
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Functions in declaration order
    pub fn functions(&self) -> &[Signature] {
        &self.functions
    }

    /// Look up a function by wire id
    pub fn function(&self, id: &str) -> Option<&Signature> {
        self.functions.iter().find(|f| f.id() == id)
    }

    /// Wire description for the other side
    pub fn info(&self) -> ServiceTypeInfo {
        ServiceTypeInfo {
            name: self.name.clone(),
            functions: self
                .functions
                .iter()
                .map(|f| f.descriptor().to_string())
                .collect(),
        }
    }
}

/// Serializable description of a bound service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTypeInfo {
    /// Serial name
    pub name: String,
    /// Function descriptors
    pub functions: Vec<String>,
}

/// Future returned by a suspending function body
pub type CallFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

pub(crate) enum FunctionBody<S: ?Sized> {
    Returning(Box<dyn Fn(&S, Vec<Value>) -> Result<Value> + Send + Sync>),
    Suspending(Box<dyn Fn(Arc<S>, Vec<Value>) -> Result<CallFuture> + Send + Sync>),
}

/// One function of a service: a descriptor plus the code that runs it.
///
/// Arguments travel as a JSON array; `A` is the tuple of parameter types
/// (`()` for none, `(T,)` for one) and `R` the result type.
pub struct ServiceFunction<S: ?Sized> {
    descriptor: String,
    pub(crate) body: FunctionBody<S>,
}

impl<S: ?Sized + Send + Sync + 'static> ServiceFunction<S> {
    /// A function that returns before the call completes
    pub fn returning<A, R, F>(descriptor: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&S, A) -> std::result::Result<R, HostException> + Send + Sync + 'static,
    {
        Self {
            descriptor: descriptor.into(),
            body: FunctionBody::Returning(Box::new(move |service, args| {
                let args = decode_args::<A>(args)?;
                let result = f(service, args).map_err(BridgeError::HostRethrow)?;
                Ok(serde_json::to_value(result)?)
            })),
        }
    }

    /// A function whose result arrives later through a callback
    pub fn suspending<A, R, F, Fut>(descriptor: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, HostException>> + Send + 'static,
    {
        Self {
            descriptor: descriptor.into(),
            body: FunctionBody::Suspending(Box::new(move |service, args| {
                let args = decode_args::<A>(args)?;
                let future = f(service, args);
                Ok(Box::pin(async move {
                    let result = future.await.map_err(BridgeError::HostRethrow)?;
                    Ok(serde_json::to_value(result)?)
                }) as CallFuture)
            })),
        }
    }

    /// The `close()` function; the endpoint removes the service before it runs
    pub fn close<F>(f: F) -> Self
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        Self::returning::<(), (), _>(CLOSE_SIGNATURE, move |service, ()| {
            f(service);
            Ok(())
        })
    }

    /// Function descriptor
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }
}

/// Adapter between a service trait and the wire
pub trait ServiceAdapter: Send + Sync + 'static {
    /// Service implementation type (usually a trait object)
    type Service: ?Sized + Send + Sync + 'static;

    /// Proxy type returned by `take`
    type Outbound;

    /// Name identifying the service interface
    fn serial_name(&self) -> &str;

    /// Functions in a fixed order; outbound calls address them by index
    fn functions(&self) -> Vec<ServiceFunction<Self::Service>>;

    /// Wrap a call handler in the outbound proxy type
    fn outbound_service(&self, handler: OutboundCallHandler) -> Self::Outbound;
}

/// Build the validated function table for an adapter
pub(crate) fn service_type<A: ServiceAdapter>(adapter: &A) -> Result<(ServiceType, Vec<ServiceFunction<A::Service>>)> {
    let functions = adapter.functions();
    let descriptors: Vec<&str> = functions.iter().map(|f| f.descriptor()).collect();
    let service_type = ServiceType::new(adapter.serial_name(), &descriptors)?;
    Ok((service_type, functions))
}

/// Decode a JSON argument list into a parameter tuple
pub(crate) fn decode_args<A: DeserializeOwned>(args: Vec<Value>) -> Result<A> {
    let input = if args.is_empty() {
        Value::Null
    } else {
        Value::Array(args)
    };
    serde_json::from_value(input).map_err(|e| BridgeError::Marshal {
        message: format!("cannot decode arguments: {}", e),
    })
}

/// Encode a parameter tuple as a JSON argument list
pub(crate) fn encode_args<A: Serialize>(args: &A) -> Result<Vec<Value>> {
    Ok(match serde_json::to_value(args)? {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    })
}
