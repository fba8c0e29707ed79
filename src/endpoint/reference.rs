//! Services passed by reference as call arguments and results.
//!
//! Only a name crosses the channel. The sending endpoint binds the service
//! under a fresh pass-by-reference name while the call is encoded; the
//! receiving endpoint decodes the name and takes the service from the side
//! that sent it. Encoding and decoding happen inside an endpoint call, which
//! is tracked per thread so serde impls can reach the endpoint.

use super::scope::ServiceScope;
use super::{take_service, EndpointInner, ServiceAdapter};
use crate::error::{BridgeError, Result};
use parking_lot::Mutex;
use serde::{de, ser, Deserialize, Deserializer, Serialize, Serializer};
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

struct CallContext {
    endpoint: Weak<EndpointInner>,
    scope: Option<ServiceScope>,
}

thread_local! {
    static CALLS: RefCell<Vec<CallContext>> = const { RefCell::new(Vec::new()) };
}

/// Pops the innermost call context, unwinding included
struct Leave;

impl Drop for Leave {
    fn drop(&mut self) {
        CALLS.with(|calls| {
            calls.borrow_mut().pop();
        });
    }
}

/// Run `f` as part of a call on `endpoint`. References decoded by `f` are
/// taken into `scope`.
pub(crate) fn within<T>(endpoint: &Arc<EndpointInner>, scope: Option<ServiceScope>, f: impl FnOnce() -> T) -> T {
    CALLS.with(|calls| {
        calls.borrow_mut().push(CallContext {
            endpoint: Arc::downgrade(endpoint),
            scope,
        })
    });
    let _leave = Leave;
    f()
}

fn current() -> Option<(Weak<EndpointInner>, Option<ServiceScope>)> {
    CALLS.with(|calls| {
        calls
            .borrow()
            .last()
            .map(|call| (call.endpoint.clone(), call.scope.clone()))
    })
}

/// A future that runs every poll as part of a call on an endpoint
pub(crate) struct WithinCall<F> {
    future: F,
    endpoint: Weak<EndpointInner>,
    scope: Option<ServiceScope>,
}

impl<F> WithinCall<F> {
    pub(crate) fn new(future: F, endpoint: Weak<EndpointInner>, scope: Option<ServiceScope>) -> Self {
        Self {
            future,
            endpoint,
            scope,
        }
    }
}

impl<F: Future + Unpin> Future for WithinCall<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = &mut *self;
        match this.endpoint.upgrade() {
            Some(endpoint) => {
                let scope = this.scope.clone();
                within(&endpoint, scope, || Pin::new(&mut this.future).poll(cx))
            }
            None => Pin::new(&mut this.future).poll(cx),
        }
    }
}

type Binder = Box<dyn FnOnce(&Arc<EndpointInner>, &str) -> Result<()> + Send>;

struct Outgoing {
    name: Option<String>,
    binder: Option<Binder>,
}

enum Direction {
    Outgoing(Mutex<Outgoing>),
    Incoming {
        name: String,
        endpoint: Weak<EndpointInner>,
        scope: Option<ServiceScope>,
    },
}

/// A service passed by reference to the other side of an endpoint.
///
/// Use it as a parameter or result type of a [`ServiceFunction`](super::ServiceFunction).
/// The sender wraps a local service with [`send`](Self::send); the receiver
/// calls [`take`](Self::take) on the decoded reference. A reference decoded
/// by a service bound under a [`ServiceScope`] is taken into that scope.
pub struct ServiceReference {
    direction: Direction,
}

impl ServiceReference {
    /// Wrap `service` to be bound on the sending endpoint when this reference
    /// is encoded
    pub fn send<A: ServiceAdapter>(service: Arc<A::Service>, adapter: A) -> Self {
        let binder: Binder = Box::new(move |endpoint, name| endpoint.bind_service(name, service, &adapter));
        Self {
            direction: Direction::Outgoing(Mutex::new(Outgoing {
                name: None,
                binder: Some(binder),
            })),
        }
    }

    /// Name the service is bound under, once encoded or received
    pub fn name(&self) -> Option<String> {
        match &self.direction {
            Direction::Outgoing(outgoing) => outgoing.lock().name.clone(),
            Direction::Incoming { name, .. } => Some(name.clone()),
        }
    }

    /// Take the referenced service from the side that sent it
    pub fn take<A: ServiceAdapter>(&self, adapter: &A) -> Result<A::Outbound> {
        match &self.direction {
            Direction::Incoming {
                name,
                endpoint,
                scope,
            } => {
                let endpoint = endpoint
                    .upgrade()
                    .ok_or_else(|| BridgeError::Closed("endpoint is closed".to_string()))?;
                take_service(&endpoint, name, adapter, scope.as_ref())
            }
            Direction::Outgoing(_) => Err(BridgeError::Shape(
                "only a received service reference can be taken".to_string(),
            )),
        }
    }
}

impl Serialize for ServiceReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut outgoing = match &self.direction {
            Direction::Incoming { name, .. } => return serializer.serialize_str(name),
            Direction::Outgoing(outgoing) => outgoing.lock(),
        };
        let name = match &outgoing.name {
            Some(name) => name.clone(),
            None => {
                let binder = outgoing
                    .binder
                    .take()
                    .ok_or_else(|| <S::Error as ser::Error>::custom("service reference failed to bind earlier"))?;
                let endpoint = current()
                    .and_then(|(endpoint, _)| endpoint.upgrade())
                    .ok_or_else(|| {
                        <S::Error as ser::Error>::custom("a service reference can only be encoded in an endpoint call")
                    })?;
                let name = endpoint.generate_name();
                binder(&endpoint, &name).map_err(<S::Error as ser::Error>::custom)?;
                outgoing.name = Some(name.clone());
                name
            }
        };
        serializer.serialize_str(&name)
    }
}

impl<'de> Deserialize<'de> for ServiceReference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        let (endpoint, scope) = current().ok_or_else(|| {
            <D::Error as de::Error>::custom("a service reference can only be decoded in an endpoint call")
        })?;
        Ok(Self {
            direction: Direction::Incoming {
                name,
                endpoint,
                scope,
            },
        })
    }
}

impl fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            Direction::Outgoing(_) => "outgoing",
            Direction::Incoming { .. } => "incoming",
        };
        f.debug_struct("ServiceReference")
            .field("name", &self.name())
            .field("direction", &direction)
            .finish()
    }
}
