//! Lifetime groups of endpoint services.

use super::outbound::OutboundCallHandler;
use super::EndpointInner;
use crate::error::{BridgeError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
pub(crate) struct ScopeState {
    closed: bool,
    handlers: HashMap<u64, OutboundCallHandler>,
    bindings: Vec<(Weak<EndpointInner>, String)>,
}

/// Services taken or bound together and closed together.
///
/// Closing a scope closes every outbound service taken under it and removes
/// every service bound under it; the endpoint itself stays usable.
#[derive(Clone)]
pub struct ServiceScope {
    id: Uuid,
    state: Arc<Mutex<ScopeState>>,
}

impl Default for ServiceScope {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceScope {
    /// An open, empty scope
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Arc::new(Mutex::new(ScopeState::default())),
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of live services in the scope
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.handlers.len() + state.bindings.len()
    }

    /// Whether the scope holds no live services
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every service in the scope. Calling this twice is harmless.
    pub fn close(&self) {
        let (handlers, bindings) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.handlers),
                std::mem::take(&mut state.bindings),
            )
        };
        debug!(
            scope_id = %self.id,
            taken = handlers.len(),
            bound = bindings.len(),
            "Closing service scope"
        );

        for handler in handlers.into_values() {
            handler.close();
        }
        for (endpoint, name) in bindings {
            if let Some(endpoint) = endpoint.upgrade() {
                endpoint.remove_inbound(&name);
            }
        }
    }

    pub(crate) fn downgrade(&self) -> WeakScope {
        WeakScope {
            id: self.id,
            state: Arc::downgrade(&self.state),
        }
    }

    fn closed_error(&self) -> BridgeError {
        BridgeError::Closed(format!("scope {} is closed", self.id))
    }

    pub(crate) fn add_handler(&self, handler: OutboundCallHandler) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(self.closed_error());
        }
        state.handlers.insert(handler.handler_id(), handler);
        Ok(())
    }

    pub(crate) fn add_binding(&self, endpoint: &Arc<EndpointInner>, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(self.closed_error());
        }
        state
            .bindings
            .push((Arc::downgrade(endpoint), name.to_string()));
        Ok(())
    }
}

/// A scope that does not keep its services alive
#[derive(Clone, Default)]
pub(crate) struct WeakScope {
    id: Uuid,
    state: Weak<Mutex<ScopeState>>,
}

impl WeakScope {
    pub(crate) fn upgrade(&self) -> Option<ServiceScope> {
        Some(ServiceScope {
            id: self.id,
            state: self.state.upgrade()?,
        })
    }

    /// Remove a closed handler from the scope it was taken under
    pub(crate) fn remove_handler(&self, handler_id: u64) {
        if let Some(state) = self.state.upgrade() {
            state.lock().handlers.remove(&handler_id);
        }
    }
}
