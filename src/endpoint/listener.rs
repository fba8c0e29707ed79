//! Endpoint event hooks.

use super::function::Signature;
use std::time::Duration;

/// One call crossing the endpoint
#[derive(Debug, Clone)]
pub struct Call {
    /// Target service name
    pub service_name: String,
    /// Called function
    pub function: Signature,
    /// Whether the call arrived from the other side
    pub inbound: bool,
    /// Encoded call as sent on the wire
    pub encoded_call: String,
}

/// How a call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// Returned a value
    Success,
    /// Failed; holds the most specific failure type
    Failure(String),
    /// A suspending call started and will complete through a callback
    Suspended,
}

/// Outcome of one call
#[derive(Debug, Clone)]
pub struct CallResult {
    /// How the call ended
    pub outcome: CallOutcome,
    /// Encoded result as sent on the wire
    pub encoded_result: String,
    /// Time between call start and call end
    pub elapsed: Duration,
}

/// Observer of endpoint activity. Every method defaults to doing nothing.
pub trait EventListener: Send + Sync {
    /// A service was bound on this endpoint
    fn bind_service(&self, _name: &str) {}

    /// A service of the other side was taken
    fn take_service(&self, _name: &str) {}

    /// A taken service was dropped without being closed
    fn service_leaked(&self, _name: &str) {}

    /// A call is about to be dispatched
    fn call_start(&self, _call: &Call) {}

    /// A call finished
    fn call_end(&self, _call: &Call, _result: &CallResult) {}
}

/// Listener that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl EventListener for NoopListener {}
