//! Call metrics for monitoring endpoints.
//!
//! [`CallMetrics`] is an [`EventListener`]: install it on an endpoint and it
//! aggregates call counts, failures, latency and service lifecycle events.
//! [`CallMetrics::snapshot`] returns a serializable [`CallStats`].

use crate::endpoint::{Call, CallOutcome, CallResult, EventListener};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of the collected metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStats {
    /// When the snapshot was taken
    pub captured_at: DateTime<Utc>,

    /// Finished calls in either direction
    pub total_calls: u64,

    /// Calls that returned a value
    pub successful_calls: u64,

    /// Calls that failed
    pub failed_calls: u64,

    /// Suspending calls that started
    pub suspended_calls: u64,

    /// Average time between call start and call end, in microseconds
    pub avg_call_time_us: f64,

    /// Services bound
    pub services_bound: u64,

    /// Services taken
    pub services_taken: u64,

    /// Services dropped without close
    pub services_leaked: u64,

    /// Finished calls per function name
    pub function_calls: BTreeMap<String, u64>,

    /// Failures per failure type
    pub failure_counts: BTreeMap<String, u64>,
}

/// Aggregating endpoint listener
#[derive(Default)]
pub struct CallMetrics {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    suspended_calls: AtomicU64,
    total_call_time_us: AtomicU64,
    services_bound: AtomicU64,
    services_taken: AtomicU64,
    services_leaked: AtomicU64,
    function_calls: DashMap<String, u64>,
    failure_counts: DashMap<String, u64>,
}

impl CallMetrics {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Finished calls
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Failed calls
    pub fn failed_calls(&self) -> u64 {
        self.failed_calls.load(Ordering::Relaxed)
    }

    /// Services dropped without close
    pub fn services_leaked(&self) -> u64 {
        self.services_leaked.load(Ordering::Relaxed)
    }

    /// Average call time in microseconds
    pub fn avg_call_time_us(&self) -> f64 {
        let total = self.total_calls();
        if total == 0 {
            0.0
        } else {
            self.total_call_time_us.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    /// Copy the current values
    pub fn snapshot(&self) -> CallStats {
        CallStats {
            captured_at: Utc::now(),
            total_calls: self.total_calls(),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls(),
            suspended_calls: self.suspended_calls.load(Ordering::Relaxed),
            avg_call_time_us: self.avg_call_time_us(),
            services_bound: self.services_bound.load(Ordering::Relaxed),
            services_taken: self.services_taken.load(Ordering::Relaxed),
            services_leaked: self.services_leaked(),
            function_calls: collect(&self.function_calls),
            failure_counts: collect(&self.failure_counts),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.total_calls,
            &self.successful_calls,
            &self.failed_calls,
            &self.suspended_calls,
            &self.total_call_time_us,
            &self.services_bound,
            &self.services_taken,
            &self.services_leaked,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.function_calls.clear();
        self.failure_counts.clear();
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let stats = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP bridge_calls_total Finished endpoint calls\n");
        output.push_str("# TYPE bridge_calls_total counter\n");
        output.push_str(&format!(
            "bridge_calls_total{{status=\"success\"}} {}\n",
            stats.successful_calls
        ));
        output.push_str(&format!(
            "bridge_calls_total{{status=\"error\"}} {}\n",
            stats.failed_calls
        ));
        output.push_str(&format!(
            "bridge_calls_total{{status=\"suspended\"}} {}\n",
            stats.suspended_calls
        ));

        output.push_str("\n# HELP bridge_call_time_us Average call time\n");
        output.push_str("# TYPE bridge_call_time_us gauge\n");
        output.push_str(&format!("bridge_call_time_us {:.2}\n", stats.avg_call_time_us));

        output.push_str("\n# HELP bridge_services_leaked_total Services dropped without close\n");
        output.push_str("# TYPE bridge_services_leaked_total counter\n");
        output.push_str(&format!("bridge_services_leaked_total {}\n", stats.services_leaked));

        output.push_str("\n# HELP bridge_function_calls_total Calls per function\n");
        output.push_str("# TYPE bridge_function_calls_total counter\n");
        for (name, count) in &stats.function_calls {
            output.push_str(&format!(
                "bridge_function_calls_total{{function=\"{}\"}} {}\n",
                name, count
            ));
        }

        output.push_str("\n# HELP bridge_failures_total Failures by type\n");
        output.push_str("# TYPE bridge_failures_total counter\n");
        for (kind, count) in &stats.failure_counts {
            output.push_str(&format!("bridge_failures_total{{type=\"{}\"}} {}\n", kind, count));
        }

        output
    }
}

fn collect(map: &DashMap<String, u64>) -> BTreeMap<String, u64> {
    map.iter().map(|e| (e.key().clone(), *e.value())).collect()
}

impl EventListener for CallMetrics {
    fn bind_service(&self, _name: &str) {
        self.services_bound.fetch_add(1, Ordering::Relaxed);
    }

    fn take_service(&self, _name: &str) {
        self.services_taken.fetch_add(1, Ordering::Relaxed);
    }

    fn service_leaked(&self, _name: &str) {
        self.services_leaked.fetch_add(1, Ordering::Relaxed);
    }

    fn call_end(&self, call: &Call, result: &CallResult) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_call_time_us
            .fetch_add(result.elapsed.as_micros() as u64, Ordering::Relaxed);
        *self
            .function_calls
            .entry(call.function.name().to_string())
            .or_insert(0) += 1;

        match &result.outcome {
            CallOutcome::Success => {
                self.successful_calls.fetch_add(1, Ordering::Relaxed);
            }
            CallOutcome::Suspended => {
                self.suspended_calls.fetch_add(1, Ordering::Relaxed);
            }
            CallOutcome::Failure(kind) => {
                self.failed_calls.fetch_add(1, Ordering::Relaxed);
                *self.failure_counts.entry(kind.clone()).or_insert(0) += 1;
            }
        }
    }
}
