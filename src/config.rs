//! Bridge configuration types and defaults.
//!
//! This module defines the options for script contexts and endpoints,
//! including leak reporting, marshalling limits, and callback naming.

use crate::engine::EngineLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File name reported for scripts evaluated without one
pub const DEFAULT_FILE_NAME: &str = "?";

/// Deepest array nesting a capability set may declare
pub const DEFAULT_MAX_ARRAY_DEPTH: usize = 2;

/// Default bytes allocated between garbage collections
pub const DEFAULT_GC_THRESHOLD: i64 = 256 * 1024;

/// Default bytes of stack script calls may use
pub const DEFAULT_MAX_STACK_SIZE: i64 = 512 * 1024;

/// Prefix for names of temporary pass-by-reference services
pub const DEFAULT_PASS_BY_REFERENCE_PREFIX: &str = "bridge/host-";

/// Configuration for a script context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// File name used by `evaluate` when none is given (default: "?")
    #[serde(default = "default_file_name")]
    pub default_file_name: String,

    /// Warn when a context is dropped without being closed (default: true)
    #[serde(default = "default_true")]
    pub leak_warnings: bool,

    /// Maximum declared array nesting (default: 2)
    #[serde(default = "default_max_array_depth")]
    pub max_array_depth: usize,

    /// Bytes a context may allocate; -1 for no limit (default: -1)
    #[serde(default = "default_memory_limit")]
    pub memory_limit: i64,

    /// Bytes allocated between garbage collections; -1 disables automatic
    /// collection (default: 256 KiB)
    #[serde(default = "default_gc_threshold")]
    pub gc_threshold: i64,

    /// Bytes of stack script calls may use; 0 disables the check (default: 512 KiB)
    #[serde(default = "default_max_stack_size")]
    pub max_stack_size: i64,

    /// Endpoint options
    #[serde(default)]
    pub endpoint: EndpointConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_file_name: DEFAULT_FILE_NAME.to_string(),
            leak_warnings: true,
            max_array_depth: DEFAULT_MAX_ARRAY_DEPTH,
            memory_limit: -1,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            endpoint: EndpointConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the default file name
    pub fn with_default_file_name(mut self, name: impl Into<String>) -> Self {
        self.default_file_name = name.into();
        self
    }

    /// Enable or disable leak warnings
    pub fn with_leak_warnings(mut self, enable: bool) -> Self {
        self.leak_warnings = enable;
        self
    }

    /// Set the maximum declared array nesting
    pub fn with_max_array_depth(mut self, depth: usize) -> Self {
        self.max_array_depth = depth;
        self
    }

    /// Set the context memory limit
    pub fn with_memory_limit(mut self, bytes: i64) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Set the garbage collection threshold
    pub fn with_gc_threshold(mut self, bytes: i64) -> Self {
        self.gc_threshold = bytes;
        self
    }

    /// Set the maximum stack size
    pub fn with_max_stack_size(mut self, bytes: i64) -> Self {
        self.max_stack_size = bytes;
        self
    }

    /// Engine limits applied to new contexts
    pub fn limits(&self) -> EngineLimits {
        EngineLimits {
            memory_limit: self.memory_limit,
            gc_threshold: self.gc_threshold,
            max_stack_size: self.max_stack_size,
        }
    }

    /// Set the endpoint options
    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_file_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "default_file_name".into(),
                reason: "must not be empty".into(),
            });
        }

        if self.max_array_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_array_depth".into(),
                reason: "must be greater than 0".into(),
            });
        }

        for (field, value, least) in [
            ("memory_limit", self.memory_limit, -1),
            ("gc_threshold", self.gc_threshold, -1),
            ("max_stack_size", self.max_stack_size, 0),
        ] {
            if value < least {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    reason: format!("must be at least {}", least),
                });
            }
        }

        self.endpoint.validate()
    }
}

/// Configuration for a call endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Prefix for generated callback service names (default: "bridge/host-")
    #[serde(default = "default_pass_by_reference_prefix")]
    pub pass_by_reference_prefix: String,

    /// Report taken services dropped without close (default: true)
    #[serde(default = "default_true")]
    pub leak_warnings: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            pass_by_reference_prefix: DEFAULT_PASS_BY_REFERENCE_PREFIX.to_string(),
            leak_warnings: true,
        }
    }
}

impl EndpointConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the callback name prefix
    pub fn with_pass_by_reference_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.pass_by_reference_prefix = prefix.into();
        self
    }

    /// Enable or disable leak warnings
    pub fn with_leak_warnings(mut self, enable: bool) -> Self {
        self.leak_warnings = enable;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pass_by_reference_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "pass_by_reference_prefix".into(),
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_file_name() -> String {
    DEFAULT_FILE_NAME.to_string()
}

fn default_max_array_depth() -> usize {
    DEFAULT_MAX_ARRAY_DEPTH
}

fn default_memory_limit() -> i64 {
    -1
}

fn default_gc_threshold() -> i64 {
    DEFAULT_GC_THRESHOLD
}

fn default_max_stack_size() -> i64 {
    DEFAULT_MAX_STACK_SIZE
}

fn default_pass_by_reference_prefix() -> String {
    DEFAULT_PASS_BY_REFERENCE_PREFIX.to_string()
}

fn default_true() -> bool {
    true
}
