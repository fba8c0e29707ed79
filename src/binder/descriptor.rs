//! Capability-set descriptors.
//!
//! A descriptor is the explicit method table of a capability set: ordered
//! methods with parameter and return types. It is built once, validated
//! before anything touches the engine, and shared by every binding and
//! proxy created from it.

use crate::error::{BridgeError, Result};
use crate::marshal::DeclaredType;
use std::collections::HashSet;
use std::fmt;

/// One method of a capability set
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    name: String,
    params: Vec<DeclaredType>,
    returns: DeclaredType,
    varargs: bool,
}

impl MethodDescriptor {
    /// A method with no parameters returning `void`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: DeclaredType::Void,
            varargs: false,
        }
    }

    /// Append a parameter
    pub fn param(mut self, ty: DeclaredType) -> Self {
        self.params.push(ty);
        self
    }

    /// Append a variable-arity tail collecting elements of `element`
    pub fn varargs(mut self, element: DeclaredType) -> Self {
        self.params.push(DeclaredType::array(element));
        self.varargs = true;
        self
    }

    /// Set the return type
    pub fn returns(mut self, ty: DeclaredType) -> Self {
        self.returns = ty;
        self
    }

    /// Method name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter types; a varargs tail is its array type
    pub fn params(&self) -> &[DeclaredType] {
        &self.params
    }

    /// Return type
    pub fn return_type(&self) -> &DeclaredType {
        &self.returns
    }

    /// Whether the last parameter collects trailing arguments
    pub fn is_varargs(&self) -> bool {
        self.varargs
    }

    /// Fewest arguments a caller may pass
    pub fn min_args(&self) -> usize {
        if self.varargs {
            self.params.len() - 1
        } else {
            self.params.len()
        }
    }

    /// Accepted argument count for error messages
    pub fn expected_args(&self) -> String {
        if self.varargs {
            format!("at least {}", self.min_args())
        } else {
            self.params.len().to_string()
        }
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match (self.varargs && i + 1 == self.params.len(), param) {
                (true, DeclaredType::Array(element)) => write!(f, "{}...", element)?,
                _ => write!(f, "{}", param)?,
            }
        }
        write!(f, "): {}", self.returns)
    }
}

/// A named capability set
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    name: String,
    extends: Vec<String>,
    methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    /// An empty capability set
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extends: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Declare a parent capability set (rejected by [`validate`](Self::validate))
    pub fn extending(mut self, parent: impl Into<String>) -> Self {
        self.extends.push(parent.into());
        self
    }

    /// Append a method
    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    /// Capability set name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Methods in declaration order
    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    /// Method names in declaration order
    pub fn method_names(&self) -> Vec<String> {
        self.methods.iter().map(|m| m.name.clone()).collect()
    }

    /// Position of a method by name
    pub fn method_index(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == name)
    }

    /// Look up a method by name
    pub fn find(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Check the capability set can cross the boundary
    pub fn validate(&self, max_array_depth: usize) -> Result<()> {
        if !self.extends.is_empty() {
            return Err(BridgeError::Shape(format!(
                "{} must not extend other capability sets",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for method in &self.methods {
            if !seen.insert(method.name.as_str()) {
                return Err(BridgeError::Shape(format!(
                    "{} is overloaded in {}",
                    method.name, self.name
                )));
            }

            let context = format!("{}.{}", self.name, method.name);
            for param in &method.params {
                if *param == DeclaredType::Void {
                    return Err(BridgeError::unsupported("void", &context));
                }
                if let Some(bad) = param.find_unsupported(max_array_depth) {
                    return Err(BridgeError::unsupported(bad.to_string(), &context));
                }
            }
            if let Some(bad) = method.returns.find_unsupported(max_array_depth) {
                return Err(BridgeError::unsupported(bad.to_string(), &context));
            }
        }
        Ok(())
    }
}
