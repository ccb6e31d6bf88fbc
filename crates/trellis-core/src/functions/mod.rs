//! Template function abstraction.
//!
//! This module defines the function trait and related types:
//! - TemplateFunction: the core trait for action callables
//! - TemplateValue: the value type flowing through pipelines
//! - FunctionRegistry: name-based lookup used by the action engine

mod builtin;

pub use builtin::builtin_registry;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::lookup::LookupError;

/// Function call errors.
#[derive(Debug, Error)]
pub enum FunctionError {
    #[error("wrong number of arguments for {function}: expected {expected}, got {got}")]
    Arity {
        function: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("argument {position} of {function} must be a {expected}")]
    ArgumentType {
        function: &'static str,
        position: usize,
        expected: &'static str,
    },

    #[error("invalid base64 input: {0}")]
    InvalidBase64(String),

    #[error("the protect template function is not enabled in this mode")]
    ProtectNotEnabled,

    #[error("an unexpected error occurred where autoindent could not be processed")]
    UnexpectedAutoindent,

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A value produced or consumed by a template action.
///
/// Scalars render as themselves; nested objects (from `lookup`) render as
/// compact JSON, which YAML accepts as a flow value when spliced inline.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    String(String),
    Int(i64),
    Bool(bool),
    Object(serde_json::Value),
}

impl TemplateValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Int(_) => "integer",
            Self::Bool(_) => "boolean",
            Self::Object(_) => "object",
        }
    }

    /// Textual form substituted into the document.
    pub fn render(&self) -> String {
        match self {
            Self::String(value) => value.clone(),
            Self::Int(value) => value.to_string(),
            Self::Bool(value) => value.to_string(),
            Self::Object(value) => value.to_string(),
        }
    }
}

impl From<String> for TemplateValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for TemplateValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for TemplateValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A named callable available to template actions.
///
/// Pipeline input arrives as the final argument, after any explicit
/// arguments, so `"x" | f "a"` calls `f` with `["a", "x"]`.
#[async_trait]
pub trait TemplateFunction: Send + Sync {
    /// The action-facing name (must be unique within a registry).
    fn name(&self) -> &str;

    /// Evaluate the function against fully evaluated arguments.
    async fn call(&self, args: &[TemplateValue]) -> Result<TemplateValue, FunctionError>;
}

/// Function registry for looking up callables by name.
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn TemplateFunction>>,
}

impl FunctionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Register a function under its own name.
    pub fn register(&mut self, function: Arc<dyn TemplateFunction>) {
        self.functions
            .insert(function.name().to_string(), function);
    }

    /// Remove a function; invoking the name afterwards is a parse error.
    pub fn remove(&mut self, name: &str) {
        self.functions.remove(name);
    }

    /// Get a function by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TemplateFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Get all registered names.
    pub fn names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
