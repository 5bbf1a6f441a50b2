//! Tool execution between model turns.
//!
//! When an exchange ends with tool calls, the chunk controller hands them to
//! a [`ToolOrchestrator`]. The orchestrator runs them and reports whether the
//! model must be called again with the results.
//!
//! ```text
//!   ToolHandler          one tool: definition + async execute
//!       │
//!   ToolRegistry         handlers by name, argument validation, dispatch
//!       │
//!   RegistryOrchestrator ToolOrchestrator over a registry
//! ```
//!
//! # Example
//!
//! ```rust
//! use llm_conduit::tool::{tool_fn, RegistryOrchestrator, ToolRegistry};
//! use llm_conduit::{JsonSchema, ToolDefinition};
//! use serde_json::{json, Value};
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(tool_fn(
//!     ToolDefinition {
//!         name: "add".into(),
//!         description: "Add two numbers".into(),
//!         parameters: JsonSchema::new(json!({
//!             "type": "object",
//!             "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
//!             "required": ["a", "b"]
//!         })),
//!     },
//!     |input: Value| async move {
//!         let a = input["a"].as_f64().unwrap_or(0.0);
//!         let b = input["b"].as_f64().unwrap_or(0.0);
//!         Ok(format!("{}", a + b))
//!     },
//! ));
//! let orchestrator = RegistryOrchestrator::new(registry).parallel(true);
//! # let _ = orchestrator;
//! ```

mod handler;
mod orchestrator;
mod registry;

pub use handler::{FnToolHandler, ToolFuture, ToolHandler, tool_fn};
pub use orchestrator::{RegistryOrchestrator, ToolOrchestrator, ToolRound};
pub use registry::ToolRegistry;

/// Error returned by a tool handler.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    /// Human-readable error description.
    pub message: String,
}

impl ToolError {
    /// Creates a tool error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Output of a tool handler, sent back to the model as text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// The content returned to the model.
    pub content: String,
}

impl ToolOutput {
    /// Creates an output with the given content.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

impl From<String> for ToolOutput {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ToolOutput {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<serde_json::Value> for ToolOutput {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::String(s) => Self::new(s),
            other => Self::new(other.to_string()),
        }
    }
}
