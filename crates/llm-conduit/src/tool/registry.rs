use std::collections::HashMap;
use std::sync::Arc;

use super::{ToolError, ToolHandler, ToolOutput};
use crate::chat::{ToolCall, ToolResult};
use crate::error::LlmError;
use crate::provider::ToolDefinition;

/// Tool handlers indexed by name.
///
/// Cloning is cheap: handlers are shared behind `Arc`.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

impl ToolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any handler with the same name.
    pub fn register(&mut self, handler: impl ToolHandler + 'static) -> &mut Self {
        self.register_shared(Arc::new(handler))
    }

    /// Registers a shared handler.
    pub fn register_shared(&mut self, handler: Arc<dyn ToolHandler>) -> &mut Self {
        let name = handler.definition().name;
        self.handlers.insert(name, handler);
        self
    }

    /// The handler registered under `name`.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.handlers.get(name)
    }

    /// Whether a tool named `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Definitions of every registered tool, sorted by name.
    ///
    /// Pass these as [`ChatParams::tools`](crate::provider::ChatParams::tools).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.handlers.values().map(|h| h.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Executes one call, reporting every failure as
    /// [`LlmError::ToolExecution`].
    pub async fn call(&self, call: &ToolCall) -> Result<ToolOutput, LlmError> {
        let failure = |message: String| LlmError::ToolExecution {
            tool_name: call.name.clone(),
            source: Box::new(ToolError::new(message)),
        };
        let Some(handler) = self.handlers.get(&call.name) else {
            tracing::warn!(tool = %call.name, "model called an unknown tool");
            return Err(failure(format!("Unknown tool: {}", call.name)));
        };

        #[cfg(feature = "schema")]
        {
            if let Err(e) = handler.definition().parameters.validate(&call.arguments) {
                return Err(failure(format!(
                    "Invalid arguments for tool '{}': {e}",
                    call.name
                )));
            }
        }

        handler.execute(call.arguments.clone()).await.map_err(|e| {
            tracing::debug!(tool = %call.name, error = %e, "tool failed");
            LlmError::ToolExecution {
                tool_name: call.name.clone(),
                source: Box::new(e),
            }
        })
    }

    /// Executes one call.
    ///
    /// Never fails at the outer level: unknown tools, invalid arguments and
    /// handler errors come back as error [`ToolResult`]s for the model to see.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        match self.call(call).await {
            Ok(output) => ToolResult::success(&call.id, output.content),
            Err(LlmError::ToolExecution { source, .. }) => {
                ToolResult::error(&call.id, source.to_string())
            }
            Err(e) => ToolResult::error(&call.id, e.to_string()),
        }
    }

    /// Executes several calls, returning results in call order.
    ///
    /// With `parallel`, calls run concurrently via `join_all`.
    pub async fn execute_all(&self, calls: &[ToolCall], parallel: bool) -> Vec<ToolResult> {
        if !parallel || calls.len() <= 1 {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.execute(call).await);
            }
            return results;
        }
        futures::future::join_all(calls.iter().map(|call| self.execute(call))).await
    }
}
