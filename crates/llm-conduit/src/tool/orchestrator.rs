use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use super::ToolRegistry;
use crate::chat::{ToolCall, ToolResult};
use crate::error::LlmError;

/// Outcome of executing one round of tool calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolRound {
    /// Whether the model must be called again with `results`.
    pub requires_resubmission: bool,
    /// Number of calls executed this round.
    pub new_tool_calls: usize,
    /// One result per call, in call order.
    pub results: Vec<ToolResult>,
}

/// Executes the tool calls a finished exchange asked for.
///
/// Object-safe so the chunk controller can hold an
/// `Arc<dyn ToolOrchestrator>`.
pub trait ToolOrchestrator: Send + Sync {
    /// Runs `calls` and reports whether a continuation is needed.
    fn execute<'a>(
        &'a self,
        calls: &'a [ToolCall],
    ) -> Pin<Box<dyn Future<Output = Result<ToolRound, LlmError>> + Send + 'a>>;
}

/// [`ToolOrchestrator`] backed by a [`ToolRegistry`].
///
/// Any executed call requests resubmission so the model sees the results.
#[derive(Debug, Clone)]
pub struct RegistryOrchestrator {
    registry: ToolRegistry,
    parallel: bool,
}

impl RegistryOrchestrator {
    /// Sequential execution over `registry`.
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            parallel: false,
        }
    }

    /// Runs each round's calls concurrently when `parallel` is set.
    #[must_use]
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// The underlying registry.
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

impl ToolOrchestrator for RegistryOrchestrator {
    fn execute<'a>(
        &'a self,
        calls: &'a [ToolCall],
    ) -> Pin<Box<dyn Future<Output = Result<ToolRound, LlmError>> + Send + 'a>> {
        Box::pin(async move {
            if calls.is_empty() {
                return Ok(ToolRound::default());
            }
            let results = self.registry.execute_all(calls, self.parallel).await;
            let failed = results.iter().filter(|r| r.is_error).count();
            tracing::debug!(calls = calls.len(), failed, "executed tool round");
            Ok(ToolRound {
                requires_resubmission: true,
                new_tool_calls: calls.len(),
                results,
            })
        })
    }
}
