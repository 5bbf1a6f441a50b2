//! Canonical conversation types.
//!
//! Every provider adapter translates its wire format into these shapes,
//! so the rest of the crate never sees vendor-specific structures.
//!
//! # Tool-call shapes
//!
//! Vendors describe a tool call either flat (`{id, name, arguments}`) or
//! nested (`{id, function: {name, arguments}}`), and send arguments
//! either as an object or as a JSON-encoded string.
//! [`normalize_tool_call`] folds all of these into one [`ToolCall`] at the
//! adapter boundary.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LlmError;
use crate::repair::parse_lenient;
use crate::stream::ValidationIssue;
use crate::usage::Usage;

/// The author of a [`ChatMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Fixed instructions that frame the conversation.
    System,
    /// The human (or calling application).
    User,
    /// The model.
    Assistant,
    /// Output of a tool execution, linked by `tool_call_id`.
    Tool,
    /// Developer instructions (treated like `System` by most vendors).
    Developer,
}

/// A single message in a conversation.
///
/// A message with empty content and no tool calls carries nothing and is
/// never stored in a [`ConversationHistory`](crate::history::ConversationHistory).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who wrote the message.
    pub role: ChatRole,
    /// Text body.
    pub content: String,
    /// For `Tool` messages: the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For `Assistant` messages: tool invocations requested by the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(ChatRole::System, content)
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::text(ChatRole::User, content)
    }

    /// An assistant message with text only.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(ChatRole::Assistant, content)
    }

    /// A developer message.
    pub fn developer(content: impl Into<String>) -> Self {
        Self::text(ChatRole::Developer, content)
    }

    /// An assistant message carrying tool calls (content may be empty).
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::text(ChatRole::Assistant, content)
        }
    }

    /// A tool message answering a previous call.
    pub fn tool_result(result: &ToolResult) -> Self {
        Self {
            tool_call_id: Some(result.tool_call_id.clone()),
            ..Self::text(ChatRole::Tool, result.content.clone())
        }
    }

    /// Returns `true` if the message has no content and no tool calls.
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.tool_calls.is_empty()
    }
}

/// A tool invocation requested by the model.
///
/// Deserializes from either vendor shape through [`normalize_tool_call`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct ToolCall {
    /// Provider-assigned identifier, echoed back in the [`ToolResult`].
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Parsed arguments, normally a JSON object.
    pub arguments: Value,
}

/// The output of executing one [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The id of the call this result answers.
    pub tool_call_id: String,
    /// Result text sent back to the model.
    pub content: String,
    /// Whether the tool failed. The model still sees the content.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// A successful result.
    pub fn success(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    /// A failed result.
    pub fn error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// Terminal status of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The exchange has not finished yet.
    #[default]
    None,
    /// Natural end of output.
    Stop,
    /// Output hit the token limit.
    Length,
    /// The model is waiting for tool results.
    ToolCalls,
    /// Output was rejected, by the vendor or by response validation.
    ContentFilter,
    /// The stream failed.
    Error,
}

/// A complete (non-streamed, or fully collected) model response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Text output.
    pub content: String,
    /// Completed tool calls.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Reasoning output, when the model exposes it.
    #[serde(default)]
    pub reasoning: Option<String>,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
    /// Token counts, and costs once priced.
    #[serde(default)]
    pub usage: Usage,
    /// The model that produced the response.
    #[serde(default)]
    pub model: String,
    /// Structured-output validation problems, if any.
    #[serde(default)]
    pub validation_errors: Vec<ValidationIssue>,
    /// The parsed structured value, when one was requested and valid.
    #[serde(default)]
    pub parsed: Option<Value>,
    /// Provider-specific extras.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ChatResponse {
    /// Returns `true` if the response carries tool calls to run.
    ///
    /// The finish reason is not required to be `ToolCalls`; some vendors
    /// report `Stop` alongside calls. A failed exchange never wants tools.
    pub fn wants_tools(&self) -> bool {
        !self.tool_calls.is_empty() && self.finish_reason != FinishReason::Error
    }

    /// Deserializes the structured output into `T`.
    ///
    /// Uses the validated [`parsed`](Self::parsed) value when present and
    /// falls back to lenient parsing of the text content otherwise.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, LlmError> {
        let value = match &self.parsed {
            Some(v) => v.clone(),
            None => parse_lenient(&self.content).map_err(|e| self.format_error(&e))?,
        };
        serde_json::from_value(value).map_err(|e| self.format_error(&e))
    }

    fn format_error(&self, err: &serde_json::Error) -> LlmError {
        LlmError::ResponseFormat {
            message: err.to_string(),
            raw: self.content.clone(),
        }
    }
}

impl TryFrom<Value> for ToolCall {
    type Error = String;

    fn try_from(raw: Value) -> Result<Self, Self::Error> {
        normalize_tool_call(&raw).ok_or_else(|| format!("tool call without a name: {raw}"))
    }
}

/// Normalizes either vendor tool-call shape into a [`ToolCall`].
///
/// Returns `None` when no tool name can be found. String arguments that do
/// not parse as JSON are wrapped as `{"value": raw}`; missing arguments
/// become an empty object.
///
/// ```rust
/// use llm_conduit::chat::normalize_tool_call;
/// use serde_json::json;
///
/// let nested = json!({"id": "c1", "function": {"name": "add", "arguments": "{\"a\":1}"}});
/// let call = normalize_tool_call(&nested).unwrap();
/// assert_eq!(call.name, "add");
/// assert_eq!(call.arguments, json!({"a": 1}));
/// ```
pub fn normalize_tool_call(raw: &Value) -> Option<ToolCall> {
    let body = raw.get("function").unwrap_or(raw);
    let name = body.get("name")?.as_str()?.to_owned();
    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let arguments = match body.get("arguments") {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(Value::String(s)) if s.trim().is_empty() => Value::Object(serde_json::Map::new()),
        Some(Value::String(s)) => serde_json::from_str(s)
            .unwrap_or_else(|_| serde_json::json!({ "value": s })),
        Some(other) => other.clone(),
    };
    Some(ToolCall {
        id,
        name,
        arguments,
    })
}
