//! Provider adapter contract and request types.
//!
//! - **[`Provider`]** is what every vendor adapter implements: a chat call
//!   ([`generate`](Provider::generate)) and a stream opener
//!   ([`stream`](Provider::stream)) that yields canonical
//!   [`StreamChunk`](crate::StreamChunk)s. It uses native async fn in
//!   traits.
//! - **[`DynProvider`]** is the object-safe mirror using boxed futures. A
//!   blanket `impl<T: Provider> DynProvider for T` bridges the two, so the
//!   controller stores adapters as `Arc<dyn DynProvider>`.
//!
//! All request configuration lives in [`ChatParams`].

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::{ChatMessage, ChatResponse};
use crate::error::LlmError;
use crate::stream::{ChatStream, ValidationIssue};

/// A vendor adapter producing canonical responses and streams.
///
/// Adapters must keep tool-call delta indices stable within one stream
/// and end every stream with exactly one terminal increment.
pub trait Provider: Send + Sync {
    /// Sends a request and waits for the complete response.
    fn generate(
        &self,
        params: &ChatParams,
    ) -> impl Future<Output = Result<ChatResponse, LlmError>> + Send;

    /// Opens a stream of canonical increments.
    ///
    /// Errors returned here mean the stream never started. Errors yielded
    /// by the stream are transport failures mid-exchange.
    fn stream(
        &self,
        params: &ChatParams,
    ) -> impl Future<Output = Result<ChatStream, LlmError>> + Send;

    /// Static information about this adapter and its model.
    fn metadata(&self) -> ProviderMetadata;
}

/// Object-safe counterpart of [`Provider`].
pub trait DynProvider: Send + Sync {
    /// Boxed-future version of [`Provider::generate`].
    fn generate_boxed<'a>(
        &'a self,
        params: &'a ChatParams,
    ) -> Pin<Box<dyn Future<Output = Result<ChatResponse, LlmError>> + Send + 'a>>;

    /// Boxed-future version of [`Provider::stream`].
    fn stream_boxed<'a>(
        &'a self,
        params: &'a ChatParams,
    ) -> Pin<Box<dyn Future<Output = Result<ChatStream, LlmError>> + Send + 'a>>;

    /// See [`Provider::metadata`].
    fn metadata(&self) -> ProviderMetadata;
}

impl<T: Provider> DynProvider for T {
    fn generate_boxed<'a>(
        &'a self,
        params: &'a ChatParams,
    ) -> Pin<Box<dyn Future<Output = Result<ChatResponse, LlmError>> + Send + 'a>> {
        Box::pin(self.generate(params))
    }

    fn stream_boxed<'a>(
        &'a self,
        params: &'a ChatParams,
    ) -> Pin<Box<dyn Future<Output = Result<ChatStream, LlmError>> + Send + 'a>> {
        Box::pin(self.stream(params))
    }

    fn metadata(&self) -> ProviderMetadata {
        Provider::metadata(self)
    }
}

/// Describes an adapter and the model behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Adapter name, e.g. `"openai"`.
    pub name: Cow<'static, str>,
    /// Model identifier.
    pub model: String,
    /// Context window in tokens.
    pub context_window: u64,
    /// Features the model supports.
    pub capabilities: HashSet<Capability>,
}

impl ProviderMetadata {
    /// Returns `true` if the model supports `capability`.
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// A feature a model may or may not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Capability {
    /// Tool calling.
    Tools,
    /// Schema-constrained output.
    StructuredOutput,
    /// Exposed reasoning output.
    Reasoning,
    /// Image input.
    Vision,
    /// Prompt caching.
    Caching,
    /// Incremental streaming.
    Streaming,
}

impl Capability {
    /// Human-readable name used in capability errors.
    pub fn label(self) -> &'static str {
        match self {
            Self::Tools => "tool calling",
            Self::StructuredOutput => "structured output",
            Self::Reasoning => "reasoning",
            Self::Vision => "vision",
            Self::Caching => "prompt caching",
            Self::Streaming => "streaming",
        }
    }
}

/// Parameters for a single chat or stream call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatParams {
    /// Conversation messages, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Fixed system message.
    pub system: Option<String>,
    /// Tools the model may call.
    pub tools: Option<Vec<ToolDefinition>>,
    /// How the model should choose among tools.
    pub tool_choice: Option<ToolChoice>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Output token cap.
    pub max_tokens: Option<u32>,
    /// Schema the response content must satisfy.
    pub structured_output: Option<JsonSchema>,
    /// Arbitrary caller data passed through to the adapter.
    pub metadata: HashMap<String, Value>,
}

impl ChatParams {
    /// Returns `true` if any tools are declared.
    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| !t.is_empty())
    }
}

/// Tool selection strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ToolChoice {
    /// The model decides.
    Auto,
    /// No tool calls.
    None,
    /// At least one tool call.
    Required,
    /// This specific tool.
    Specific(String),
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// What the tool does, for the model.
    pub description: String,
    /// Schema of the arguments object.
    pub parameters: JsonSchema,
}

/// A JSON Schema document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonSchema(Value);

impl JsonSchema {
    /// Wraps a raw schema value.
    pub fn new(schema: Value) -> Self {
        Self(schema)
    }

    /// The raw schema.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Derives a schema from a Rust type.
    #[cfg(feature = "schema")]
    pub fn from_type<T: schemars::JsonSchema>() -> Result<Self, serde_json::Error> {
        let schema = schemars::schema_for!(T);
        let value = serde_json::to_value(schema)?;
        Ok(Self(value))
    }

    /// Validates `value`, collapsing all problems into one error.
    pub fn validate(&self, value: &Value) -> Result<(), LlmError> {
        self.validate_detailed(value).map_err(|issues| {
            let message = issues
                .iter()
                .map(|i| {
                    if i.path.is_empty() {
                        i.message.clone()
                    } else {
                        format!("{}: {}", i.path, i.message)
                    }
                })
                .collect::<Vec<_>>()
                .join("; ");
            LlmError::SchemaValidation {
                message,
                schema: self.0.clone(),
                actual: value.clone(),
            }
        })
    }

    /// Validates `value`, returning one [`ValidationIssue`] per problem.
    ///
    /// An invalid schema is reported as a single issue at the root.
    #[cfg(feature = "schema")]
    pub fn validate_detailed(&self, value: &Value) -> Result<(), Vec<ValidationIssue>> {
        let validator = jsonschema::validator_for(&self.0)
            .map_err(|e| vec![ValidationIssue::new("", format!("invalid JSON schema: {e}"))])?;
        let issues: Vec<ValidationIssue> = validator
            .iter_errors(value)
            .map(|e| ValidationIssue::new(e.instance_path.to_string(), e.to_string()))
            .collect();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    /// Without the `schema` feature only the parse step is enforced.
    #[cfg(not(feature = "schema"))]
    pub fn validate_detailed(&self, _value: &Value) -> Result<(), Vec<ValidationIssue>> {
        Ok(())
    }
}
