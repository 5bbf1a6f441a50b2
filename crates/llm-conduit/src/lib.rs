//! # llm-conduit
//!
//! Streaming normalization and multi-turn orchestration for large language
//! model providers.
//!
//! Vendor adapters implement [`Provider`] and emit canonical
//! [`StreamChunk`]s. This crate turns those increments into something an
//! application can rely on: fragmented tool calls are reassembled, every
//! increment is enriched with accumulated state, assistant turns land in a
//! shared conversation history exactly once, token usage is estimated while
//! streaming and reconciled against vendor totals, and structured output is
//! validated against the requested schema.
//!
//! On top of that pipeline, [`ChunkController`] drives multi-chunk jobs:
//! it splits oversized input, dispatches chunks sequentially or in
//! parallel, resubmits tool results until the model stops asking for
//! tools, and enforces a hard ceiling on total dispatches.
//!
//! # Architecture
//!
//! ```text
//!   provider stream ──► reconstruct ──► pipeline ──────────────────────► caller
//!                                        │ accumulate  (content, length)
//!                                        │ history     (write-once turns)
//!                                        │ usage       (estimate, settle, cost)
//!                                        └ validation  (schema, repair)
//!
//!   ChunkController ── split ──► dispatch ──► pipeline ──► tools? ──► resubmit
//!                                   ▲                                    │
//!                                   └──────── iteration ceiling ◄────────┘
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use llm_conduit::split::{DataSplitter, TextSplitter};
//! use llm_conduit::{ChatParams, ChunkController, DynProvider};
//!
//! # async fn example(provider: Arc<dyn DynProvider>, report: &str) -> Result<(), llm_conduit::LlmError> {
//! let chunks = TextSplitter::default().split(report, "Summarize this section");
//! let controller = ChunkController::new(provider);
//! for response in controller.process_chunks(&chunks, &ChatParams::default()).await? {
//!     println!("{}", response.content);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`chat`] | Messages, tool calls, and complete responses |
//! | [`chunk`] | Multi-chunk dispatch, tool resubmission, iteration ceiling |
//! | [`config`] | Serde-backed configuration with defaults |
//! | [`error`] | Unified [`LlmError`] |
//! | [`history`] | Shared conversation history |
//! | [`pipeline`] | Per-exchange stream processors |
//! | [`provider`] | The [`Provider`] trait and request parameters |
//! | [`reconstruct`] | Tool-call reassembly from streamed fragments |
//! | [`registry`] | Provider construction from configuration |
//! | [`repair`] | Lenient parsing of model-produced JSON |
//! | [`retry`] | Content and transport retry policies |
//! | [`split`] | Input splitting |
//! | [`stream`] | Canonical increments and the [`ChatStream`] alias |
//! | [`tool`] | Tool handlers, registry, and orchestration |
//! | [`usage`] | Token counts, pricing, and cost tracking |

#![warn(missing_docs)]

pub mod chat;
pub mod chunk;
pub mod config;
pub mod error;
pub mod history;
pub mod pipeline;
pub mod provider;
pub mod reconstruct;
pub mod registry;
pub mod repair;
pub mod retry;
pub mod split;
pub mod stream;
pub mod tool;
pub mod usage;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_helpers;

// Only the types most programs touch are re-exported here; the rest stay
// in their modules.
pub use chat::{ChatMessage, ChatResponse, FinishReason, ToolCall, ToolResult};
pub use chunk::ChunkController;
pub use error::LlmError;
pub use provider::{ChatParams, DynProvider, JsonSchema, Provider, ToolChoice, ToolDefinition};
pub use registry::ProviderRegistry;
pub use stream::{ChatStream, StreamChunk};
pub use tool::{ToolHandler, ToolRegistry};
pub use usage::Usage;
