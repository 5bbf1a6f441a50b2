//! Chunk & iteration control.
//!
//! [`ChunkController`] takes input that has already been split into
//! [`DataChunk`](crate::split::DataChunk)s and sends one request per chunk,
//! each made of the fixed system message, the prior conversation, and the
//! chunk's instruction and content. It then:
//!
//! - dispatches chunks sequentially or concurrently, always returning
//!   results (and writing history) in chunk order;
//! - counts every chat or stream dispatch against a hard ceiling
//!   ([`ChunkConfig::max_iterations`](crate::config::ChunkConfig::max_iterations),
//!   default 20), failing with
//!   [`ChunkIterationLimitError`](crate::error::ChunkIterationLimitError)
//!   before the excess call is issued;
//! - runs tool calls through a [`ToolOrchestrator`](crate::tool::ToolOrchestrator)
//!   and resubmits with the results while the orchestrator asks for it;
//! - re-issues short refusals (chat path) and transient transport failures.
//!
//! ```text
//!   Idle ─► Dispatching ─► (ToolsPending ─► Dispatching)* ─► Done
//!                 │
//!                 └──────────────► Failed(IterationLimitExceeded)
//! ```

mod controller;
mod iteration;
mod streaming;

pub use controller::ChunkController;
pub use iteration::IterationCounter;
