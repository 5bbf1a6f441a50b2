//! Mock provider for testing.
//!
//! [`MockProvider`] is a queue-based fake that lets tests control exactly
//! what a provider returns, without touching the network. It implements
//! [`Provider`], so it works anywhere a real adapter does, including as an
//! `Arc<dyn DynProvider>` through the blanket impl. Clones share their
//! queues and call log.
//!
//! Responses can also be routed by a marker string found in the last user
//! message and delayed, which makes completion order controllable in
//! parallel-dispatch tests.
//!
//! ```rust,no_run
//! use llm_conduit::mock::MockProvider;
//! use llm_conduit::test_helpers::{metadata_for, sample_response};
//! use llm_conduit::{ChatParams, Provider};
//!
//! # async fn example() {
//! let mock = MockProvider::new(metadata_for("test", "test-model"));
//! mock.queue_response(sample_response("Hello!"));
//!
//! let resp = mock.generate(&ChatParams::default()).await.unwrap();
//! assert_eq!(resp.content, "Hello!");
//! assert_eq!(mock.recorded_calls().len(), 1);
//! # }
//! ```
//!
//! [`LlmError`] is not `Clone`, so queued failures use the cloneable
//! [`MockError`] and convert at dequeue time.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::chat::{ChatRole, ChatResponse};
use crate::error::LlmError;
use crate::provider::{ChatParams, Provider, ProviderMetadata};
use crate::stream::{ChatStream, StreamChunk};

/// Cloneable error subset for mock queuing.
#[derive(Debug, Clone)]
pub enum MockError {
    /// Maps to [`LlmError::Http`].
    Http {
        /// HTTP status code, if any.
        status: Option<http::StatusCode>,
        /// Error message.
        message: String,
        /// Whether the error is retryable.
        retryable: bool,
    },
    /// Maps to [`LlmError::Auth`].
    Auth(String),
    /// Maps to [`LlmError::InvalidRequest`].
    InvalidRequest(String),
    /// Maps to [`LlmError::Provider`].
    Provider {
        /// Provider error code.
        code: String,
        /// Error message.
        message: String,
        /// Whether the error is retryable.
        retryable: bool,
    },
    /// Maps to [`LlmError::Timeout`].
    Timeout {
        /// Elapsed milliseconds.
        elapsed_ms: u64,
    },
}

impl MockError {
    fn into_llm_error(self) -> LlmError {
        match self {
            Self::Http {
                status,
                message,
                retryable,
            } => LlmError::Http {
                status,
                message,
                retryable,
            },
            Self::Auth(msg) => LlmError::Auth(msg),
            Self::InvalidRequest(msg) => LlmError::InvalidRequest(msg),
            Self::Provider {
                code,
                message,
                retryable,
            } => LlmError::Provider {
                code,
                message,
                retryable,
            },
            Self::Timeout { elapsed_ms } => LlmError::Timeout { elapsed_ms },
        }
    }
}

/// A scripted stream: increments, then optionally a mid-stream failure.
#[derive(Debug, Clone)]
struct ScriptedStream {
    chunks: Vec<StreamChunk>,
    fail_with: Option<MockError>,
}

#[derive(Debug)]
struct Routed<T> {
    marker: String,
    item: T,
    delay: Duration,
}

#[derive(Debug, Default)]
struct Queues {
    responses: VecDeque<Result<ChatResponse, MockError>>,
    streams: VecDeque<Result<ScriptedStream, MockError>>,
    routed_responses: Vec<Routed<ChatResponse>>,
    routed_streams: Vec<Routed<ScriptedStream>>,
    calls: Vec<ChatParams>,
}

/// A queue-based mock provider for unit and integration tests.
///
/// Each `generate` or `stream` call first looks for a routed entry whose
/// marker appears in the last user message, then pops the front of the
/// plain queue. Every call records its [`ChatParams`].
///
/// # Panics
///
/// `generate` and `stream` panic when nothing is queued for them.
#[derive(Clone)]
pub struct MockProvider {
    queues: Arc<Mutex<Queues>>,
    meta: ProviderMetadata,
}

impl fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = self.queues.lock().unwrap();
        f.debug_struct("MockProvider")
            .field("meta", &self.meta)
            .field("queued_responses", &(q.responses.len() + q.routed_responses.len()))
            .field("queued_streams", &(q.streams.len() + q.routed_streams.len()))
            .field("recorded_calls", &q.calls.len())
            .finish()
    }
}

fn last_user_message(params: &ChatParams) -> &str {
    params
        .messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User)
        .map_or("", |m| m.content.as_str())
}

fn take_routed<T>(routed: &mut Vec<Routed<T>>, prompt: &str) -> Option<(T, Duration)> {
    let pos = routed.iter().position(|r| prompt.contains(&r.marker))?;
    let r = routed.remove(pos);
    Some((r.item, r.delay))
}

impl MockProvider {
    /// Creates a mock with the given metadata and empty queues.
    pub fn new(meta: ProviderMetadata) -> Self {
        Self {
            queues: Arc::new(Mutex::new(Queues::default())),
            meta,
        }
    }

    /// Enqueues a response for the next `generate` call.
    pub fn queue_response(&self, response: ChatResponse) -> &Self {
        self.queues.lock().unwrap().responses.push_back(Ok(response));
        self
    }

    /// Enqueues an error for the next `generate` call.
    pub fn queue_error(&self, error: MockError) -> &Self {
        self.queues.lock().unwrap().responses.push_back(Err(error));
        self
    }

    /// Returns `response` after `delay` to the `generate` call whose last
    /// user message contains `marker`.
    pub fn queue_response_for(
        &self,
        marker: impl Into<String>,
        response: ChatResponse,
        delay: Duration,
    ) -> &Self {
        self.queues.lock().unwrap().routed_responses.push(Routed {
            marker: marker.into(),
            item: response,
            delay,
        });
        self
    }

    /// Enqueues increments for the next `stream` call.
    pub fn queue_stream(&self, chunks: Vec<StreamChunk>) -> &Self {
        self.queues
            .lock()
            .unwrap()
            .streams
            .push_back(Ok(ScriptedStream {
                chunks,
                fail_with: None,
            }));
        self
    }

    /// Enqueues a stream that yields `chunks` and then fails with `error`.
    pub fn queue_stream_error(&self, chunks: Vec<StreamChunk>, error: MockError) -> &Self {
        self.queues
            .lock()
            .unwrap()
            .streams
            .push_back(Ok(ScriptedStream {
                chunks,
                fail_with: Some(error),
            }));
        self
    }

    /// Makes the next `stream` call fail before any increment is yielded.
    pub fn queue_open_error(&self, error: MockError) -> &Self {
        self.queues.lock().unwrap().streams.push_back(Err(error));
        self
    }

    /// Opens a stream of `chunks` after `delay` for the `stream` call whose
    /// last user message contains `marker`.
    pub fn queue_stream_for(
        &self,
        marker: impl Into<String>,
        chunks: Vec<StreamChunk>,
        delay: Duration,
    ) -> &Self {
        self.queues.lock().unwrap().routed_streams.push(Routed {
            marker: marker.into(),
            item: ScriptedStream {
                chunks,
                fail_with: None,
            },
            delay,
        });
        self
    }

    /// All `ChatParams` passed to `generate` or `stream`, in call order.
    pub fn recorded_calls(&self) -> Vec<ChatParams> {
        self.queues.lock().unwrap().calls.clone()
    }
}

impl Provider for MockProvider {
    async fn generate(&self, params: &ChatParams) -> Result<ChatResponse, LlmError> {
        let (result, delay) = {
            let mut q = self.queues.lock().unwrap();
            q.calls.push(params.clone());
            match take_routed(&mut q.routed_responses, last_user_message(params)) {
                Some((response, delay)) => (Ok(response), delay),
                None => (
                    q.responses
                        .pop_front()
                        .expect("MockProvider: no queued responses remaining"),
                    Duration::ZERO,
                ),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result.map_err(MockError::into_llm_error)
    }

    async fn stream(&self, params: &ChatParams) -> Result<ChatStream, LlmError> {
        let (result, delay) = {
            let mut q = self.queues.lock().unwrap();
            q.calls.push(params.clone());
            match take_routed(&mut q.routed_streams, last_user_message(params)) {
                Some((script, delay)) => (Ok(script), delay),
                None => (
                    q.streams
                        .pop_front()
                        .expect("MockProvider: no queued stream responses remaining"),
                    Duration::ZERO,
                ),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let script = result.map_err(MockError::into_llm_error)?;
        let failure = script.fail_with.map(|e| Err(e.into_llm_error()));
        let items = script.chunks.into_iter().map(Ok).chain(failure);
        Ok(Box::pin(futures::stream::iter(items)))
    }

    fn metadata(&self) -> ProviderMetadata {
        self.meta.clone()
    }
}
