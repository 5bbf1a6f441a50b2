//! In-memory conversation history.
//!
//! A [`ConversationHistory`] is an ordered list of messages plus one
//! replaceable system-message slot. Stored messages are never edited in
//! place; empty messages are rejected on the way in.
//!
//! The chunk controller owns one [`SharedHistory`]. Each chunk exchange
//! writes into its own staged history, and the controller commits staged
//! histories in chunk order, so the shared history only ever has a single
//! writer and follows logical order rather than completion order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::chat::ChatMessage;

/// Ordered conversation messages and an optional system message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationHistory {
    system: Option<String>,
    messages: Vec<ChatMessage>,
}

impl ConversationHistory {
    /// An empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// A history with the given system message.
    pub fn with_system(system: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            messages: Vec::new(),
        }
    }

    /// Appends `message` unless it is empty. Returns whether it was stored.
    pub fn push(&mut self, message: ChatMessage) -> bool {
        if message.is_empty() {
            tracing::debug!(role = ?message.role, "dropping empty message");
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Appends every non-empty message, in order.
    pub fn extend(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        for m in messages {
            self.push(m);
        }
    }

    /// Replaces the system message.
    pub fn set_system(&mut self, system: impl Into<String>) {
        self.system = Some(system.into());
    }

    /// The system message, if set.
    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    /// Stored messages, oldest first.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Consumes the history, returning its messages.
    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }

    /// Number of stored messages (the system slot is not counted).
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether no messages are stored.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Removes all messages; the system slot is kept.
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

/// A history shared between the controller and its pipelines.
pub type SharedHistory = Arc<Mutex<ConversationHistory>>;

/// Wraps `history` as a [`SharedHistory`].
pub fn shared(history: ConversationHistory) -> SharedHistory {
    Arc::new(Mutex::new(history))
}

/// Locks a shared history, recovering from poisoning.
///
/// History mutations are single pushes, so a panicking holder cannot
/// leave it half-written.
pub fn lock(history: &SharedHistory) -> MutexGuard<'_, ConversationHistory> {
    history.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ToolCall;

    #[test]
    fn test_push_drops_empty() {
        let mut h = ConversationHistory::new();
        assert!(!h.push(ChatMessage::assistant("")));
        assert!(h.push(ChatMessage::user("hi")));
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_push_keeps_tool_call_only_message() {
        let mut h = ConversationHistory::new();
        let call = ToolCall {
            id: "c1".into(),
            name: "t".into(),
            arguments: serde_json::json!({}),
        };
        assert!(h.push(ChatMessage::assistant_with_tool_calls("", vec![call])));
    }

    #[test]
    fn test_extend_preserves_order() {
        let mut h = ConversationHistory::new();
        h.extend([
            ChatMessage::user("a"),
            ChatMessage::assistant(""),
            ChatMessage::assistant("b"),
        ]);
        let contents: Vec<_> = h.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["a", "b"]);
    }

    #[test]
    fn test_system_slot_is_replaceable() {
        let mut h = ConversationHistory::with_system("one");
        h.set_system("two");
        assert_eq!(h.system(), Some("two"));
        h.push(ChatMessage::user("x"));
        h.clear();
        assert!(h.is_empty());
        assert_eq!(h.system(), Some("two"));
    }

    #[test]
    fn test_shared_history() {
        let h = shared(ConversationHistory::new());
        lock(&h).push(ChatMessage::user("hi"));
        assert_eq!(lock(&h).len(), 1);
    }
}
