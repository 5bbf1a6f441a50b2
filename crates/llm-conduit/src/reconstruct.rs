//! Tool-call reconstruction from fragmented argument deltas.
//!
//! Vendors stream a tool call's JSON arguments in arbitrary pieces. The
//! [`ToolCallReconstructor`] keeps one accumulator per call index and
//! emits a [`ToolCall`] as soon as the buffer holds a complete JSON value.
//!
//! # Completion
//!
//! After every delta the buffer is scanned for bracket depth, skipping
//! brackets inside string literals. When it starts with `{` or `[` and
//! the depth returns to zero, the buffer is parsed; success completes the
//! call. A balanced buffer that still fails to parse stays open.
//!
//! An accumulator that has not completed [`TOOL_CALL_TIMEOUT`] after its
//! first event is force-completed with `{"value": <raw buffer>}`.
//!
//! # Finish
//!
//! When the stream finishes, [`finish`](ToolCallReconstructor::finish)
//! makes one last parse attempt for every open accumulator. Buffers that
//! still fail are returned as [`DiscardedToolCall`]s (and logged) so the
//! caller can surface them. A stream that fails instead calls
//! [`abandon`](ToolCallReconstructor::abandon): open buffers are dropped
//! without a parse attempt.
//!
//! # Indices
//!
//! Adapters key deltas either by a numeric index or by a vendor item id.
//! Both are mapped to internal slots: a numeric index keeps its own value
//! when free, and item ids take the lowest free slot in first-seen order,
//! so the two keyings never share an accumulator.
//!
//! All time-dependent methods have an `_at` variant taking the current
//! [`Instant`], which keeps timeout behaviour testable.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::chat::ToolCall;
use crate::stream::ToolCallDelta;

/// Time after an accumulator's first event at which it is force-completed.
pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Debug)]
struct Accumulator {
    id: Option<String>,
    name: String,
    buffer: String,
    started_at: Instant,
}

impl Accumulator {
    fn into_call(self, index: u32, arguments: Value) -> ToolCall {
        ToolCall {
            id: self.id.unwrap_or_else(|| format!("call_{index}")),
            name: self.name,
            arguments,
        }
    }
}

/// A tool call whose arguments never became valid JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardedToolCall {
    /// Call index within the exchange.
    pub index: u32,
    /// Tool name, if one was announced.
    pub name: String,
    /// The raw argument buffer.
    pub raw: String,
}

impl fmt::Display for DiscardedToolCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "discarded tool call #{} ({}): unparseable arguments {:?}",
            self.index, self.name, self.raw
        )
    }
}

/// Result of [`ToolCallReconstructor::finish`].
#[derive(Debug, Default)]
pub struct FinishOutcome {
    /// Calls completed by the finish pass, in index order.
    pub completed: Vec<ToolCall>,
    /// Calls that could not be completed.
    pub discarded: Vec<DiscardedToolCall>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CallKey {
    Index(u32),
    Item(String),
}

/// Per-stream tool-call reassembly state.
///
/// One instance serves one stream; call [`reset`](Self::reset) before
/// reusing it.
#[derive(Debug)]
pub struct ToolCallReconstructor {
    timeout: Duration,
    open: BTreeMap<u32, Accumulator>,
    completed: BTreeMap<u32, ToolCall>,
    slots: HashMap<CallKey, u32>,
}

impl Default for ToolCallReconstructor {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallReconstructor {
    /// A reconstructor using [`TOOL_CALL_TIMEOUT`].
    pub fn new() -> Self {
        Self::with_timeout(TOOL_CALL_TIMEOUT)
    }

    /// A reconstructor with a custom per-call timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            open: BTreeMap::new(),
            completed: BTreeMap::new(),
            slots: HashMap::new(),
        }
    }

    /// Feeds one delta. Returns the call if this delta completed it.
    pub fn push_delta(&mut self, delta: &ToolCallDelta) -> Option<ToolCall> {
        self.push_delta_at(delta, Instant::now())
    }

    /// [`push_delta`](Self::push_delta) with an explicit clock.
    pub fn push_delta_at(&mut self, delta: &ToolCallDelta, now: Instant) -> Option<ToolCall> {
        let index = self.resolve_index(delta);
        if self.completed.contains_key(&index) {
            tracing::debug!(index, "ignoring delta for completed tool call");
            return None;
        }

        let acc = self.open.entry(index).or_insert_with(|| Accumulator {
            id: None,
            name: String::new(),
            buffer: String::new(),
            started_at: now,
        });
        if acc.id.is_none() {
            acc.id.clone_from(&delta.id);
        }
        if let Some(name) = delta.name.as_deref().filter(|n| !n.is_empty()) {
            if acc.name.is_empty() {
                name.clone_into(&mut acc.name);
            }
        }
        if let Some(fragment) = &delta.arguments {
            acc.buffer.push_str(fragment);
        }

        let arguments = if is_balanced(&acc.buffer) {
            serde_json::from_str::<Value>(&acc.buffer).ok()
        } else {
            None
        };
        let arguments = arguments.or_else(|| {
            (now.saturating_duration_since(acc.started_at) >= self.timeout).then(|| {
                tracing::warn!(index, raw = %acc.buffer, "tool call timed out, forcing completion");
                wrap_raw(&acc.buffer)
            })
        })?;
        Some(self.complete(index, arguments))
    }

    /// Force-completes every accumulator older than the timeout.
    pub fn expire(&mut self) -> Vec<ToolCall> {
        self.expire_at(Instant::now())
    }

    /// [`expire`](Self::expire) with an explicit clock.
    pub fn expire_at(&mut self, now: Instant) -> Vec<ToolCall> {
        let expired: Vec<u32> = self
            .open
            .iter()
            .filter(|(_, acc)| now.saturating_duration_since(acc.started_at) >= self.timeout)
            .map(|(index, _)| *index)
            .collect();
        expired
            .into_iter()
            .filter_map(|index| {
                let raw = self.open.get(&index)?.buffer.clone();
                tracing::warn!(index, raw = %raw, "tool call timed out, forcing completion");
                Some(self.complete(index, wrap_raw(&raw)))
            })
            .collect()
    }

    /// Attempts to complete every open accumulator.
    pub fn finish(&mut self) -> FinishOutcome {
        self.finish_at(Instant::now())
    }

    /// [`finish`](Self::finish) with an explicit clock.
    pub fn finish_at(&mut self, now: Instant) -> FinishOutcome {
        let mut outcome = FinishOutcome::default();
        for (index, acc) in std::mem::take(&mut self.open) {
            let arguments = if acc.buffer.trim().is_empty() {
                Some(Value::Object(serde_json::Map::new()))
            } else if let Ok(v) = serde_json::from_str::<Value>(&acc.buffer) {
                Some(v)
            } else if now.saturating_duration_since(acc.started_at) >= self.timeout {
                Some(wrap_raw(&acc.buffer))
            } else {
                None
            };
            match arguments {
                Some(arguments) => {
                    let call = acc.into_call(index, arguments);
                    self.completed.insert(index, call.clone());
                    outcome.completed.push(call);
                }
                None => {
                    tracing::warn!(index, name = %acc.name, raw = %acc.buffer, "discarding unparseable tool call");
                    outcome.discarded.push(DiscardedToolCall {
                        index,
                        name: acc.name,
                        raw: acc.buffer,
                    });
                }
            }
        }
        outcome
    }

    /// Drops every open accumulator without completing it.
    ///
    /// Used when the stream fails: partial arguments are reported, never
    /// turned into calls.
    pub fn abandon(&mut self) -> Vec<DiscardedToolCall> {
        std::mem::take(&mut self.open)
            .into_iter()
            .map(|(index, acc)| {
                tracing::warn!(index, name = %acc.name, raw = %acc.buffer, "abandoning partial tool call");
                DiscardedToolCall {
                    index,
                    name: acc.name,
                    raw: acc.buffer,
                }
            })
            .collect()
    }

    /// Every call completed so far, in index order.
    pub fn completed(&self) -> Vec<ToolCall> {
        self.completed.values().cloned().collect()
    }

    /// Number of calls still accumulating.
    pub fn pending(&self) -> usize {
        self.open.len()
    }

    /// Discards all state; indices restart at 0.
    pub fn reset(&mut self) {
        self.open.clear();
        self.completed.clear();
        self.slots.clear();
    }

    fn resolve_index(&mut self, delta: &ToolCallDelta) -> u32 {
        let (key, preferred) = match &delta.item_id {
            Some(item_id) => (CallKey::Item(item_id.clone()), 0),
            None => (CallKey::Index(delta.index), delta.index),
        };
        if let Some(slot) = self.slots.get(&key) {
            return *slot;
        }
        let taken: HashSet<u32> = self.slots.values().copied().collect();
        let slot = (preferred..=u32::MAX)
            .find(|s| !taken.contains(s))
            .unwrap_or(u32::MAX);
        if slot != preferred && matches!(key, CallKey::Index(_)) {
            tracing::debug!(index = delta.index, slot, "tool call index already mapped, using next free slot");
        }
        self.slots.insert(key, slot);
        slot
    }

    fn complete(&mut self, index: u32, arguments: Value) -> ToolCall {
        let call = match self.open.remove(&index) {
            Some(acc) => acc.into_call(index, arguments),
            None => ToolCall {
                id: format!("call_{index}"),
                name: String::new(),
                arguments,
            },
        };
        self.completed.insert(index, call.clone());
        call
    }
}

fn wrap_raw(raw: &str) -> Value {
    serde_json::json!({ "value": raw })
}

/// Whether `buf` starts a JSON object/array and closes it again.
fn is_balanced(buf: &str) -> bool {
    let trimmed = buf.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return false;
    }
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for c in trimmed.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0 && !in_string
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ARGS: &str = r#"{"city": "Paris", "days": [1, 2, 3], "note": "a } tricky { string \" here"}"#;

    fn feed(rec: &mut ToolCallReconstructor, pieces: &[&str], now: Instant) -> Vec<ToolCall> {
        let mut out = Vec::new();
        out.extend(rec.push_delta_at(&ToolCallDelta::start(0, "c1", "weather"), now));
        for p in pieces {
            out.extend(rec.push_delta_at(&ToolCallDelta::arguments(0, *p), now));
        }
        out
    }

    #[test]
    fn test_single_delta() {
        let mut rec = ToolCallReconstructor::new();
        let calls = feed(&mut rec, &[ARGS], Instant::now());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].name, "weather");
        assert_eq!(calls[0].arguments, serde_json::from_str::<Value>(ARGS).unwrap());
    }

    #[test]
    fn test_chunking_does_not_change_result() {
        let expected: Value = serde_json::from_str(ARGS).unwrap();
        let now = Instant::now();

        let byte_pieces: Vec<String> = ARGS.chars().map(String::from).collect();
        let byte_refs: Vec<&str> = byte_pieces.iter().map(String::as_str).collect();
        let n_pieces: Vec<&str> = vec![&ARGS[..7], &ARGS[7..30], &ARGS[30..55], &ARGS[55..]];

        for pieces in [vec![ARGS], n_pieces, byte_refs] {
            let mut rec = ToolCallReconstructor::new();
            let calls = feed(&mut rec, &pieces, now);
            assert_eq!(calls.len(), 1, "exactly one completion per call");
            assert_eq!(calls[0].arguments, expected);
            assert_eq!(rec.pending(), 0);
            assert!(rec.finish_at(now).completed.is_empty());
        }
    }

    #[test]
    fn test_brace_inside_string_does_not_complete() {
        let mut rec = ToolCallReconstructor::new();
        let now = Instant::now();
        assert!(feed(&mut rec, &[r#"{"a": "}"#], now).is_empty());
        assert_eq!(rec.pending(), 1);
        let done = rec.push_delta_at(&ToolCallDelta::arguments(0, r#""}"#), now);
        assert_eq!(done.unwrap().arguments, json!({"a": "}"}));
    }

    #[test]
    fn test_timeout_forces_completion() {
        let mut rec = ToolCallReconstructor::new();
        let t0 = Instant::now();
        assert!(feed(&mut rec, &[r#"{"q": "unterminated"#], t0).is_empty());
        assert!(rec.expire_at(t0 + Duration::from_millis(9_999)).is_empty());

        let expired = rec.expire_at(t0 + TOOL_CALL_TIMEOUT);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].arguments, json!({"value": r#"{"q": "unterminated"#}));
        assert_eq!(rec.pending(), 0);
        assert_eq!(rec.completed().len(), 1);
    }

    #[test]
    fn test_timeout_measured_from_first_delta_of_each_call() {
        let mut rec = ToolCallReconstructor::new();
        let t0 = Instant::now();
        rec.push_delta_at(&ToolCallDelta::start(0, "a", "t"), t0);
        rec.push_delta_at(&ToolCallDelta::arguments(0, "{"), t0);
        let t1 = t0 + Duration::from_secs(6);
        rec.push_delta_at(&ToolCallDelta::start(1, "b", "t"), t1);
        rec.push_delta_at(&ToolCallDelta::arguments(1, "{"), t1);

        let expired = rec.expire_at(t0 + Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "a");
        assert_eq!(rec.pending(), 1);
    }

    #[test]
    fn test_late_delta_completes_after_timeout() {
        let mut rec = ToolCallReconstructor::new();
        let t0 = Instant::now();
        feed(&mut rec, &["{\"x\": "], t0);
        let call = rec
            .push_delta_at(&ToolCallDelta::arguments(0, "tru"), t0 + Duration::from_secs(11))
            .unwrap();
        assert_eq!(call.arguments, json!({"value": "{\"x\": tru"}));
    }

    #[test]
    fn test_deltas_after_completion_are_ignored() {
        let mut rec = ToolCallReconstructor::new();
        let now = Instant::now();
        feed(&mut rec, &["{}"], now);
        assert!(rec.push_delta_at(&ToolCallDelta::arguments(0, "{}"), now).is_none());
        assert_eq!(rec.completed().len(), 1);
        assert_eq!(rec.pending(), 0);
    }

    #[test]
    fn test_balanced_but_invalid_stays_open() {
        let mut rec = ToolCallReconstructor::new();
        let now = Instant::now();
        assert!(feed(&mut rec, &["{a: 1}"], now).is_empty());
        assert_eq!(rec.pending(), 1);
    }

    #[test]
    fn test_finish_discards_unparseable() {
        let mut rec = ToolCallReconstructor::new();
        let now = Instant::now();
        feed(&mut rec, &["{\"a\": 1,"], now);
        rec.push_delta_at(&ToolCallDelta::start(1, "c2", "noargs"), now);

        let outcome = rec.finish_at(now);
        assert_eq!(outcome.completed.len(), 1);
        assert_eq!(outcome.completed[0].name, "noargs");
        assert_eq!(outcome.completed[0].arguments, json!({}));
        assert_eq!(outcome.discarded.len(), 1);
        assert_eq!(outcome.discarded[0].raw, "{\"a\": 1,");
        assert!(outcome.discarded[0].to_string().contains("weather"));
        assert_eq!(rec.pending(), 0);
    }

    #[test]
    fn test_finish_after_timeout_wraps_instead_of_discarding() {
        let mut rec = ToolCallReconstructor::new();
        let t0 = Instant::now();
        feed(&mut rec, &["not json"], t0);
        let outcome = rec.finish_at(t0 + TOOL_CALL_TIMEOUT);
        assert!(outcome.discarded.is_empty());
        assert_eq!(outcome.completed[0].arguments, json!({"value": "not json"}));
    }

    #[test]
    fn test_item_ids_map_to_first_seen_indices() {
        let mut rec = ToolCallReconstructor::new();
        let now = Instant::now();
        let delta = |item: &str, name: Option<&str>, args: Option<&str>| ToolCallDelta {
            index: 99,
            item_id: Some(item.into()),
            id: None,
            name: name.map(String::from),
            arguments: args.map(String::from),
        };
        rec.push_delta_at(&delta("item_b", Some("second"), None), now);
        rec.push_delta_at(&delta("item_a", Some("first"), None), now);
        rec.push_delta_at(&delta("item_a", None, Some("{}")), now);
        rec.push_delta_at(&delta("item_b", None, Some("[1]")), now);

        let calls = rec.completed();
        assert_eq!(calls[0].name, "second");
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[0].arguments, json!([1]));
        assert_eq!(calls[1].name, "first");
    }

    #[test]
    fn test_interleaved_indices_complete_independently() {
        let mut rec = ToolCallReconstructor::new();
        let now = Instant::now();
        rec.push_delta_at(&ToolCallDelta::start(0, "a", "one"), now);
        rec.push_delta_at(&ToolCallDelta::start(1, "b", "two"), now);
        rec.push_delta_at(&ToolCallDelta::arguments(1, "{\"y\":"), now);
        rec.push_delta_at(&ToolCallDelta::arguments(0, "{\"x\":"), now);
        assert!(rec.push_delta_at(&ToolCallDelta::arguments(0, "1}"), now).is_some());
        assert_eq!(rec.pending(), 1);
        assert!(rec.push_delta_at(&ToolCallDelta::arguments(1, "2}"), now).is_some());
        let names: Vec<_> = rec.completed().into_iter().map(|c| c.name).collect();
        assert_eq!(names, ["one", "two"]);
    }

    #[test]
    fn test_reset_restarts_indices() {
        let mut rec = ToolCallReconstructor::new();
        let now = Instant::now();
        let item = ToolCallDelta {
            item_id: Some("x".into()),
            name: Some("t".into()),
            ..ToolCallDelta::default()
        };
        rec.push_delta_at(&item, now);
        rec.push_delta_at(
            &ToolCallDelta {
                item_id: Some("y".into()),
                ..item.clone()
            },
            now,
        );
        rec.reset();
        assert_eq!(rec.pending(), 0);
        assert!(rec.completed().is_empty());
        rec.push_delta_at(
            &ToolCallDelta {
                item_id: Some("z".into()),
                arguments: Some("{}".into()),
                ..item
            },
            now,
        );
        assert_eq!(rec.completed()[0].id, "call_0");
    }

    #[test]
    fn test_timeout_with_empty_buffer_wraps_empty_string() {
        let mut rec = ToolCallReconstructor::new();
        let t0 = Instant::now();
        rec.push_delta_at(&ToolCallDelta::start(0, "c1", "ping"), t0);
        let expired = rec.expire_at(t0 + TOOL_CALL_TIMEOUT);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].arguments, json!({"value": ""}));
    }

    #[test]
    fn test_mixed_index_and_item_keys_do_not_collide() {
        let mut rec = ToolCallReconstructor::new();
        let now = Instant::now();
        rec.push_delta_at(&ToolCallDelta::start(0, "plain", "one"), now);
        let keyed = ToolCallDelta {
            item_id: Some("item_x".into()),
            id: Some("keyed".into()),
            name: Some("two".into()),
            ..ToolCallDelta::default()
        };
        rec.push_delta_at(&keyed, now);
        rec.push_delta_at(&ToolCallDelta::start(1, "plain_b", "three"), now);
        assert_eq!(rec.pending(), 3);

        rec.push_delta_at(&ToolCallDelta::arguments(0, r#"{"a":1}"#), now);
        rec.push_delta_at(
            &ToolCallDelta {
                item_id: Some("item_x".into()),
                arguments: Some(r#"{"b":2}"#.into()),
                ..ToolCallDelta::default()
            },
            now,
        );
        rec.push_delta_at(&ToolCallDelta::arguments(1, r#"{"c":3}"#), now);

        let calls = rec.completed();
        let summary: Vec<_> = calls.iter().map(|c| (c.id.as_str(), c.name.as_str())).collect();
        assert_eq!(summary, [("plain", "one"), ("keyed", "two"), ("plain_b", "three")]);
        assert_eq!(calls[1].arguments, json!({"b": 2}));
        assert_eq!(calls[2].arguments, json!({"c": 3}));
    }

    #[test]
    fn test_abandon_reports_open_buffers_only() {
        let mut rec = ToolCallReconstructor::new();
        let now = Instant::now();
        feed(&mut rec, &["{}"], now);
        rec.push_delta_at(&ToolCallDelta::start(1, "c2", "lookup"), now);
        rec.push_delta_at(&ToolCallDelta::arguments(1, "{\"k\": "), now);

        let dropped = rec.abandon();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].name, "lookup");
        assert_eq!(dropped[0].raw, "{\"k\": ");
        assert_eq!(rec.pending(), 0);
        assert_eq!(rec.completed().len(), 1);
    }

    #[test]
    fn test_is_balanced() {
        assert!(is_balanced("{}"));
        assert!(is_balanced("  [1, {\"a\": [2]}]"));
        assert!(is_balanced(r#"{"s": "\"}\""}"#));
        assert!(!is_balanced(""));
        assert!(!is_balanced("\"str\""));
        assert!(!is_balanced("{\"a\": ["));
        assert!(!is_balanced("}{"));
    }
}
