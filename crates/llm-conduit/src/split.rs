//! Splitting oversized input into ordered chunks.
//!
//! A [`DataSplitter`] turns caller data plus an instruction into
//! [`DataChunk`]s sized to a model's budget. The default [`TextSplitter`]
//! packs paragraphs greedily and only breaks inside a paragraph when it
//! alone exceeds the budget, falling back to lines, then words, then raw
//! characters. Separators stay inside the chunks, so concatenating every
//! chunk's `content` reproduces the input exactly.
//!
//! ```rust
//! use llm_conduit::config::SplitConfig;
//! use llm_conduit::split::{DataSplitter, TextSplitter};
//!
//! let splitter = TextSplitter::new(SplitConfig { max_tokens: 5, chars_per_token: 4 });
//! let text = "first paragraph\n\nsecond paragraph";
//! let chunks = splitter.split(text, "Summarize");
//! assert_eq!(chunks.len(), 2);
//! let joined: String = chunks.iter().map(|c| c.content.as_str()).collect();
//! assert_eq!(joined, text);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SplitConfig;
use crate::error::LlmError;
use crate::usage::estimate_tokens;

/// One slice of caller data, tagged with its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChunk {
    /// Zero-based position in the original data.
    pub index: usize,
    /// The raw slice.
    pub content: String,
    /// Instruction repeated with every chunk.
    pub instruction: String,
    /// Estimated token count of `content`.
    pub token_estimate: u64,
}

impl DataChunk {
    /// Builds a chunk, estimating its tokens.
    pub fn new(index: usize, content: impl Into<String>, instruction: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            index,
            token_estimate: estimate_tokens(&content),
            content,
            instruction: instruction.into(),
        }
    }

    /// The user message sent for this chunk.
    pub fn prompt(&self) -> String {
        if self.instruction.is_empty() {
            self.content.clone()
        } else {
            format!("{}\n\n{}", self.instruction, self.content)
        }
    }
}

/// Produces ordered chunks whose contents concatenate to the input.
pub trait DataSplitter: Send + Sync {
    /// Splits `data`, attaching `instruction` to every chunk.
    fn split(&self, data: &str, instruction: &str) -> Vec<DataChunk>;
}

/// Structure-aware plain-text splitter.
#[derive(Debug, Clone, Default)]
pub struct TextSplitter {
    config: SplitConfig,
}

impl TextSplitter {
    /// A splitter with the given budget.
    pub fn new(config: SplitConfig) -> Self {
        Self { config }
    }
}

impl DataSplitter for TextSplitter {
    fn split(&self, data: &str, instruction: &str) -> Vec<DataChunk> {
        let max = self.config.max_chars();
        let mut pieces = Vec::new();
        let mut current = String::new();
        pack(data, max, Level::Paragraph, &mut pieces, &mut current);
        if !current.is_empty() {
            pieces.push(current);
        }
        tracing::debug!(chunks = pieces.len(), max_chars = max, "split input");
        pieces
            .into_iter()
            .enumerate()
            .map(|(i, content)| DataChunk::new(i, content, instruction))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Level {
    Paragraph,
    Line,
    Word,
    Char,
}

impl Level {
    fn finer(self) -> Self {
        match self {
            Self::Paragraph => Self::Line,
            Self::Line => Self::Word,
            Self::Word | Self::Char => Self::Char,
        }
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn pieces_at(text: &str, level: Level, max: usize) -> Vec<&str> {
    match level {
        Level::Paragraph => text.split_inclusive("\n\n").collect(),
        Level::Line => text.split_inclusive('\n').collect(),
        Level::Word => text.split_inclusive(' ').collect(),
        Level::Char => {
            let mut out = Vec::new();
            let mut start = 0;
            for (count, (pos, _)) in text.char_indices().enumerate() {
                if count > 0 && count % max == 0 {
                    out.push(&text[start..pos]);
                    start = pos;
                }
            }
            out.push(&text[start..]);
            out
        }
    }
}

fn pack(text: &str, max: usize, level: Level, out: &mut Vec<String>, current: &mut String) {
    for piece in pieces_at(text, level, max) {
        let n = char_len(piece);
        if char_len(current) + n <= max {
            current.push_str(piece);
            continue;
        }
        if !current.is_empty() {
            out.push(std::mem::take(current));
        }
        if n <= max {
            current.push_str(piece);
        } else {
            pack(piece, max, level.finer(), out, current);
        }
    }
}

/// Splits a JSON array into chunks of whole elements.
///
/// Each chunk's content is itself a JSON array whose serialized length
/// fits `config` (a single oversized element gets a chunk of its own).
///
/// # Errors
///
/// [`LlmError::InvalidRequest`] if `data` is not an array.
pub fn split_json_array(
    data: &Value,
    instruction: &str,
    config: &SplitConfig,
) -> Result<Vec<DataChunk>, LlmError> {
    let Value::Array(items) = data else {
        return Err(LlmError::InvalidRequest("expected a JSON array to split".into()));
    };
    let max = config.max_chars();
    let mut groups: Vec<Vec<&Value>> = Vec::new();
    let mut current: Vec<&Value> = Vec::new();
    // "[]" plus one comma per extra element.
    let mut current_len = 2;
    for item in items {
        let len = item.to_string().len();
        let added = if current.is_empty() { len } else { len + 1 };
        if !current.is_empty() && current_len + added > max {
            groups.push(std::mem::take(&mut current));
            current_len = 2;
        }
        current_len += if current.is_empty() { len } else { len + 1 };
        current.push(item);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
        .into_iter()
        .enumerate()
        .map(|(i, group)| Ok(DataChunk::new(i, serde_json::to_string(&group)?, instruction)))
        .collect()
}
