//! Best-effort repair of almost-JSON model output.
//!
//! Models asked for structured output often wrap it in markdown fences,
//! leave keys unquoted, use single quotes, leave trailing commas, or stop
//! mid-value when they hit the token limit. [`repair_json`] rewrites the
//! common cases into valid JSON; [`parse_lenient`] tries a strict parse
//! first and only repairs on failure.
//!
//! ```rust
//! use llm_conduit::repair::parse_lenient;
//! use serde_json::json;
//!
//! let v = parse_lenient("```json\n{name: 'Ada', tags: ['x', 'y',],\n```").unwrap();
//! assert_eq!(v, json!({"name": "Ada", "tags": ["x", "y"]}));
//! ```

use serde_json::Value;

/// Parses `input` strictly, falling back to [`repair_json`].
///
/// The returned error is the one from parsing the repaired text.
pub fn parse_lenient(input: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(input).or_else(|_| {
        let repaired = repair_json(input);
        tracing::debug!(repaired = %repaired, "strict parse failed, trying repaired JSON");
        serde_json::from_str(&repaired)
    })
}

/// Rewrites `input` into something more likely to be valid JSON.
///
/// The result is not guaranteed to parse.
pub fn repair_json(input: &str) -> String {
    let body = strip_code_fences(input).trim();
    let start = body.find(['{', '[']).unwrap_or(0);
    let chars: Vec<char> = body[start..].chars().collect();

    let mut out = String::with_capacity(chars.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => {
                i = copy_string(&chars, i, &mut out);
                continue;
            }
            '{' => {
                closers.push('}');
                out.push(c);
            }
            '[' => {
                closers.push(']');
                out.push(c);
            }
            '}' | ']' => {
                strip_trailing_comma(&mut out);
                if closers.last() == Some(&c) {
                    closers.pop();
                }
                out.push(c);
            }
            c if is_ident_start(c) && expects_key(&out) => {
                let end = chars[i..]
                    .iter()
                    .position(|ch| !is_ident_char(*ch))
                    .map_or(chars.len(), |p| i + p);
                let ident: String = chars[i..end].iter().collect();
                let next = chars[end..].iter().find(|ch| !ch.is_whitespace());
                if next == Some(&':') {
                    out.push('"');
                    out.push_str(&ident);
                    out.push('"');
                } else {
                    out.push_str(&ident);
                }
                i = end;
                continue;
            }
            _ => out.push(c),
        }
        i += 1;
    }

    strip_trailing_comma(&mut out);
    if out.trim_end().ends_with(':') {
        out.push_str("null");
    }
    while let Some(close) = closers.pop() {
        out.push(close);
    }
    out
}

/// Returns the contents of the first fenced block, or `input` unchanged.
fn strip_code_fences(input: &str) -> &str {
    let Some(open) = input.find("```") else {
        return input;
    };
    let after = &input[open + 3..];
    // Skip the info string (e.g. "json") up to the end of the fence line.
    let body_start = after.find('\n').map_or(after.len(), |p| p + 1);
    let body = &after[body_start..];
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

/// Copies a string literal starting at `chars[start]`, normalizing it to
/// double quotes and closing it if the input ends first. Returns the index
/// after the literal.
fn copy_string(chars: &[char], start: usize, out: &mut String) -> usize {
    let quote = chars[start];
    out.push('"');
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            match chars.get(i + 1) {
                Some('\'') if quote == '\'' => out.push('\''),
                Some(next) => {
                    out.push('\\');
                    out.push(*next);
                }
                None => {}
            }
            i += 2;
            continue;
        }
        if c == quote {
            out.push('"');
            return i + 1;
        }
        match c {
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
        i += 1;
    }
    out.push('"');
    chars.len()
}

fn strip_trailing_comma(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    if out[..trimmed_len].ends_with(',') {
        out.truncate(trimmed_len - 1);
    }
}

fn expects_key(out: &str) -> bool {
    matches!(out.trim_end().chars().last(), Some('{' | ','))
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '-'
}
