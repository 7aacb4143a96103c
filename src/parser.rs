//! Tagged-content parser
//!
//! Turns the raw text of a model response into ordered text and tool-use
//! blocks. The model invokes a tool with:
//!
//! ```text
//! <use_tool>
//!   <tool_name>read</tool_name>
//!   <arguments>{"path": "src/lib.rs"}</arguments>
//! </use_tool>
//! ```
//!
//! `parse` is a pure function over the whole accumulated text. Calling it on
//! every prefix of a stream yields the same completed blocks as calling it
//! once on the final text, so callers can re-derive partial state on every
//! chunk without keeping parser state around. Malformed payloads never raise;
//! they degrade to `_error`/`_raw` params.

use crate::types::{ContentBlock, ToolParams};
use serde_json::Value;

pub const USE_TOOL_OPEN: &str = "<use_tool>";
pub const USE_TOOL_CLOSE: &str = "</use_tool>";
pub const TOOL_NAME_OPEN: &str = "<tool_name>";
pub const TOOL_NAME_CLOSE: &str = "</tool_name>";
pub const ARGUMENTS_OPEN: &str = "<arguments>";
pub const ARGUMENTS_CLOSE: &str = "</arguments>";
/// Legacy alias of `<arguments>`
pub const ARGUMENT_OPEN: &str = "<argument>";
pub const ARGUMENT_CLOSE: &str = "</argument>";

/// Every tag the parser interprets
pub const RECOGNIZED_TAGS: [&str; 8] = [
    USE_TOOL_OPEN,
    USE_TOOL_CLOSE,
    TOOL_NAME_OPEN,
    TOOL_NAME_CLOSE,
    ARGUMENTS_OPEN,
    ARGUMENTS_CLOSE,
    ARGUMENT_OPEN,
    ARGUMENT_CLOSE,
];

/// How many trailing characters are inspected for a dangling tag prefix
pub const SUPPRESSION_WINDOW: usize = 15;

const INCOMPLETE_JSON: &str = "Incomplete JSON";

/// Parse accumulated response text into content blocks
pub fn parse(text: &str) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    let mut pos = 0;

    while pos < text.len() {
        let rest = &text[pos..];
        match rest.find(USE_TOOL_OPEN) {
            Some(offset) => {
                push_text(&mut blocks, &rest[..offset], false);
                pos += offset + USE_TOOL_OPEN.len();
                let (block, consumed) = parse_tool_block(&text[pos..]);
                blocks.push(block);
                pos += consumed;
            }
            None => {
                push_text(&mut blocks, rest, true);
                break;
            }
        }
    }

    blocks
}

fn push_text(blocks: &mut Vec<ContentBlock>, raw: &str, partial: bool) {
    let content = raw.trim();
    if !content.is_empty() {
        blocks.push(ContentBlock::text(content, partial));
    }
}

/// Scan the inside of a `<use_tool>` block.
///
/// Returns the block and the number of bytes consumed, including the closing
/// tag when one was found.
fn parse_tool_block(input: &str) -> (ContentBlock, usize) {
    let mut name = String::new();
    let mut params = ToolParams::new();
    let mut pos = 0;

    while pos < input.len() {
        let rest = &input[pos..];

        if rest.starts_with(USE_TOOL_CLOSE) {
            let block = ContentBlock::ToolUse {
                name,
                params,
                partial: false,
                call_id: None,
            };
            return (block, pos + USE_TOOL_CLOSE.len());
        }

        if let Some(value) = rest.strip_prefix(TOOL_NAME_OPEN) {
            match value.find(TOOL_NAME_CLOSE) {
                Some(end) => {
                    name = value[..end].trim().to_string();
                    pos += TOOL_NAME_OPEN.len() + end + TOOL_NAME_CLOSE.len();
                    continue;
                }
                None => {
                    name = strip_dangling_close(value, TOOL_NAME_CLOSE).trim().to_string();
                    break;
                }
            }
        }

        if let Some((open, close)) = arguments_tag(rest) {
            let value = &rest[open.len()..];
            match value.find(close) {
                Some(end) => {
                    params = parse_arguments(&value[..end]);
                    pos += open.len() + end + close.len();
                    continue;
                }
                None => {
                    let raw = strip_dangling_close(value, close).trim();
                    params = error_params(INCOMPLETE_JSON, raw);
                    break;
                }
            }
        }

        // Unknown content inside a tool block is skipped
        pos += rest.chars().next().map_or(1, char::len_utf8);
    }

    let block = ContentBlock::ToolUse {
        name,
        params,
        partial: true,
        call_id: None,
    };
    (block, input.len())
}

fn arguments_tag(rest: &str) -> Option<(&'static str, &'static str)> {
    if rest.starts_with(ARGUMENTS_OPEN) {
        Some((ARGUMENTS_OPEN, ARGUMENTS_CLOSE))
    } else if rest.starts_with(ARGUMENT_OPEN) {
        Some((ARGUMENT_OPEN, ARGUMENT_CLOSE))
    } else {
        None
    }
}

/// Drop a trailing fragment of `close` left by a cut-off stream
fn strip_dangling_close<'a>(value: &'a str, close: &str) -> &'a str {
    for (idx, _) in value.char_indices().rev().take(close.len()) {
        if close.starts_with(&value[idx..]) {
            return &value[..idx];
        }
    }
    value
}

/// Parse an `<arguments>` payload into params, repairing if needed
pub fn parse_arguments(raw: &str) -> ToolParams {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ToolParams::new();
    }

    let err = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => return map,
        Ok(_) => return error_params("Arguments must be a JSON object", trimmed),
        Err(e) => e,
    };

    if let Some(repaired) = repair_json(trimmed) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&repaired) {
            tracing::debug!("Repaired malformed tool arguments");
            return map;
        }
    }

    tracing::debug!(error = %err, "Tool arguments are not valid JSON");
    error_params(&format!("Invalid JSON: {}", err), trimmed)
}

fn error_params(error: &str, raw: &str) -> ToolParams {
    let mut params = ToolParams::new();
    params.insert("_error".to_string(), Value::String(error.to_string()));
    params.insert("_raw".to_string(), Value::String(raw.to_string()));
    params
}

/// Best-effort structural repair of almost-JSON
///
/// Handles markdown fences, trailing commas, unterminated strings, a dangling
/// key separator, and unclosed objects/arrays. Returns `None` when there is
/// nothing left to parse.
pub fn repair_json(input: &str) -> Option<String> {
    let body = strip_code_fence(input.trim());
    if body.is_empty() {
        return None;
    }

    let mut out = String::with_capacity(body.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in body.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    trim_trailing_comma(&mut out);
                    stack.pop();
                    out.push(c);
                }
                // Unbalanced closers are dropped
            }
            _ => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    trim_trailing_comma(&mut out);
    if out.trim_end().ends_with(':') {
        out.push_str("null");
    }

    while let Some(closer) = stack.pop() {
        trim_trailing_comma(&mut out);
        out.push(closer);
    }

    Some(out)
}

fn strip_code_fence(input: &str) -> &str {
    let Some(rest) = input.strip_prefix("```") else {
        return input;
    };
    // Skip the language tag line (```json)
    let rest = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn trim_trailing_comma(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    if out[..trimmed_len].ends_with(',') {
        out.truncate(trimmed_len - 1);
    }
}

/// True when the text ends in something that could still become a tag
///
/// Only the last `SUPPRESSION_WINDOW` characters are inspected. Text ending
/// this way must be withheld from the user until more characters arrive.
pub fn ends_with_partial_tag(text: &str) -> bool {
    for (idx, c) in text.char_indices().rev().take(SUPPRESSION_WINDOW) {
        if c != '<' {
            continue;
        }
        let tail = &text[idx..];
        if RECOGNIZED_TAGS.iter().any(|tag| tag.starts_with(tail)) {
            return true;
        }
    }
    false
}

/// Number of completed tool blocks in a response
pub fn count_tool_closings(text: &str) -> usize {
    text.matches(USE_TOOL_CLOSE).count()
}

/// Cut a response after its first `</use_tool>` when it holds more than one
///
/// Guarantees a stored assistant turn carries at most one tool invocation.
pub fn truncate_to_single_tool_use(text: &str) -> &str {
    if count_tool_closings(text) <= 1 {
        return text;
    }
    match text.find(USE_TOOL_CLOSE) {
        Some(idx) => &text[..idx + USE_TOOL_CLOSE.len()],
        None => text,
    }
}

/// Incremental view over a streaming response
///
/// Accumulates raw deltas and hands back only the text that is safe to show:
/// the leading text block, minus anything that might still turn into a tag.
#[derive(Debug, Default, Clone)]
pub struct StreamingText {
    buffer: String,
    /// Bytes of visible text already handed out
    emitted: usize,
}

impl StreamingText {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw delta; returns newly visible text, if any
    pub fn push(&mut self, delta: &str) -> Option<String> {
        self.buffer.push_str(delta);
        if ends_with_partial_tag(&self.buffer) {
            return None;
        }
        self.take_visible()
    }

    /// Flush whatever was withheld once the stream is over
    pub fn finish(&mut self) -> Option<String> {
        self.take_visible()
    }

    /// Raw accumulated text
    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn into_text(self) -> String {
        self.buffer
    }

    fn take_visible(&mut self) -> Option<String> {
        let blocks = parse(&self.buffer);
        let visible = match blocks.first() {
            Some(ContentBlock::Text { content, .. }) => content.as_str(),
            _ => "",
        };
        let delta = visible.get(self.emitted..).filter(|d| !d.is_empty())?;
        let delta = delta.to_string();
        self.emitted = visible.len();
        Some(delta)
    }
}
