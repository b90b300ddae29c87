//! Pure string-parsing helpers that turn an agent reply into an operation
//! array.
//!
//! The agent is asked for a bare JSON array but often wraps it in a
//! markdown fence or in explanatory prose.  [`parse`] accepts all three
//! shapes and otherwise reports [`ParseResult::Failure`] with the original
//! text, which callers surface as a plain message.

use serde_json::Value;

/// Outcome of [`parse`].  `Failure` is not an error: the agent chose to
/// answer in prose.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    Success(Vec<Value>),
    Failure(String),
}

impl ParseResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ParseResult::Success(_))
    }
}

/// Parse raw agent output into a JSON array of operation items.
///
/// 1. Strip a surrounding fenced code block.
/// 2. Parse the remainder as a JSON array.
/// 3. Otherwise parse the span from the first `[` to the last `]`.
/// 4. Otherwise return `Failure(raw)`.
pub fn parse(raw: &str) -> ParseResult {
    let stripped = strip_fence(raw);

    if let Some(items) = parse_array(&stripped) {
        return ParseResult::Success(items);
    }

    if let Some(span) = bracket_span(&stripped) {
        if let Some(items) = parse_array(span) {
            return ParseResult::Success(items);
        }
    }

    ParseResult::Failure(raw.to_string())
}

fn parse_array(text: &str) -> Option<Vec<Value>> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

/// Remove a leading fence line (```` ``` ```` with an optional language
/// tag) and a trailing fence line.  Text that does not start with a fence
/// is returned trimmed but otherwise untouched.
pub fn strip_fence(raw: &str) -> String {
    let text = raw.replace("\r\n", "\n");
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    let mut lines: Vec<&str> = trimmed.lines().collect();
    lines.remove(0);
    if lines.last().is_some_and(|l| l.trim_start().starts_with("```")) {
        lines.pop();
    }
    lines.join("\n")
}

/// Substring from the first `[` to the last `]`, inclusive.
fn bracket_span(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
