//! Code-region expansion.
//!
//! Given the block an editor wants to run, decide which contiguous buffer rows
//! actually make up the statement. The heuristic is purely textual: a line is
//! attached when it starts with the block's indentation followed by one of the
//! configured keywords (upward), or by a keyword, deeper indentation or a
//! comment (downward). Blank lines are attached downward and trimmed off the
//! end afterwards. Rows classified as breakpoints stop expansion in either
//! direction.
//!
//! Keywords are plain prefixes, so `else` also matches `elsewhere = 1` at the
//! same indentation.

use serde::{Deserialize, Serialize};

use crate::buffer::{RunMode, SelectionSpan, SourceBuffer};

/// Code to execute and where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub code: String,
    /// First buffer row the code maps to.
    pub start_row: usize,
    /// Present only when the user explicitly selected the code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionSpan>,
}

impl CodeBlock {
    pub fn new(code: impl Into<String>, start_row: usize) -> Self {
        Self {
            code: code.into(),
            start_row,
            selection: None,
        }
    }

    pub fn selected(code: impl Into<String>, selection: SelectionSpan) -> Self {
        Self {
            code: code.into(),
            start_row: selection.start_row,
            selection: Some(selection),
        }
    }

    fn line_count(&self) -> usize {
        self.code.lines().count()
    }
}

/// The block that should be sent, plus the span it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionResult {
    pub block: CodeBlock,
    pub start_row: usize,
    pub end_row: usize,
    /// Row the cursor should move to, for run-and-move executions.
    pub next_cursor_row: Option<usize>,
}

/// Keyword sets that decide which neighbouring lines belong to a block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExpansionRules {
    /// Lines above the block starting with one of these are attached.
    pub prepend_keywords: Vec<String>,
    /// Lines below the block starting with one of these are attached.
    pub expand_keywords: Vec<String>,
}

impl ExpansionRules {
    pub fn new<P, E>(prepend_keywords: P, expand_keywords: E) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            prepend_keywords: prepend_keywords.into_iter().map(Into::into).collect(),
            expand_keywords: expand_keywords.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `line`, sitting right above a block indented by `indent`,
    /// belongs to it.
    pub fn continues_upward(&self, line: &str, indent: &str) -> bool {
        line.strip_prefix(indent)
            .is_some_and(|rest| starts_with_keyword(rest, &self.prepend_keywords))
    }

    /// Whether `line`, sitting right below a block indented by `indent`,
    /// belongs to it.
    pub fn continues_downward(&self, line: &str, indent: &str) -> bool {
        if line.trim().is_empty() {
            return true;
        }
        let Some(rest) = line.strip_prefix(indent) else {
            return false;
        };
        rest.starts_with(char::is_whitespace)
            || rest.starts_with('#')
            || starts_with_keyword(rest, &self.expand_keywords)
    }
}

fn starts_with_keyword(text: &str, keywords: &[String]) -> bool {
    keywords
        .iter()
        .any(|keyword| !keyword.is_empty() && text.starts_with(keyword.as_str()))
}

fn leading_whitespace(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

/// Buffer text at `row`; rows past the end read as blank and are never
/// requested from the buffer.
fn line_at<B: SourceBuffer + ?Sized>(buffer: &B, row: usize) -> String {
    if row > buffer.last_row() {
        return String::new();
    }
    buffer.line(row).unwrap_or_default()
}

/// Find the row the block really starts on.
///
/// The cursor may already have moved past the block (run-and-move), so scan
/// upward from the later of the cursor and the block's natural last row for a
/// line matching the block's last line, then step back over the rest of it.
fn locate_start<B: SourceBuffer + ?Sized>(
    buffer: &B,
    block: &CodeBlock,
    cursor_row: usize,
) -> Option<usize> {
    let lines: Vec<&str> = block.code.lines().collect();
    let target = lines.last()?.trim();
    let span = lines.len() - 1;
    let origin = cursor_row
        .max(block.start_row + span)
        .min(buffer.last_row());

    (0..=origin)
        .rev()
        .find(|&row| line_at(buffer, row).trim() == target)
        .map(|row| row.saturating_sub(span))
}

/// First row after `end_row` holding code, skipping blanks and comments.
/// Falls back to the last row when nothing follows.
fn next_statement_row<B: SourceBuffer + ?Sized>(buffer: &B, end_row: usize) -> usize {
    let last_row = buffer.last_row();
    (end_row + 1..=last_row)
        .find(|&row| {
            let text = line_at(buffer, row);
            let text = text.trim();
            !text.is_empty() && !text.starts_with('#')
        })
        .unwrap_or(last_row)
}

/// Expand `block` to the full statement it belongs to.
///
/// Selections are returned untouched. `cursor_row` is where the editor's
/// cursor is now, which may be past the block.
pub fn expand<B: SourceBuffer + ?Sized>(
    buffer: &B,
    block: &CodeBlock,
    cursor_row: usize,
    rules: &ExpansionRules,
    mode: RunMode,
) -> ExpansionResult {
    let line_count = block.line_count();
    if block.selection.is_some() || line_count == 0 {
        return ExpansionResult {
            block: block.clone(),
            start_row: block.start_row,
            end_row: block.start_row + line_count.saturating_sub(1),
            next_cursor_row: None,
        };
    }

    let last_row = buffer.last_row();
    let mut start_row = locate_start(buffer, block, cursor_row).unwrap_or(block.start_row);
    let mut end_row = start_row + line_count - 1;

    let indent = block
        .code
        .lines()
        .next()
        .map(leading_whitespace)
        .unwrap_or_default();

    let mut above = Vec::new();
    while start_row > 0 {
        let row = start_row - 1;
        if buffer.is_breakpoint(row) {
            break;
        }
        let text = line_at(buffer, row);
        if !rules.continues_upward(&text, indent) {
            break;
        }
        above.push(text);
        start_row = row;
    }
    above.reverse();

    let mut below = Vec::new();
    while end_row < last_row {
        let row = end_row + 1;
        if buffer.is_breakpoint(row) {
            break;
        }
        let text = line_at(buffer, row);
        if !rules.continues_downward(&text, indent) {
            break;
        }
        below.push(text);
        end_row = row;
    }

    let mut lines: Vec<String> = above;
    lines.extend(block.code.lines().map(str::to_string));
    lines.extend(below);

    while lines.len() > 1 && lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
        end_row -= 1;
    }

    let next_cursor_row = match mode {
        RunMode::Advance => Some(next_statement_row(buffer, end_row)),
        RunMode::Stay => None,
    };

    ExpansionResult {
        block: CodeBlock::new(lines.join("\n"), start_row),
        start_row,
        end_row,
        next_cursor_row,
    }
}
