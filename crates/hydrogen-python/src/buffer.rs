//! Editor-side collaborators: source buffers, cursors, and the active editor.
//!
//! The core never owns editor state. Hosts implement these traits over their
//! own buffers; [`LineBuffer`] is an in-memory implementation for the CLI and
//! tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Read-only, row-addressed view of the text being edited.
pub trait SourceBuffer {
    /// Text of `row` without its line terminator, or `None` past the end.
    fn line(&self, row: usize) -> Option<String>;

    /// Zero-based index of the last row.
    fn last_row(&self) -> usize;

    /// Whether the editor's classifier marks `row` as a breakpoint.
    fn is_breakpoint(&self, row: usize) -> bool;
}

/// An explicit user selection, as an inclusive row range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionSpan {
    pub start_row: usize,
    pub end_row: usize,
}

/// Where the cursor goes after a block has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Run without moving: the cursor stays on the block.
    Stay,
    /// Run and move: the cursor advances past the block.
    #[default]
    Advance,
}

/// An editor with a cursor, as seen by the middleware.
pub trait Editor: SourceBuffer + Send + Sync {
    fn cursor_row(&self) -> usize;

    fn set_cursor_row(&self, row: usize);

    /// The explicit selection the code came from, if any.
    fn selection(&self) -> Option<SelectionSpan>;

    fn run_mode(&self) -> RunMode;
}

/// Resolves the editor whose code is being executed.
pub trait Workspace: Send + Sync {
    fn active_editor(&self) -> Option<Arc<dyn Editor>>;
}

#[derive(Debug, Default)]
struct Cursor {
    row: usize,
    selection: Option<SelectionSpan>,
    mode: RunMode,
}

/// In-memory buffer with a cursor and a settable breakpoint set.
#[derive(Debug, Default)]
pub struct LineBuffer {
    lines: Vec<String>,
    breakpoints: HashSet<usize>,
    cursor: Mutex<Cursor>,
}

impl LineBuffer {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            breakpoints: HashSet::new(),
            cursor: Mutex::new(Cursor::default()),
        }
    }

    /// Split `text` on line terminators. A trailing newline does not add a row.
    pub fn from_text(text: &str) -> Self {
        Self::new(text.lines())
    }

    pub fn with_breakpoints(mut self, rows: impl IntoIterator<Item = usize>) -> Self {
        self.breakpoints.extend(rows);
        self
    }

    pub fn with_cursor(self, row: usize, mode: RunMode) -> Self {
        {
            let mut cursor = self.cursor_guard();
            cursor.row = row;
            cursor.mode = mode;
        }
        self
    }

    pub fn with_selection(self, selection: SelectionSpan) -> Self {
        self.cursor_guard().selection = Some(selection);
        self
    }

    fn cursor_guard(&self) -> std::sync::MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SourceBuffer for LineBuffer {
    fn line(&self, row: usize) -> Option<String> {
        self.lines.get(row).cloned()
    }

    fn last_row(&self) -> usize {
        self.lines.len().saturating_sub(1)
    }

    fn is_breakpoint(&self, row: usize) -> bool {
        self.breakpoints.contains(&row)
    }
}

impl Editor for LineBuffer {
    fn cursor_row(&self) -> usize {
        self.cursor_guard().row
    }

    fn set_cursor_row(&self, row: usize) {
        self.cursor_guard().row = row;
    }

    fn selection(&self) -> Option<SelectionSpan> {
        self.cursor_guard().selection
    }

    fn run_mode(&self) -> RunMode {
        self.cursor_guard().mode
    }
}

/// A workspace with a single, fixed editor (or none).
#[derive(Default, Clone)]
pub struct SingleEditor(pub Option<Arc<dyn Editor>>);

impl Workspace for SingleEditor {
    fn active_editor(&self) -> Option<Arc<dyn Editor>> {
        self.0.clone()
    }
}
