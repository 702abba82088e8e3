//! The text-editing surface of a cell, as seen by the controller.
//!
//! Offsets are counted in characters, matching the kernel protocol's
//! `cursor_pos`. Lines are 0-based here; diagnostic ranges are converted
//! before they reach the editor.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HighlightKind {
    Error,
    Hole,
}

/// A (line, column) cursor position, both 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: usize,
    pub ch: usize,
}

/// Character offset of `pos` in `text`, clamped to the text.
pub fn offset_of(text: &str, pos: Position) -> usize {
    let mut offset = 0;
    for (index, line) in text.split('\n').enumerate() {
        let len = line.chars().count();
        if index == pos.line {
            return offset + pos.ch.min(len);
        }
        offset += len + 1;
    }
    text.chars().count()
}

/// Position of character offset `offset` in `text`, clamped to the text.
pub fn position_of(text: &str, offset: usize) -> Position {
    let mut pos = Position::default();
    for c in text.chars().take(offset) {
        if c == '\n' {
            pos.line += 1;
            pos.ch = 0;
        } else {
            pos.ch += 1;
        }
    }
    pos
}

/// Replace the characters in `[start, end)` with `replacement`.
pub fn replace_chars(text: &str, start: usize, end: usize, replacement: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let start = start.min(chars.len());
    let end = end.clamp(start, chars.len());
    let mut out: String = chars[..start].iter().collect();
    out.push_str(replacement);
    out.extend(&chars[end..]);
    out
}

pub trait EditorSurface: Send {
    fn text(&self) -> String;
    fn set_text(&mut self, text: &str);
    fn cursor(&self) -> Position;

    fn cursor_offset(&self) -> usize {
        offset_of(&self.text(), self.cursor())
    }

    /// Replace `[start, end)` (character offsets) with `replacement`.
    fn replace_range(&mut self, start: usize, end: usize, replacement: &str) {
        let text = replace_chars(&self.text(), start, end, replacement);
        self.set_text(&text);
    }

    /// Mark lines `from..=to` (0-based).
    fn highlight_lines(&mut self, from: usize, to: usize, kind: HighlightKind);
    fn clear_highlights(&mut self);

    /// Offer completion candidates for `[start, end)`; the user picks.
    fn show_choices(&mut self, matches: &[String], start: usize, end: usize);

    fn is_read_only(&self) -> bool {
        false
    }

    /// Re-apply the editor's initial folding after the source was replaced.
    fn fold_initial(&mut self) {}

    /// Cell info line (chord feedback).
    fn set_info(&mut self, _text: &str) {}
}

/// Offered completion candidates, as recorded by [`MemoryEditor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choices {
    pub matches: Vec<String>,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Default)]
struct EditorState {
    text: String,
    cursor: Position,
    read_only: bool,
    highlights: BTreeMap<usize, HighlightKind>,
    choices: Option<Choices>,
    info: String,
    folds: usize,
}

/// Editor surface backed by shared memory. Clones share one buffer, so a
/// test or a headless driver can edit and inspect what the controller sees.
#[derive(Debug, Clone, Default)]
pub struct MemoryEditor {
    state: Arc<Mutex<EditorState>>,
}

impl MemoryEditor {
    pub fn new(text: &str) -> Self {
        let editor = Self::default();
        editor.state().text = text.to_string();
        editor
    }

    pub fn read_only(self) -> Self {
        self.state().read_only = true;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EditorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_cursor(&self, pos: Position) {
        self.state().cursor = pos;
    }

    pub fn set_cursor_offset(&self, offset: usize) {
        let mut state = self.state();
        state.cursor = position_of(&state.text, offset);
    }

    /// Simulate a user edit.
    pub fn type_text(&self, text: &str) {
        self.state().text = text.to_string();
    }

    pub fn highlights(&self) -> Vec<(usize, HighlightKind)> {
        self.state().highlights.iter().map(|(l, k)| (*l, *k)).collect()
    }

    pub fn choices(&self) -> Option<Choices> {
        self.state().choices.clone()
    }

    pub fn info(&self) -> String {
        self.state().info.clone()
    }

    pub fn fold_count(&self) -> usize {
        self.state().folds
    }
}

impl EditorSurface for MemoryEditor {
    fn text(&self) -> String {
        self.state().text.clone()
    }

    fn set_text(&mut self, text: &str) {
        self.state().text = text.to_string();
    }

    fn cursor(&self) -> Position {
        self.state().cursor
    }

    fn highlight_lines(&mut self, from: usize, to: usize, kind: HighlightKind) {
        let mut state = self.state();
        for line in from..=to {
            state.highlights.insert(line, kind);
        }
    }

    fn clear_highlights(&mut self) {
        let mut state = self.state();
        state.highlights.clear();
        state.choices = None;
    }

    fn show_choices(&mut self, matches: &[String], start: usize, end: usize) {
        self.state().choices = Some(Choices {
            matches: matches.to_vec(),
            start,
            end,
        });
    }

    fn is_read_only(&self) -> bool {
        self.state().read_only
    }

    fn fold_initial(&mut self) {
        self.state().folds += 1;
    }

    fn set_info(&mut self, text: &str) {
        self.state().info = text.to_string();
    }
}
