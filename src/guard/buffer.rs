//! The editable query text.

use std::ops::Range;

use super::Fingerprint;

/// Query text plus a revision counter bumped on every change.
///
/// Edits that leave the text byte-identical do not bump the revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryBuffer {
    text: String,
    revision: u64,
}

impl QueryBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            revision: 0,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// True when there is nothing but whitespace to run.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.text)
    }

    /// Replaces the whole text. Returns whether anything changed.
    pub fn set_text(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        if text == self.text {
            return false;
        }
        self.text = text;
        self.revision += 1;
        true
    }

    /// Inserts at a byte offset, clamped to the end and to a char boundary.
    pub fn insert_str(&mut self, at: usize, s: &str) {
        if s.is_empty() {
            return;
        }
        let at = self.floor_boundary(at);
        self.text.insert_str(at, s);
        self.revision += 1;
    }

    pub fn insert_char(&mut self, at: usize, c: char) {
        let mut buf = [0u8; 4];
        self.insert_str(at, c.encode_utf8(&mut buf));
    }

    /// Removes a byte range and returns the removed text.
    pub fn remove(&mut self, range: Range<usize>) -> String {
        let start = self.floor_boundary(range.start);
        let end = self.floor_boundary(range.end.max(start));
        if start == end {
            return String::new();
        }
        let removed: String = self.text.drain(start..end).collect();
        self.revision += 1;
        removed
    }

    pub fn clear(&mut self) {
        self.set_text(String::new());
    }

    fn floor_boundary(&self, at: usize) -> usize {
        let mut at = at.min(self.text.len());
        while !self.text.is_char_boundary(at) {
            at -= 1;
        }
        at
    }
}
