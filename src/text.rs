//! Code-point indexed text buffer.
//!
//! Operations address Unicode code points, not UTF-8 bytes, so the
//! index semantics match what editors count on the other side of the
//! wire. Out-of-range positions are clamped, never rejected: a
//! transform can legitimately push an operation past the buffer end.

use crate::protocol::Op;

/// Mutable document text with cached code-point length.
///
/// Apply is O(n) worst case; the length cache keeps clamping and
/// bounds checks O(1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    content: String,
    chars: usize,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        let content = text.into();
        let chars = content.chars().count();
        Self { content, chars }
    }

    /// Code-point length.
    pub fn len(&self) -> u32 {
        self.chars as u32
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    pub fn as_str(&self) -> &str {
        &self.content
    }

    pub fn into_string(self) -> String {
        self.content
    }

    /// Byte offset of code point `pos`, clamped to the end.
    fn byte_at(&self, pos: u32) -> usize {
        let pos = pos as usize;
        if pos >= self.chars {
            return self.content.len();
        }
        match self.content.char_indices().nth(pos) {
            Some((idx, _)) => idx,
            None => self.content.len(),
        }
    }

    /// Insert `text` at code-point `pos` (clamped).
    pub fn insert(&mut self, pos: u32, text: &str) {
        if text.is_empty() {
            return;
        }
        let at = self.byte_at(pos);
        self.content.insert_str(at, text);
        self.chars += text.chars().count();
    }

    /// Delete up to `len` code points from `pos` (both clamped).
    pub fn delete(&mut self, pos: u32, len: u32) {
        let pos = (pos as usize).min(self.chars);
        let len = (len as usize).min(self.chars - pos);
        if len == 0 {
            return;
        }
        let start = self.byte_at(pos as u32);
        let end = self.byte_at((pos + len) as u32);
        self.content.replace_range(start..end, "");
        self.chars -= len;
    }

    /// Apply one operation with clamping semantics.
    pub fn apply(&mut self, op: &Op) {
        match op {
            Op::Insert { pos, text } => self.insert(*pos, text),
            Op::Delete { pos, len } => self.delete(*pos, *len),
        }
    }

    pub fn apply_all(&mut self, ops: &[Op]) {
        for op in ops {
            self.apply(op);
        }
    }
}

/// Minimal diff between two texts: collapse the common prefix and
/// suffix, emit at most one delete followed by at most one insert.
///
/// Round-trips: applying the result to `old` yields `new`.
pub fn diff_ops(old: &str, new: &str) -> Vec<Op> {
    if old == new {
        return Vec::new();
    }

    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let mut prefix = 0usize;
    while prefix < old_chars.len()
        && prefix < new_chars.len()
        && old_chars[prefix] == new_chars[prefix]
    {
        prefix += 1;
    }

    let mut suffix = 0usize;
    while suffix < old_chars.len() - prefix
        && suffix < new_chars.len() - prefix
        && old_chars[old_chars.len() - 1 - suffix] == new_chars[new_chars.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let removed = old_chars.len() - prefix - suffix;
    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();

    let mut ops = Vec::with_capacity(2);
    if removed > 0 {
        ops.push(Op::Delete {
            pos: prefix as u32,
            len: removed as u32,
        });
    }
    if !inserted.is_empty() {
        ops.push(Op::Insert {
            pos: prefix as u32,
            text: inserted,
        });
    }
    ops
}
