//! Line buffer mirror of the CRDT document.
//!
//! The renderer works in (line, column) coordinates; the CRDT works in
//! ranks. This buffer materializes the document as lines and maps between
//! the two. It is derived state: the collaboration layer mutates it in the
//! same critical section as the document, and on any disagreement the
//! document wins.

use serde::{Deserialize, Serialize};

/// A cursor location: `x` is the character column, `y` the line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loc {
    pub x: usize,
    pub y: usize,
}

impl Loc {
    pub fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }
}

/// Ordered sequence of lines mirroring the document text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineBuffer {
    lines: Vec<String>,
    line_count: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    /// An empty buffer: one empty line.
    pub fn new() -> Self {
        Self {
            lines: vec![String::new()],
            line_count: 1,
        }
    }

    pub fn from_text(text: &str) -> Self {
        let lines: Vec<String> = text.split('\n').map(str::to_owned).collect();
        let line_count = lines.len();
        Self { lines, line_count }
    }

    pub fn line_count(&self) -> usize {
        self.line_count
    }

    pub fn line(&self, y: usize) -> Option<&str> {
        self.lines.get(y).map(String::as_str)
    }

    /// Map a document rank to a (line, column) location.
    ///
    /// Newline atoms count toward the rank: the position at the end of a
    /// non-final line is the newline itself. A rank past the last atom
    /// clamps to end-of-last-line.
    pub fn from_char_pos(&self, rank: usize) -> Loc {
        let mut remaining = rank;
        let last = self.lines.len() - 1;
        for (y, line) in self.lines.iter().enumerate() {
            let chars = line.chars().count();
            if remaining <= chars {
                return Loc::new(remaining, y);
            }
            if y == last {
                break;
            }
            remaining -= chars + 1; // consume the newline
        }
        Loc::new(self.lines[last].chars().count(), last)
    }

    /// Inverse of [`LineBuffer::from_char_pos`]: the document rank of the
    /// atom at `loc`. Columns clamp to the line length, lines to the last
    /// line.
    pub fn char_pos(&self, loc: Loc) -> usize {
        let y = loc.y.min(self.lines.len() - 1);
        let mut rank = 0;
        for line in &self.lines[..y] {
            rank += line.chars().count() + 1;
        }
        rank + loc.x.min(self.lines[y].chars().count())
    }

    /// Insert one atom at `loc`. A newline splits the line.
    pub fn insert(&mut self, loc: Loc, atom: char) {
        let y = loc.y.min(self.lines.len() - 1);
        let idx = byte_index(&self.lines[y], loc.x);
        if atom == '\n' {
            let tail = self.lines[y].split_off(idx);
            self.lines.insert(y + 1, tail);
        } else {
            self.lines[y].insert(idx, atom);
        }
    }

    /// Remove the atom at `loc`. Removing the newline at end-of-line joins
    /// the next line onto this one.
    pub fn remove(&mut self, loc: Loc) {
        let y = loc.y.min(self.lines.len() - 1);
        let chars = self.lines[y].chars().count();
        if loc.x >= chars {
            // The atom at end-of-line is the separating newline.
            if y + 1 < self.lines.len() {
                let next = self.lines.remove(y + 1);
                self.lines[y].push_str(&next);
            }
        } else {
            let idx = byte_index(&self.lines[y], loc.x);
            self.lines[y].remove(idx);
        }
    }

    /// Refresh derived metadata after a mutation.
    pub fn update(&mut self) {
        self.line_count = self.lines.len();
    }

    /// Full text, lines joined with `\n`. Must match the document's
    /// P-order enumeration after every completed operation.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

fn byte_index(line: &str, col: usize) -> usize {
    line.char_indices()
        .nth(col)
        .map(|(i, _)| i)
        .unwrap_or(line.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_is_one_empty_line() {
        let buf = LineBuffer::new();
        assert_eq!(buf.line_count(), 1);
        assert_eq!(buf.text(), "");
    }

    #[test]
    fn from_char_pos_walks_lines() {
        let buf = LineBuffer::from_text("ab\ncd");
        assert_eq!(buf.from_char_pos(0), Loc::new(0, 0));
        assert_eq!(buf.from_char_pos(1), Loc::new(1, 0));
        // Rank 2 is the newline at the end of line 0.
        assert_eq!(buf.from_char_pos(2), Loc::new(2, 0));
        assert_eq!(buf.from_char_pos(3), Loc::new(0, 1));
        assert_eq!(buf.from_char_pos(4), Loc::new(1, 1));
        // End of document.
        assert_eq!(buf.from_char_pos(5), Loc::new(2, 1));
    }

    #[test]
    fn char_pos_inverts_from_char_pos() {
        let buf = LineBuffer::from_text("ab\ncd\n\nxyz");
        let total = 3 + 3 + 1 + 3;
        for rank in 0..=total {
            assert_eq!(buf.char_pos(buf.from_char_pos(rank)), rank, "rank {rank}");
        }
    }

    #[test]
    fn char_pos_clamps_out_of_range() {
        let buf = LineBuffer::from_text("ab\ncd");
        assert_eq!(buf.char_pos(Loc::new(50, 0)), 2);
        assert_eq!(buf.char_pos(Loc::new(0, 9)), 3);
    }

    #[test]
    fn from_char_pos_clamps_past_end() {
        let buf = LineBuffer::from_text("ab\ncd");
        assert_eq!(buf.from_char_pos(100), Loc::new(2, 1));
    }

    #[test]
    fn insert_plain_char() {
        let mut buf = LineBuffer::from_text("ac");
        buf.insert(Loc::new(1, 0), 'b');
        buf.update();
        assert_eq!(buf.text(), "abc");
        assert_eq!(buf.line_count(), 1);
    }

    #[test]
    fn insert_newline_splits_line() {
        let mut buf = LineBuffer::from_text("abcd");
        buf.insert(Loc::new(2, 0), '\n');
        buf.update();
        assert_eq!(buf.text(), "ab\ncd");
        assert_eq!(buf.line_count(), 2);
    }

    #[test]
    fn insert_newline_at_line_end() {
        let mut buf = LineBuffer::from_text("ab");
        buf.insert(Loc::new(2, 0), '\n');
        buf.update();
        assert_eq!(buf.text(), "ab\n");
        assert_eq!(buf.line_count(), 2);
    }

    #[test]
    fn remove_plain_char() {
        let mut buf = LineBuffer::from_text("abc");
        buf.remove(Loc::new(1, 0));
        buf.update();
        assert_eq!(buf.text(), "ac");
    }

    #[test]
    fn remove_newline_joins_lines() {
        let mut buf = LineBuffer::from_text("ab\ncd");
        buf.remove(Loc::new(2, 0));
        buf.update();
        assert_eq!(buf.text(), "abcd");
        assert_eq!(buf.line_count(), 1);
    }

    #[test]
    fn remove_at_last_line_end_is_noop() {
        let mut buf = LineBuffer::from_text("ab");
        buf.remove(Loc::new(2, 0));
        buf.update();
        assert_eq!(buf.text(), "ab");
    }

    #[test]
    fn multibyte_columns_are_character_based() {
        let mut buf = LineBuffer::from_text("héllo");
        buf.insert(Loc::new(2, 0), 'x');
        assert_eq!(buf.text(), "héxllo");
        buf.remove(Loc::new(2, 0));
        assert_eq!(buf.text(), "héllo");
        buf.remove(Loc::new(1, 0));
        assert_eq!(buf.text(), "hllo");
    }

    #[test]
    fn split_and_rejoin_round_trip() {
        let mut buf = LineBuffer::from_text("hello world");
        buf.insert(Loc::new(5, 0), '\n');
        buf.update();
        assert_eq!(buf.text(), "hello\n world");
        buf.remove(Loc::new(5, 0));
        buf.update();
        assert_eq!(buf.text(), "hello world");
    }
}
