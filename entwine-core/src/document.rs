//! The P-ordered CRDT document.
//!
//! A size-augmented ordered tree keyed by [`PosId`] holds one entry per
//! visible atom, so membership, rank, and select all stay logarithmic —
//! rank is on the hot path of every remote apply and every patch-replay
//! op. Insert and delete are idempotent — re-applying an insert whose
//! position already exists, or a delete whose position is absent, leaves
//! the document untouched. That property is what makes patch replay after
//! a sync safe even when the patch overlaps history already applied.
//!
//! Deleted entries are removed outright; there are no in-memory tombstones.
//! The durable operation log retains history.

use crate::ost::IndexTree;
use crate::position::PosId;

/// One visible atom and the op-id it was recorded under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub atom: char,
    pub op_id: u64,
}

/// Result of [`Document::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// An entry with this position already exists; state was not modified.
    Duplicate,
}

/// Ordered collection of (position, atom, op-id) entries.
#[derive(Debug, Default)]
pub struct Document {
    entries: IndexTree<PosId, Entry>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an atom at `pos`. Duplicate positions are skipped.
    pub fn insert(&mut self, pos: PosId, atom: char, op_id: u64) -> InsertOutcome {
        if self.entries.insert(pos, Entry { atom, op_id }) {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        }
    }

    /// Remove the entry at `pos`, returning it. Absent positions yield
    /// `None` (a noop, not an error).
    pub fn delete(&mut self, pos: &PosId) -> Option<Entry> {
        self.entries.remove(pos)
    }

    /// Rank `pos` occupies — or would occupy — in the current ordering,
    /// plus whether an entry exists there. O(log n): the tree carries
    /// subtree sizes.
    pub fn index_of(&self, pos: &PosId) -> (usize, bool) {
        self.entries.rank(pos)
    }

    /// Entry at the given 0-based rank.
    pub fn entry_at(&self, rank: usize) -> Option<(&PosId, &Entry)> {
        self.entries.get_at(rank)
    }

    /// Positions of the neighbors around an insertion rank: the entry at
    /// `rank - 1` on the left and the entry at `rank` on the right.
    pub fn neighbors(&self, rank: usize) -> (Option<PosId>, Option<PosId>) {
        let left = rank
            .checked_sub(1)
            .and_then(|r| self.entry_at(r))
            .map(|(pos, _)| pos.clone());
        let right = self.entry_at(rank).map(|(pos, _)| pos.clone());
        (left, right)
    }

    /// Entries in position order.
    pub fn iter(&self) -> impl Iterator<Item = (&PosId, &Entry)> {
        self.entries.iter()
    }

    /// The visible text: atoms concatenated in position order.
    pub fn text(&self) -> String {
        self.entries.iter().map(|(_, entry)| entry.atom).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{PosId, ReplicaId};

    const R1: ReplicaId = ReplicaId(1);

    /// Seed a document with `text`, returning the positions in order.
    fn seed(doc: &mut Document, text: &str) -> Vec<PosId> {
        let mut positions = Vec::new();
        let mut last: Option<PosId> = None;
        for (i, ch) in text.chars().enumerate() {
            let pos = PosId::between(last.as_ref(), None, R1);
            doc.insert(pos.clone(), ch, i as u64 + 1);
            positions.push(pos.clone());
            last = Some(pos);
        }
        positions
    }

    #[test]
    fn text_follows_position_order() {
        let mut doc = Document::new();
        seed(&mut doc, "hello");
        assert_eq!(doc.text(), "hello");
        assert_eq!(doc.len(), 5);
    }

    #[test]
    fn insert_duplicate_is_noop() {
        let mut doc = Document::new();
        let positions = seed(&mut doc, "ab");
        let outcome = doc.insert(positions[0].clone(), 'z', 99);
        assert_eq!(outcome, InsertOutcome::Duplicate);
        assert_eq!(doc.text(), "ab");
        // Original entry untouched.
        let (_, entry) = doc.entry_at(0).unwrap();
        assert_eq!(entry.atom, 'a');
        assert_eq!(entry.op_id, 1);
    }

    #[test]
    fn delete_returns_entry() {
        let mut doc = Document::new();
        let positions = seed(&mut doc, "abc");
        let removed = doc.delete(&positions[1]).unwrap();
        assert_eq!(removed.atom, 'b');
        assert_eq!(removed.op_id, 2);
        assert_eq!(doc.text(), "ac");
    }

    #[test]
    fn delete_absent_is_noop() {
        let mut doc = Document::new();
        let positions = seed(&mut doc, "ab");
        doc.delete(&positions[0]);
        assert!(doc.delete(&positions[0]).is_none());
        assert_eq!(doc.text(), "b");
    }

    #[test]
    fn index_of_existing_and_gap() {
        let mut doc = Document::new();
        let positions = seed(&mut doc, "abcd");
        assert_eq!(doc.index_of(&positions[0]), (0, true));
        assert_eq!(doc.index_of(&positions[3]), (3, true));

        // A fresh position between b and c would take rank 2.
        let mid = PosId::between(Some(&positions[1]), Some(&positions[2]), R1);
        assert_eq!(doc.index_of(&mid), (2, false));
    }

    #[test]
    fn neighbors_at_edges() {
        let mut doc = Document::new();
        let positions = seed(&mut doc, "ab");

        let (left, right) = doc.neighbors(0);
        assert!(left.is_none());
        assert_eq!(right.as_ref(), Some(&positions[0]));

        let (left, right) = doc.neighbors(2);
        assert_eq!(left.as_ref(), Some(&positions[1]));
        assert!(right.is_none());
    }

    #[test]
    fn rank_lookup_survives_bulk_edits() {
        let mut doc = Document::new();
        let text: String = std::iter::repeat('x').take(400).collect();
        let positions = seed(&mut doc, &text);
        for pos in positions.iter().step_by(3) {
            doc.delete(pos);
        }

        let survivors: Vec<PosId> = doc.iter().map(|(p, _)| p.clone()).collect();
        for (rank, pos) in survivors.iter().enumerate() {
            assert_eq!(doc.index_of(pos), (rank, true));
            let (got, _) = doc.entry_at(rank).unwrap();
            assert_eq!(got, pos);
        }

        // A deleted position reports the rank it would re-occupy.
        assert_eq!(doc.index_of(&positions[0]), (0, false));
    }

    #[test]
    fn interleaved_replicas_converge() {
        // The same operations applied in either order yield the same text.
        let mut doc_a = Document::new();
        let mut doc_b = Document::new();
        let positions = {
            let mut tmp = Document::new();
            seed(&mut tmp, "ab")
        };
        let x = PosId::between(Some(&positions[0]), Some(&positions[1]), ReplicaId(1));
        let y = PosId::between(Some(&positions[0]), Some(&positions[1]), ReplicaId(2));

        for doc in [&mut doc_a, &mut doc_b] {
            doc.insert(positions[0].clone(), 'a', 1);
            doc.insert(positions[1].clone(), 'b', 2);
        }
        doc_a.insert(x.clone(), 'X', 3);
        doc_a.insert(y.clone(), 'Y', 4);
        doc_b.insert(y, 'Y', 3);
        doc_b.insert(x, 'X', 4);

        assert_eq!(doc_a.text(), "aXYb");
        assert_eq!(doc_b.text(), "aXYb");
    }
}
