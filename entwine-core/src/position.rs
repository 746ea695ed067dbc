//! Dense fractional position identifiers.
//!
//! Every atom in the document is keyed by a [`PosId`]: a sequence of
//! levels, each carrying a digit and the tag of the replica that generated
//! it. Identifiers compare lexicographically, digits before replica tags,
//! so concurrent insertions at the same spot order deterministically by
//! replica. Between any two identifiers a third can always be generated —
//! identifiers grow in length instead of running out of room.
//!
//! Allocation uses a boundary-capped midpoint: within a small gap the new
//! digit lands in the middle, while appends into a wide-open gap advance by
//! at most [`BOUNDARY`] so that typing at the end of the document consumes
//! digit space linearly rather than halving it per keystroke.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest conceptual digit (exclusive lower bound for generated digits).
const DIGIT_MIN: u32 = 0;
/// Largest conceptual digit (exclusive upper bound for generated digits).
const DIGIT_MAX: u32 = u32::MAX;
/// Cap on how far a fresh digit moves into a wide gap.
const BOUNDARY: u32 = 64;

/// Serialized width of one level: u32 digit + u64 replica tag.
const LEVEL_WIDTH: usize = 12;

/// Tag identifying the replica that generated a level.
///
/// Tags are folded from the replica's transport address with FNV-1a, so a
/// peer keeps the same tag across restarts and two peers with different
/// addresses never collide in practice. Tag `0` is reserved for
/// deterministic seeding of shared initial content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Reserved tag for document seeding. Two replicas loading the same
    /// file with this tag materialize identical identifiers.
    pub const SEED: ReplicaId = ReplicaId(0);

    /// Derive a stable tag from a transport address (`host:port`).
    pub fn from_addr(addr: &str) -> Self {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in addr.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        // 0 is the seed tag; nudge the (astronomically unlikely) collision.
        ReplicaId(hash.max(1))
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// One level of a position identifier.
///
/// Field order matters: the derived ordering compares `digit` first and
/// breaks ties on `replica`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Level {
    pub digit: u32,
    pub replica: ReplicaId,
}

impl Level {
    pub fn new(digit: u32, replica: ReplicaId) -> Self {
        Self { digit, replica }
    }
}

/// Position identifier: a non-empty sequence of levels.
///
/// `PosId`s are immutable once generated, globally unique (the final level
/// carries the generating replica's tag), and totally ordered across
/// replicas. The wire representation is an opaque byte sequence produced by
/// [`PosId::encode`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PosId(Vec<Level>);

/// Errors decoding a wire-format identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionError {
    /// The byte sequence was empty.
    Empty,
    /// The byte sequence was not a whole number of levels.
    Truncated { len: usize },
}

impl fmt::Display for PositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionError::Empty => write!(f, "empty position identifier"),
            PositionError::Truncated { len } => {
                write!(f, "position identifier truncated at {len} bytes")
            }
        }
    }
}

impl std::error::Error for PositionError {}

impl PosId {
    /// Build an identifier from explicit levels. Callers must pass at least
    /// one level; allocation via [`PosId::between`] always does.
    pub fn from_levels(levels: Vec<Level>) -> Self {
        debug_assert!(!levels.is_empty());
        Self(levels)
    }

    pub fn levels(&self) -> &[Level] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Generate an identifier strictly between `left` and `right`.
    ///
    /// `None` on the left means start-of-document, on the right
    /// end-of-document. The caller guarantees `left < right`; under that
    /// contract allocation always succeeds. The final level of the result
    /// carries `replica`.
    pub fn between(left: Option<&PosId>, right: Option<&PosId>, replica: ReplicaId) -> PosId {
        if let (Some(l), Some(r)) = (left, right) {
            debug_assert!(l < r, "between() requires left < right");
        }
        let left_levels: &[Level] = left.map_or(&[], |p| &p.0);
        let right_levels: &[Level] = right.map_or(&[], |p| &p.0);

        let mut levels = Vec::with_capacity(left_levels.len() + 1);
        // While a bound is pinned, the prefix built so far equals that
        // bound's prefix, so its next level still constrains the walk.
        let mut pin_left = true;
        let mut pin_right = true;
        let mut depth = 0;
        loop {
            let lower = if pin_left { left_levels.get(depth) } else { None };
            let upper = if pin_right { right_levels.get(depth) } else { None };
            let lo = lower.map_or(DIGIT_MIN, |l| l.digit);
            let hi = upper.map_or(DIGIT_MAX, |l| l.digit);

            if hi - lo > 1 {
                let step = ((hi - lo) / 2).min(BOUNDARY);
                levels.push(Level::new(lo + step, replica));
                return PosId(levels);
            }

            // No room at this depth: copy the tightest lower level and
            // descend. Once the copied level sorts strictly below the upper
            // bound, the right neighbor stops constraining deeper levels.
            match lower {
                Some(level) => {
                    levels.push(*level);
                    if upper.map_or(true, |u| level < u) {
                        pin_right = false;
                    }
                }
                None => {
                    pin_left = false;
                    match upper {
                        // Left bound exhausted against an equal digit:
                        // stay on the right bound's path.
                        Some(u) if u.digit == lo => levels.push(*u),
                        _ => {
                            levels.push(Level::new(lo, replica));
                            pin_right = false;
                        }
                    }
                }
            }
            depth += 1;
        }
    }

    /// Serialize to the opaque wire form: 12 bytes per level, digit then
    /// replica tag, both big-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.0.len() * LEVEL_WIDTH);
        for level in &self.0 {
            bytes.extend_from_slice(&level.digit.to_be_bytes());
            bytes.extend_from_slice(&level.replica.0.to_be_bytes());
        }
        bytes
    }

    /// Decode the wire form produced by [`PosId::encode`].
    pub fn decode(bytes: &[u8]) -> Result<PosId, PositionError> {
        if bytes.is_empty() {
            return Err(PositionError::Empty);
        }
        if bytes.len() % LEVEL_WIDTH != 0 {
            return Err(PositionError::Truncated { len: bytes.len() });
        }
        let mut levels = Vec::with_capacity(bytes.len() / LEVEL_WIDTH);
        for chunk in bytes.chunks_exact(LEVEL_WIDTH) {
            let digit = u32::from_be_bytes(chunk[..4].try_into().unwrap());
            let replica = u64::from_be_bytes(chunk[4..].try_into().unwrap());
            levels.push(Level::new(digit, ReplicaId(replica)));
        }
        Ok(PosId(levels))
    }
}

impl fmt::Display for PosId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, level) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}@{}", level.digit, level.replica)?;
        }
        write!(f, "]")
    }
}
