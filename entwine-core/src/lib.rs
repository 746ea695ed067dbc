//! # entwine-core — CRDT primitives for the Entwine editor
//!
//! The replication core keeps two representations of the same text:
//!
//! ```text
//! ┌──────────────────┐   rank ↔ (line, col)   ┌──────────────────┐
//! │ Document          │ ◄────────────────────► │ LineBuffer        │
//! │ (P-ordered CRDT)  │                        │ (render mirror)   │
//! └────────┬─────────┘                        └──────────────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ PosId allocator   │  dense fractional identifiers,
//! │ (per replica)     │  replica tag as tie-breaker
//! └──────────────────┘
//! ```
//!
//! The [`Document`] is authoritative: enumerating its entries in position
//! order yields the visible text. The [`LineBuffer`] is derived state kept
//! in lock-step by the collaboration layer so the renderer can work in
//! line/column coordinates.
//!
//! This crate is purely data-structural — no I/O, no async. The network,
//! storage, and locking concerns live in `entwine-collab`.

pub mod buffer;
pub mod document;
mod ost;
pub mod position;

pub use buffer::{LineBuffer, Loc};
pub use document::{Document, Entry, InsertOutcome};
pub use position::{Level, PosId, PositionError, ReplicaId};
