//! # entwine-collab — replication layer for the Entwine editor
//!
//! Keeps N peer replicas of a text document convergent under concurrent
//! local edits and unreliable delivery.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   Insert/Delete RPC    ┌────────────┐
//! │ Session A  │ ◄────────────────────► │ Session B  │
//! │            │   SyncPhaseOne/Two     │            │
//! └─────┬──────┘   CursorUpdate         └─────┬──────┘
//!       │                                     │
//!       ▼                                     ▼
//! ┌────────────┐                        ┌────────────┐
//! │ Document + │                        │ Document + │
//! │ LineBuffer │                        │ LineBuffer │
//! └─────┬──────┘                        └─────┬──────┘
//!       │                                     │
//!       ▼                                     ▼
//! ┌────────────┐                        ┌────────────┐
//! │ OpLog      │                        │ OpLog      │
//! │ (RocksDB)  │                        │ (RocksDB)  │
//! └────────────┘                        └────────────┘
//! ```
//!
//! Steady state is single-operation broadcasts; a two-phase pair-wise sync
//! reconciles divergent histories after (re)connection. All document and
//! mirror mutations happen under one lock held per operation, so local
//! input interleaves with remote apply and patch replay.
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode frames, LZ4 patches)
//! - [`clock`] — Per-peer clock vector with dirty tracking
//! - [`storage`] — Durable operation log and clock store (RocksDB)
//! - [`session`] — Injected session context; local edit and remote apply
//! - [`transport`] — WebSocket-over-TCP RPC links
//! - [`sync`] — Pair-wise synchronization protocol
//! - [`cursor`] — Periodic cursor piggyback channel

pub mod clock;
pub mod cursor;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod sync;
pub mod transport;

pub use clock::{ClockEntry, ClockVector};
pub use protocol::{
    ConnectArgs, CursorArgs, DisconnectArgs, EditArgs, Frame, FrameBody, OpKind, Operation,
    ProtocolError, Reply, Request, SyncPhaseOneArgs, SyncPhaseOneReply, SyncPhaseTwoArgs,
};
pub use session::{CursorSource, NullRedraw, Redraw, Session, SessionError};
pub use storage::{OpLog, StoreConfig, StoreError};
pub use sync::{establish, initiate, SyncError};
pub use transport::{serve, PeerLink, TransportError};
