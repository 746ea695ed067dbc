//! Pair-wise synchronization protocol.
//!
//! Runs once per (re)connection, initiated by the dialer:
//!
//! ```text
//! Initiator                         Receiver
//!    │  SyncPhaseOne                   │
//!    │  {sender_clock, receiver_clock} │
//!    │ ───────────────────────────────►│  compare clocks both ways
//!    │                                 │
//!    │  {phase_two, requester_clock,   │
//!    │   patch = receiver's new ops}   │
//!    │ ◄───────────────────────────────│
//!    │  apply patch                    │
//!    │                                 │
//!    │  SyncPhaseTwo {patch}           │  (only when the receiver
//!    │ ───────────────────────────────►│   was behind)
//!    │                                 │  apply patch
//! ```
//!
//! Patches are strictly ascending by clock and every op is idempotent, so
//! a patch that partially overlaps applied history replays safely. The one
//! unrecoverable outcome is divergence — a side observing the other's
//! clock ahead of its self-report — which aborts the sync and changes
//! nothing.

use std::sync::Arc;

use crate::protocol::{ConnectArgs, Reply, Request};
use crate::session::{Session, SessionError};
use crate::transport::{PeerLink, TransportError};

/// Errors from a sync run.
#[derive(Debug)]
pub enum SyncError {
    Transport(TransportError),
    Session(SessionError),
    /// The receiver refused the exchange (typically divergence).
    Rejected(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Transport(e) => write!(f, "sync transport failure: {e}"),
            SyncError::Session(e) => write!(f, "sync failed locally: {e}"),
            SyncError::Rejected(e) => write!(f, "sync rejected by peer: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        SyncError::Transport(e)
    }
}

impl From<SessionError> for SyncError {
    fn from(e: SessionError) -> Self {
        SyncError::Session(e)
    }
}

/// Dial `peer`, exchange Connect, then reconcile histories. The receiver
/// never initiates; catch-up is entirely the dialer's job.
pub async fn establish(session: &Arc<Session>, peer: &str) -> Result<(), SyncError> {
    let link = PeerLink::dial(peer).await?;
    session.register_link(peer, link.clone()).await;

    let connect = Request::Connect(ConnectArgs { client_id: session.client_id().to_owned() });
    match link.call(connect).await? {
        Reply::Error(e) => {
            // The peer accepted us but could not open its reverse link;
            // our outbound edits still flow.
            log::warn!("peer {peer} could not dial back: {e}");
        }
        _ => log::info!("connected to {peer}"),
    }

    initiate(session, peer).await
}

/// Run the two-phase exchange over an already-open link.
pub async fn initiate(session: &Arc<Session>, peer: &str) -> Result<(), SyncError> {
    let link = session
        .link_of(peer)
        .await
        .ok_or(SyncError::Transport(TransportError::Closed))?;

    let args = session.build_phase_one_args(peer);
    log::info!(
        "sync with {peer}: local clock {}, view of peer {}",
        args.sender_clock,
        args.receiver_clock
    );

    let reply = match link.call(Request::SyncPhaseOne(args)).await? {
        Reply::SyncPhaseOne(reply) => reply,
        Reply::Error(e) => return Err(SyncError::Rejected(e)),
        Reply::Ack => return Err(SyncError::Rejected("unexpected ack to phase one".into())),
    };

    let phase_two = session.commit_phase_one(peer, &reply)?;
    match phase_two {
        None => log::info!("sync with {peer}: receiver up to date"),
        Some(args) => {
            log::info!("sync with {peer}: sending phase-two patch");
            match link.call(Request::SyncPhaseTwo(args)).await? {
                Reply::Error(e) => return Err(SyncError::Rejected(e)),
                _ => {}
            }
        }
    }
    Ok(())
}
