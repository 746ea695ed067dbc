//! The session context: everything one replica needs to collaborate.
//!
//! A [`Session`] owns the document and its line mirror under a single
//! lock, the per-peer clock vector, the peer table, and the durable op
//! log. Every RPC handler and every local edit goes through the session —
//! there is no process-wide mutable state.
//!
//! Locking discipline: the document lock is held for exactly one operation
//! (one insert or delete plus the mirror update) and never across an
//! `.await`. Patch replay re-acquires it per op so local input interleaves
//! with catch-up. The clock vector has its own lock and is never taken
//! while the document lock is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use entwine_core::{Document, LineBuffer, Loc, PosId, ReplicaId};
use tokio::sync::RwLock;

use crate::clock::ClockVector;
use crate::protocol::{
    CursorArgs, EditArgs, OpKind, Operation, ProtocolError, Request, SyncPhaseOneArgs,
    SyncPhaseOneReply, SyncPhaseTwoArgs, decode_patch, encode_patch,
};
use crate::storage::{OpLog, StoreError};
use crate::transport::PeerLink;

/// Rendering collaborator: poked after every remote mutation.
pub trait Redraw: Send + Sync {
    fn redraw_all(&self);
}

/// View collaborator: where is the local cursor right now.
pub trait CursorSource: Send + Sync {
    fn cursor(&self) -> Loc;
}

/// Errors surfaced by session operations.
#[derive(Debug)]
pub enum SessionError {
    Store(StoreError),
    Protocol(ProtocolError),
    /// Clock inconsistency that replay cannot reconcile. The document is
    /// left unchanged; an operator has to intervene.
    Divergence { peer: String, detail: String },
    Transport(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Store(e) => write!(f, "storage error: {e}"),
            SessionError::Protocol(e) => write!(f, "protocol error: {e}"),
            SessionError::Divergence { peer, detail } => {
                write!(f, "divergence with {peer}: {detail}")
            }
            SessionError::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Store(e)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}

/// Document plus mirror, mutated together under one lock.
struct DocState {
    document: Document,
    mirror: LineBuffer,
}

/// Per-peer transport and presence state.
#[derive(Default)]
struct PeerState {
    link: Option<Arc<PeerLink>>,
    cursor: Loc,
}

/// One replica's collaboration state.
pub struct Session {
    client_id: String,
    replica: ReplicaId,
    doc: Mutex<DocState>,
    clocks: Mutex<ClockVector>,
    peers: RwLock<HashMap<String, PeerState>>,
    store: Arc<OpLog>,
    notifier: Arc<dyn Redraw>,
}

impl Session {
    pub fn new(
        client_id: impl Into<String>,
        store: Arc<OpLog>,
        notifier: Arc<dyn Redraw>,
    ) -> Arc<Self> {
        let client_id = client_id.into();
        let replica = ReplicaId::from_addr(&client_id);
        Arc::new(Self {
            client_id,
            replica,
            doc: Mutex::new(DocState {
                document: Document::new(),
                mirror: LineBuffer::new(),
            }),
            clocks: Mutex::new(ClockVector::new()),
            peers: RwLock::new(HashMap::new()),
            store,
            notifier,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn store(&self) -> &Arc<OpLog> {
        &self.store
    }

    /// `Clock[self]`: highest op-id this replica has issued.
    pub fn local_clock(&self) -> u64 {
        self.clocks.lock().unwrap().get(&self.client_id)
    }

    /// `Clock[peer]`: highest op-id applied from `peer`.
    pub fn clock_of(&self, peer: &str) -> u64 {
        self.clocks.lock().unwrap().get(peer)
    }

    /// Rehydrate the clock vector from the clock store.
    pub fn load_clocks(&self, pairs: Vec<(String, u64)>) {
        self.clocks.lock().unwrap().load(pairs);
    }

    pub fn drain_dirty_clocks(&self) -> Vec<(String, u64)> {
        self.clocks.lock().unwrap().drain_dirty()
    }

    /// Visible text from the authoritative document.
    pub fn text(&self) -> String {
        self.doc.lock().unwrap().document.text()
    }

    /// Visible text as the mirror renders it.
    pub fn mirror_text(&self) -> String {
        self.doc.lock().unwrap().mirror.text()
    }

    pub fn line_count(&self) -> usize {
        self.doc.lock().unwrap().mirror.line_count()
    }

    pub async fn cursor_of(&self, peer: &str) -> Option<Loc> {
        self.peers.read().await.get(peer).map(|p| p.cursor)
    }

    // ─── Startup ──────────────────────────────────────────────────────

    /// Seed an empty session from file contents.
    ///
    /// Seeded atoms carry the reserved seed tag and a deterministic
    /// allocation walk, so two peers loading the same file materialize
    /// identical identifiers and start convergent.
    pub fn seed_text(&self, text: &str) -> Result<(), SessionError> {
        let mut last_id = 0;
        {
            let mut doc = self.doc.lock().unwrap();
            let mut last: Option<PosId> = None;
            for atom in text.chars() {
                let op_id = self.store.next_op_id();
                let pos = PosId::between(last.as_ref(), None, ReplicaId::SEED);
                doc.document.insert(pos.clone(), atom, op_id);
                self.store.append_insert(op_id, atom, &pos.encode())?;
                last = Some(pos);
                last_id = op_id;
            }
            doc.mirror = LineBuffer::from_text(text);
            doc.mirror.update();
        }
        if last_id > 0 {
            self.clocks.lock().unwrap().observe(&self.client_id, last_id);
        }
        Ok(())
    }

    /// Rebuild document and mirror by replaying the durable log.
    /// Returns the number of replayed operations.
    pub fn rebuild_from_log(&self) -> Result<usize, SessionError> {
        let last = self.store.last_op_id()?;
        if last == 0 {
            return Ok(0);
        }
        let ops = self.store.extract_between(1, last)?;
        let mut doc = self.doc.lock().unwrap();
        for op in &ops {
            let pos = match PosId::decode(&op.pos) {
                Ok(pos) => pos,
                Err(e) => {
                    log::warn!("skipping corrupt op {} in log: {e}", op.clock);
                    continue;
                }
            };
            match op.kind {
                OpKind::Insert => {
                    doc.document.insert(pos, op.atom, op.clock);
                }
                OpKind::Delete => {
                    doc.document.delete(&pos);
                }
            }
        }
        let text = doc.document.text();
        doc.mirror = LineBuffer::from_text(&text);
        doc.mirror.update();
        Ok(ops.len())
    }

    // ─── Local edit path ──────────────────────────────────────────────

    /// Insert `atom` at the visible location `loc`.
    ///
    /// Mutates document and mirror under the lock, records the op
    /// durably (fire-and-forget), and broadcasts it to every connected
    /// peer. Returns the broadcast payload.
    pub async fn insert_at(self: &Arc<Self>, loc: Loc, atom: char) -> EditArgs {
        let op_id = self.store.next_op_id();
        let pos = {
            let mut doc = self.doc.lock().unwrap();
            let rank = doc.mirror.char_pos(loc);
            let (left, right) = doc.document.neighbors(rank);
            let pos = PosId::between(left.as_ref(), right.as_ref(), self.replica);
            doc.document.insert(pos.clone(), atom, op_id);
            doc.mirror.insert(loc, atom);
            doc.mirror.update();
            debug_assert_eq!(doc.document.text(), doc.mirror.text());
            pos
        };
        self.clocks.lock().unwrap().observe(&self.client_id, op_id);

        let encoded = pos.encode();
        self.spawn_append(op_id, OpKind::Insert, atom, encoded.clone());
        let args = EditArgs {
            pos: encoded,
            atom,
            clock: op_id,
            cursor: loc,
            client_id: self.client_id.clone(),
        };
        self.broadcast_edit(OpKind::Insert, args.clone()).await;
        args
    }

    /// Delete the atom at the visible location `loc`. Returns the
    /// broadcast payload, or `None` when there is nothing there.
    pub async fn delete_at(self: &Arc<Self>, loc: Loc) -> Option<EditArgs> {
        let op_id = self.store.next_op_id();
        let removed = {
            let mut doc = self.doc.lock().unwrap();
            let rank = doc.mirror.char_pos(loc);
            match doc.document.entry_at(rank).map(|(p, e)| (p.clone(), e.atom)) {
                Some((pos, atom)) => {
                    doc.document.delete(&pos);
                    doc.mirror.remove(loc);
                    doc.mirror.update();
                    debug_assert_eq!(doc.document.text(), doc.mirror.text());
                    Some((pos, atom))
                }
                None => None,
            }
        };
        let (pos, atom) = removed?;
        self.clocks.lock().unwrap().observe(&self.client_id, op_id);

        let encoded = pos.encode();
        self.spawn_append(op_id, OpKind::Delete, atom, encoded.clone());
        let args = EditArgs {
            pos: encoded,
            atom,
            clock: op_id,
            cursor: loc,
            client_id: self.client_id.clone(),
        };
        self.broadcast_edit(OpKind::Delete, args.clone()).await;
        Some(args)
    }

    // ─── Remote apply path ────────────────────────────────────────────

    /// Apply a remote insert. Never fails: malformed input is dropped,
    /// duplicates are skipped, storage errors are logged.
    pub async fn apply_insert(&self, args: EditArgs) {
        if args.atom == '\0' || args.pos.is_empty() {
            return;
        }
        let pos = match PosId::decode(&args.pos) {
            Ok(pos) => pos,
            Err(e) => {
                log::warn!("dropping insert with bad position from {}: {e}", args.client_id);
                return;
            }
        };
        let op_id = self.store.next_op_id();
        let inserted = {
            let mut doc = self.doc.lock().unwrap();
            let (rank, exists) = doc.document.index_of(&pos);
            if exists {
                false
            } else {
                let loc = doc.mirror.from_char_pos(rank);
                doc.document.insert(pos, args.atom, op_id);
                doc.mirror.insert(loc, args.atom);
                doc.mirror.update();
                debug_assert_eq!(doc.document.text(), doc.mirror.text());
                true
            }
        };
        if inserted {
            self.spawn_append(op_id, OpKind::Insert, args.atom, args.pos.clone());
        }
        self.clocks.lock().unwrap().observe(&args.client_id, args.clock);
        self.set_peer_cursor(&args.client_id, args.cursor).await;
        self.notifier.redraw_all();
    }

    /// Apply a remote delete. Absent positions are skipped.
    pub async fn apply_delete(&self, args: EditArgs) {
        if args.atom == '\0' || args.pos.is_empty() {
            return;
        }
        let pos = match PosId::decode(&args.pos) {
            Ok(pos) => pos,
            Err(e) => {
                log::warn!("dropping delete with bad position from {}: {e}", args.client_id);
                return;
            }
        };
        let removed = {
            let mut doc = self.doc.lock().unwrap();
            let (rank, exists) = doc.document.index_of(&pos);
            if !exists {
                None
            } else {
                let loc = doc.mirror.from_char_pos(rank);
                let entry = doc.document.delete(&pos);
                doc.mirror.remove(loc);
                doc.mirror.update();
                debug_assert_eq!(doc.document.text(), doc.mirror.text());
                entry
            }
        };
        if let Some(entry) = removed {
            let op_id = self.store.next_op_id();
            self.spawn_append(op_id, OpKind::Delete, entry.atom, args.pos.clone());
        }
        self.clocks.lock().unwrap().observe(&args.client_id, args.clock);
        self.set_peer_cursor(&args.client_id, args.cursor).await;
        self.notifier.redraw_all();
    }

    /// Apply a remote cursor update, unless it is stale relative to an op
    /// already applied from that peer. Never touches the document.
    pub async fn apply_cursor(&self, args: CursorArgs) {
        if args.clock <= self.clock_of(&args.client_id) {
            return;
        }
        self.set_peer_cursor(&args.client_id, args.cursor).await;
    }

    /// Inbound connection request: remember the peer and open the reverse
    /// link if it is not already up. The *initiator* runs the sync
    /// protocol, not us.
    pub async fn handle_connect(&self, peer: &str) -> Result<(), SessionError> {
        let reverse_open = {
            let peers = self.peers.read().await;
            peers
                .get(peer)
                .and_then(|p| p.link.as_ref())
                .is_some_and(|l| l.is_open())
        };
        if reverse_open {
            return Ok(());
        }
        let link = PeerLink::dial(peer)
            .await
            .map_err(|e| SessionError::Transport(format!("reverse dial to {peer} failed: {e}")))?;
        self.register_link(peer, link).await;
        log::info!("peer {peer} connected");
        self.notifier.redraw_all();
        Ok(())
    }

    /// Peer is going away: close the link, keep all replication state.
    pub async fn handle_disconnect(&self, peer: &str) {
        self.mark_peer_closed(peer).await;
        log::info!("peer {peer} disconnected");
    }

    // ─── Sync protocol (receiver side + initiator commit) ─────────────

    /// Phase-one handler: compare clocks both ways, decide whether the
    /// initiator owes us a phase-two patch, and build our patch for it.
    pub fn sync_phase_one(
        &self,
        args: &SyncPhaseOneArgs,
    ) -> Result<SyncPhaseOneReply, SessionError> {
        let req_clock = self.clock_of(&args.client_id);
        let (phase_two, requester_clock) = if req_clock == args.sender_clock {
            (false, req_clock)
        } else if req_clock < args.sender_clock {
            (true, req_clock)
        } else {
            // Our view of the initiator is ahead of its self-report: its
            // storage has gone backwards. Replay cannot fix that.
            return Err(SessionError::Divergence {
                peer: args.client_id.clone(),
                detail: format!(
                    "observed initiator clock {req_clock} ahead of reported {}",
                    args.sender_clock
                ),
            });
        };

        let local_clock = self.local_clock();
        let patch = if local_clock == args.receiver_clock {
            Vec::new()
        } else if local_clock > args.receiver_clock {
            let ops = self.store.extract_between(args.receiver_clock + 1, local_clock)?;
            encode_patch(&ops)?
        } else {
            return Err(SessionError::Divergence {
                peer: args.client_id.clone(),
                detail: format!(
                    "initiator view {} ahead of local clock {local_clock}",
                    args.receiver_clock
                ),
            });
        };

        Ok(SyncPhaseOneReply { phase_two, requester_clock, patch })
    }

    /// Phase-two handler: apply the initiator's patch and advance its
    /// clock to the patch tail.
    pub fn sync_phase_two(&self, args: &SyncPhaseTwoArgs) -> Result<(), SessionError> {
        let ops = decode_patch(&args.patch)?;
        if let Some(last) = ops.last() {
            let tail = last.clock;
            self.apply_patch(&ops);
            self.clocks.lock().unwrap().observe(&args.client_id, tail);
            self.notifier.redraw_all();
        }
        Ok(())
    }

    /// Initiator side: the phase-one request for `peer`.
    pub fn build_phase_one_args(&self, peer: &str) -> SyncPhaseOneArgs {
        SyncPhaseOneArgs {
            client_id: self.client_id.clone(),
            sender_clock: self.local_clock(),
            receiver_clock: self.clock_of(peer),
        }
    }

    /// Initiator side: commit a phase-one reply. Applies the receiver's
    /// patch and, when asked, builds the phase-two patch to send back.
    pub fn commit_phase_one(
        &self,
        peer: &str,
        reply: &SyncPhaseOneReply,
    ) -> Result<Option<SyncPhaseTwoArgs>, SessionError> {
        let ops = decode_patch(&reply.patch)?;
        if let Some(last) = ops.last() {
            let tail = last.clock;
            self.apply_patch(&ops);
            self.clocks.lock().unwrap().observe(peer, tail);
            self.notifier.redraw_all();
        }
        if !reply.phase_two {
            return Ok(None);
        }
        let ops = self
            .store
            .extract_between(reply.requester_clock + 1, self.local_clock())?;
        Ok(Some(SyncPhaseTwoArgs {
            client_id: self.client_id.clone(),
            patch: encode_patch(&ops)?,
        }))
    }

    /// Replay a patch in ascending clock order, one lock acquisition per
    /// op so local input can interleave. Returns how many ops changed the
    /// document (the rest were idempotence hits).
    pub fn apply_patch(&self, ops: &[Operation]) -> usize {
        let mut applied = 0;
        for op in ops {
            let pos = match PosId::decode(&op.pos) {
                Ok(pos) => pos,
                Err(e) => {
                    log::warn!("skipping patch op {} with bad position: {e}", op.clock);
                    continue;
                }
            };
            match op.kind {
                OpKind::Insert => {
                    // Probe before paying for an op-id; re-check under the
                    // lock in case a concurrent apply raced us.
                    if self.doc.lock().unwrap().document.index_of(&pos).1 {
                        continue;
                    }
                    let op_id = self.store.next_op_id();
                    let mut doc = self.doc.lock().unwrap();
                    let (rank, exists) = doc.document.index_of(&pos);
                    if exists {
                        continue;
                    }
                    let loc = doc.mirror.from_char_pos(rank);
                    doc.document.insert(pos, op.atom, op_id);
                    doc.mirror.insert(loc, op.atom);
                    doc.mirror.update();
                    debug_assert_eq!(doc.document.text(), doc.mirror.text());
                    drop(doc);
                    self.spawn_append(op_id, OpKind::Insert, op.atom, op.pos.clone());
                    applied += 1;
                }
                OpKind::Delete => {
                    let removed = {
                        let mut doc = self.doc.lock().unwrap();
                        let (rank, exists) = doc.document.index_of(&pos);
                        if !exists {
                            None
                        } else {
                            let loc = doc.mirror.from_char_pos(rank);
                            let entry = doc.document.delete(&pos);
                            doc.mirror.remove(loc);
                            doc.mirror.update();
                            debug_assert_eq!(doc.document.text(), doc.mirror.text());
                            entry
                        }
                    };
                    if let Some(entry) = removed {
                        let op_id = self.store.next_op_id();
                        self.spawn_append(op_id, OpKind::Delete, entry.atom, op.pos.clone());
                        applied += 1;
                    }
                }
            }
        }
        applied
    }

    // ─── Peer table ───────────────────────────────────────────────────

    pub async fn register_link(&self, peer: &str, link: Arc<PeerLink>) {
        let mut peers = self.peers.write().await;
        peers.entry(peer.to_owned()).or_default().link = Some(link);
    }

    pub async fn link_of(&self, peer: &str) -> Option<Arc<PeerLink>> {
        self.peers
            .read()
            .await
            .get(peer)
            .and_then(|p| p.link.clone())
            .filter(|l| l.is_open())
    }

    /// Mark a peer's transport closed after a send failure. No state is
    /// discarded; the next successful connect re-syncs.
    pub async fn mark_peer_closed(&self, peer: &str) {
        let mut peers = self.peers.write().await;
        if let Some(state) = peers.get_mut(peer) {
            if let Some(link) = state.link.take() {
                link.close();
            }
        }
    }

    /// Every peer with an open link.
    pub async fn open_links(&self) -> Vec<(String, Arc<PeerLink>)> {
        self.peers
            .read()
            .await
            .iter()
            .filter_map(|(peer, state)| {
                state
                    .link
                    .as_ref()
                    .filter(|l| l.is_open())
                    .map(|l| (peer.clone(), l.clone()))
            })
            .collect()
    }

    async fn set_peer_cursor(&self, peer: &str, cursor: Loc) {
        let mut peers = self.peers.write().await;
        peers.entry(peer.to_owned()).or_default().cursor = cursor;
    }

    // ─── Plumbing ─────────────────────────────────────────────────────

    /// Fan an edit out to every connected peer. Sends are spawned with
    /// arguments captured by value; a failed send closes that peer's link.
    async fn broadcast_edit(self: &Arc<Self>, kind: OpKind, args: EditArgs) {
        for (peer, link) in self.open_links().await {
            let session = Arc::clone(self);
            let request = match kind {
                OpKind::Insert => Request::Insert(args.clone()),
                OpKind::Delete => Request::Delete(args.clone()),
            };
            tokio::spawn(async move {
                if let Err(e) = link.call(request).await {
                    log::warn!("edit broadcast to {peer} failed: {e}");
                    session.mark_peer_closed(&peer).await;
                }
            });
        }
    }

    /// Durable append on a background task; failures are logged and the
    /// in-memory document stays authoritative for the session.
    fn spawn_append(&self, op_id: u64, kind: OpKind, atom: char, pos: Vec<u8>) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let result = match kind {
                OpKind::Insert => store.append_insert(op_id, atom, &pos),
                OpKind::Delete => store.append_delete(op_id, atom, &pos),
            };
            if let Err(e) = result {
                log::error!("durable append of op {op_id} failed: {e}");
            }
        });
    }
}

/// A notifier that does nothing; for headless tests.
pub struct NullRedraw;

impl Redraw for NullRedraw {
    fn redraw_all(&self) {}
}
