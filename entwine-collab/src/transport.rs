//! Peer transport: WebSocket-over-TCP RPC links.
//!
//! Links are directional, like the sockets under them: the dialer holds a
//! [`PeerLink`] and issues requests on it; the accepting side serves
//! requests on its inbound connection. A connected pair therefore has two
//! sockets, one per direction, and [`Session::handle_connect`] opens the
//! reverse one.
//!
//! Requests and replies are correlated by frame id through a pending-call
//! map. A transport failure closes the link and fails the in-flight calls;
//! nothing else is torn down — the sync protocol repairs history on the
//! next connect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Frame, FrameBody, ProtocolError, Reply, Request};
use crate::session::Session;

/// How long a call waits for its reply before giving up on the link.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Outgoing message buffer per link.
const SEND_QUEUE: usize = 256;

/// Transport errors.
#[derive(Debug)]
pub enum TransportError {
    /// Dial failed or the link is no longer open.
    Closed,
    /// The peer did not reply in time.
    Timeout,
    Codec(ProtocolError),
    Io(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Closed => write!(f, "link closed"),
            TransportError::Timeout => write!(f, "call timed out"),
            TransportError::Codec(e) => write!(f, "codec error: {e}"),
            TransportError::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        TransportError::Codec(e)
    }
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Reply>>>;

/// An outbound RPC link to one peer.
pub struct PeerLink {
    addr: String,
    outgoing: mpsc::Sender<Vec<u8>>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    open: AtomicBool,
}

impl PeerLink {
    /// Dial a peer and spawn its writer and reader tasks.
    pub async fn dial(addr: &str) -> Result<Arc<PeerLink>, TransportError> {
        let url = format!("ws://{addr}");
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (outgoing, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(SEND_QUEUE);
        let link = Arc::new(PeerLink {
            addr: addr.to_owned(),
            outgoing,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            open: AtomicBool::new(true),
        });

        // Writer: drain the outgoing queue onto the socket.
        tokio::spawn(async move {
            while let Some(data) = outgoing_rx.recv().await {
                if sink.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
        });

        // Reader: resolve replies against the pending-call map.
        let reader_link = link.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match Frame::decode(&bytes) {
                            Ok(Frame { id, body: FrameBody::Reply(reply) }) => {
                                let waiter = reader_link.pending.lock().unwrap().remove(&id);
                                if let Some(tx) = waiter {
                                    let _ = tx.send(reply);
                                } else {
                                    log::debug!("reply {id} from {} had no waiter", reader_link.addr);
                                }
                            }
                            Ok(_) => {
                                log::debug!("ignoring request frame on outbound link to {}", reader_link.addr);
                            }
                            Err(e) => {
                                log::warn!("bad frame from {}: {e}", reader_link.addr);
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            reader_link.close();
        });

        Ok(link)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Close the link and fail every in-flight call.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.pending.lock().unwrap().clear();
    }

    /// Issue a request and wait for the peer's reply.
    pub async fn call(&self, request: Request) -> Result<Reply, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let encoded = Frame::request(id, request).encode()?;
        if self.outgoing.send(encoded).await.is_err() {
            self.pending.lock().unwrap().remove(&id);
            self.close();
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Pending map was cleared: the socket died under us.
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }
}

/// Accept inbound peer connections and serve their requests against the
/// session. Runs until the listener fails.
pub async fn serve(session: Arc<Session>, listener: TcpListener) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("accept failed: {e}");
                return;
            }
        };
        log::debug!("inbound connection from {addr}");
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_inbound(session, stream, addr).await {
                log::warn!("connection from {addr} ended with error: {e}");
            }
        });
    }
}

/// Serve one inbound connection: decode request frames, dispatch, reply.
async fn handle_inbound(
    session: Arc<Session>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), TransportError> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    let (mut sink, mut stream) = ws.split();

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                let frame = match Frame::decode(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("dropping undecodable frame from {addr}: {e}");
                        continue;
                    }
                };
                let FrameBody::Request(request) = frame.body else {
                    log::debug!("ignoring reply frame on inbound connection from {addr}");
                    continue;
                };
                let reply = dispatch(&session, request).await;
                let encoded = Frame::reply(frame.id, reply).encode()?;
                sink.send(Message::Binary(encoded.into()))
                    .await
                    .map_err(|e| TransportError::Io(e.to_string()))?;
            }
            Ok(Message::Ping(data)) => {
                sink.send(Message::Pong(data))
                    .await
                    .map_err(|e| TransportError::Io(e.to_string()))?;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
    log::debug!("connection from {addr} closed");
    Ok(())
}

/// Route one request to its session handler.
async fn dispatch(session: &Arc<Session>, request: Request) -> Reply {
    match request {
        Request::Insert(args) => {
            session.apply_insert(args).await;
            Reply::Ack
        }
        Request::Delete(args) => {
            session.apply_delete(args).await;
            Reply::Ack
        }
        Request::Connect(args) => match session.handle_connect(&args.client_id).await {
            Ok(()) => Reply::Ack,
            Err(e) => {
                log::warn!("connect from {} failed: {e}", args.client_id);
                Reply::Error(e.to_string())
            }
        },
        Request::Disconnect(args) => {
            session.handle_disconnect(&args.client_id).await;
            Reply::Ack
        }
        Request::SyncPhaseOne(args) => match session.sync_phase_one(&args) {
            Ok(reply) => Reply::SyncPhaseOne(reply),
            Err(e) => {
                log::error!("sync phase one from {} failed: {e}", args.client_id);
                Reply::Error(e.to_string())
            }
        },
        Request::SyncPhaseTwo(args) => match session.sync_phase_two(&args) {
            Ok(()) => Reply::Ack,
            Err(e) => {
                log::error!("sync phase two from {} failed: {e}", args.client_id);
                Reply::Error(e.to_string())
            }
        },
        Request::CursorUpdate(args) => {
            session.apply_cursor(args).await;
            Reply::Ack
        }
    }
}
