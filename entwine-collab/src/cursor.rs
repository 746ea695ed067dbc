//! Cursor piggyback channel.
//!
//! Once a second, the local cursor is read from the view collaborator and
//! sent to every connected peer, stamped with `Clock[self]` — the same
//! clock that stamps ops, which is what makes the receiver's staleness
//! gate work. The tick also flushes dirty clock-vector entries to the
//! store, so clock persistence rides the same cadence.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::protocol::{CursorArgs, Request};
use crate::session::{CursorSource, Session};

/// Reference cadence for cursor broadcast and clock flush.
const TICK: Duration = Duration::from_secs(1);

/// Spawn the periodic cursor sender. Terminates when `shutdown` fires or
/// every sender is dropped.
pub fn spawn_cursor_sender(
    session: Arc<Session>,
    view: Arc<dyn CursorSource>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let args = CursorArgs {
                        cursor: view.cursor(),
                        clock: session.local_clock(),
                        client_id: session.client_id().to_owned(),
                    };
                    for (peer, link) in session.open_links().await {
                        let session = session.clone();
                        let args = args.clone();
                        tokio::spawn(async move {
                            if let Err(e) = link.call(Request::CursorUpdate(args)).await {
                                log::warn!("cursor update to {peer} failed: {e}");
                                // TODO: redial with backoff and re-run the
                                // sync handshake instead of waiting for an
                                // operator-driven reconnect.
                                session.mark_peer_closed(&peer).await;
                            }
                        });
                    }

                    let dirty = session.drain_dirty_clocks();
                    if !dirty.is_empty() {
                        if let Err(e) = session.store().flush_clocks(&dirty) {
                            log::error!("clock flush failed: {e}");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    log::debug!("cursor sender stopped");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::NullRedraw;
    use crate::storage::{OpLog, StoreConfig};
    use entwine_core::Loc;
    use std::sync::Mutex;

    struct FixedCursor(Mutex<Loc>);

    impl CursorSource for FixedCursor {
        fn cursor(&self) -> Loc {
            *self.0.lock().unwrap()
        }
    }

    #[tokio::test]
    async fn sender_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(OpLog::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let session = Session::new("127.0.0.1:7001", store, Arc::new(NullRedraw));
        let view = Arc::new(FixedCursor(Mutex::new(Loc::new(1, 2))));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = spawn_cursor_sender(session, view, shutdown_rx);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sender should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn tick_flushes_dirty_clocks() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(OpLog::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let session = Session::new("127.0.0.1:7001", store.clone(), Arc::new(NullRedraw));
        session.insert_at(Loc::new(0, 0), 'x').await;

        let view = Arc::new(FixedCursor(Mutex::new(Loc::default())));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = spawn_cursor_sender(session, view, shutdown_rx);

        // First tick fires immediately and flushes Clock[self].
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();
        let _ = handle.await;

        let clocks = store.load_clocks().unwrap();
        assert_eq!(clocks, vec![("127.0.0.1:7001".to_owned(), 1)]);
    }
}
