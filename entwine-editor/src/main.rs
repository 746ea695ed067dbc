//! Entwine node: a peer-to-peer collaborative editor replica.
//!
//! Listens on the local address, dials the remote peer, reconciles
//! histories with the pair-wise sync protocol, and then keeps both sides
//! convergent with single-operation broadcasts plus the periodic cursor
//! channel. Runs until interrupted.

mod view;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio::net::TcpListener;

use entwine_collab::cursor::spawn_cursor_sender;
use entwine_collab::protocol::{DisconnectArgs, Request};
use entwine_collab::session::Session;
use entwine_collab::storage::{OpLog, StoreConfig};
use entwine_collab::sync::establish;
use entwine_collab::transport::serve;
use view::ViewState;

#[derive(Parser, Debug)]
#[command(name = "entwine", version, about = "Peer-to-peer collaborative editor node")]
struct Cli {
    /// Local listen address (host:port)
    local: String,

    /// Remote peer address (host:port)
    remote: String,

    /// Files to open; the first seeds an empty document
    files: Vec<PathBuf>,

    /// Directory for the durable operation log
    /// (default: entwine-data-<local-address>)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("entwine: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = cli
        .data_dir
        .unwrap_or_else(|| PathBuf::from(format!("entwine-data-{}", cli.local.replace(':', "-"))));

    let store = Arc::new(OpLog::open(StoreConfig {
        path: data_dir,
        ..StoreConfig::default()
    })?);

    let view = ViewState::new();
    let session = Session::new(cli.local.clone(), store.clone(), view.clone());

    // Rehydrate what this replica already knew.
    session.load_clocks(store.load_clocks()?);
    let replayed = session.rebuild_from_log()?;
    if replayed > 0 {
        info!("restored document from {replayed} logged operations");
    } else if let Some(file) = cli.files.first() {
        let text = std::fs::read_to_string(file)?;
        session.seed_text(&text)?;
        info!("seeded document from {} ({} lines)", file.display(), session.line_count());
    }
    if cli.files.len() > 1 {
        warn!("multiple files given; only {} is opened", cli.files[0].display());
    }

    // The listen socket must bind or the node is useless.
    let listener = TcpListener::bind(&cli.local)
        .await
        .map_err(|e| format!("cannot listen on {}: {e}", cli.local))?;
    info!("listening on {}", cli.local);
    tokio::spawn(serve(session.clone(), listener));

    // Dial the configured peer once; a failure is not fatal — the peer
    // can dial us instead, and sync runs on whichever connect succeeds.
    match establish(&session, &cli.remote).await {
        Ok(()) => info!("synchronized with {}", cli.remote),
        Err(e) => warn!("could not reach {}: {e}", cli.remote),
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let cursor_task = spawn_cursor_sender(session.clone(), view, shutdown_rx);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(());
    let _ = cursor_task.await;

    // Tell peers we are leaving voluntarily; they keep all state and will
    // catch us up when we come back.
    for (peer, link) in session.open_links().await {
        let request =
            Request::Disconnect(DisconnectArgs { client_id: session.client_id().to_owned() });
        if let Err(e) = link.call(request).await {
            log::debug!("disconnect notice to {peer} failed: {e}");
        }
    }

    // One last clock flush so restart resumes where we stopped.
    let dirty = session.drain_dirty_clocks();
    if let Err(e) = store.flush_clocks(&dirty) {
        error!("final clock flush failed: {e}");
    }
    Ok(())
}
