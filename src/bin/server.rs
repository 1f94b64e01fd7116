//! HTTP/JSON + WebSocket front end (§4.7, §6.2). Unlike the stdio front end,
//! one process serves every registered connection; enrichment engines are
//! built lazily per connection and read cross-process events from the drop
//! directory instead of writing to it, so a stdio front end sharing the same
//! store is never double-published to.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use memento::connections::ConnectionManager;
use memento::events::{dropdir, EventHub};
use memento::http::{build_router, AppState};
use memento::types::Event;
use memento::Config;

#[tokio::main]
async fn main() -> memento::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .with(tracing_subscriber::EnvFilter::new(std::env::var("MEMENTO_LOG").unwrap_or_else(|_| "info".into())))
        .init();

    let config = Arc::new(Config::parse());
    let registry_path = config.resolved_connections_config_path()?;
    let connections = Arc::new(ConnectionManager::open(&registry_path)?);

    let event_hub = EventHub::spawn();
    let cancel = CancellationToken::new();

    spawn_dropdir_reader(config.events_dir()?, event_hub.clone())?;

    let state = AppState::new(connections, config.clone(), event_hub, cancel.clone());
    let app = build_router(state);

    let addr = format!("{}:{}", config.bind_host, config.bind_port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("memento HTTP front end listening on {addr}");

    let serve_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
        .await?;

    Ok(())
}

/// Watch the cross-process drop directory and re-publish every peer-written
/// event into this process's [`EventHub`], so `/ws` subscribers see writes
/// made by a stdio front end sharing the same store (§4.2).
fn spawn_dropdir_reader(dir: std::path::PathBuf, hub: EventHub) -> memento::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watcher = dropdir::watch(dir, tx)?;

    tokio::spawn(async move {
        // Keep the watcher alive for the task's lifetime instead of letting
        // it drop when this spawning function returns.
        let _watcher = _watcher;
        while let Some(payload) = rx.recv().await {
            let event = Event { event_type: payload.event_type, memory_id: payload.memory_id.into(), time_ns: payload.time };
            hub.publish(event);
        }
    });

    Ok(())
}
