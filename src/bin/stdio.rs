//! JSON-RPC stdio front end (§4.7, §6.1). One process serves one connection;
//! enrichment events are fanned out to the drop directory so the HTTP front
//! end can observe them without owning its own engine over the same store.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use memento::connections::ConnectionManager;
use memento::enrichment::{DefaultAgentIdentity, EngineConfig, HashEmbedder, MemoryEngine, NaiveExtractor};
use memento::events::dropdir::DropDirWriter;
use memento::mcp::dispatch::Dispatcher;
use memento::mcp::protocol::McpServer;
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

    let connection_name = if config.connection.is_empty() {
        connections.get_default_connection()?.name
    } else {
        config.connection.clone()
    };
    let conn = connections
        .list_connections()
        .into_iter()
        .find(|c| c.name == connection_name)
        .ok_or_else(|| memento::MementoError::NotFound(format!("connection '{connection_name}'")))?;

    let store = connections.get_store(&connection_name).await?;
    let taxonomy = connections.get_merged_taxonomy(&connection_name).await?;
    let dropdir = Arc::new(DropDirWriter::new(config.events_dir()?)?);

    let num_workers =
        if matches!(conn.database.kind, memento::types::DatabaseKind::EmbeddedFile) && conn.llm.provider.is_local() {
            1
        } else {
            config.num_workers
        };

    let engine_config = EngineConfig {
        num_workers,
        embedding_model: conn.llm.embedding_model.clone(),
        valid_entity_types: taxonomy.all_entity_types.into_iter().map(|t| t.id).collect(),
        valid_relationship_types: taxonomy.all_relationship_types.into_iter().map(|t| t.id).collect(),
        ..EngineConfig::default()
    };

    let engine = Arc::new(MemoryEngine::new(
        store,
        Arc::new(NaiveExtractor),
        Arc::new(HashEmbedder::new(conn.llm.embedding_model.clone(), 256)),
        None,
        Some(dropdir),
        engine_config,
    ));

    let token = CancellationToken::new();
    engine.start(token.clone());

    let dispatcher = Dispatcher::new(connections, connection_name, engine, Arc::new(DefaultAgentIdentity));
    let server = McpServer::new(dispatcher);

    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c_token.cancel();
    });

    server.run(token).await
}
