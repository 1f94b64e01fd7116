//! Connection Manager (C3, §4.3): a name-keyed registry of lazily-opened
//! stores, generalizing a single-store lazy-construction pattern into a
//! multi-connection one, guarded by a `parking_lot::RwLock` the same way a
//! client-map registry would be.

pub mod settings_overlay;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{MementoError, Result};
use crate::storage::{DbAccess, Overlay, SearchProvider, SqliteBackend, Store};
use crate::types::{Connection, ConnectionsRegistry, DatabaseConfig, DatabaseKind, ListOptions};

#[cfg(feature = "postgres")]
use crate::storage::PostgresBackend;

pub use settings_overlay::SettingsOverlayStore;

/// A constructed store plus whichever optional capability traits (§9
/// "duck typing → capability set") its concrete backend happens to satisfy.
/// Captured once at construction time, since `Arc<dyn Store>` alone can't be
/// downcast back to `Arc<dyn SearchProvider>`/`Arc<dyn DbAccess>`.
#[derive(Clone)]
pub struct StoreHandle {
    pub store: Arc<dyn Store>,
    pub search: Option<Arc<dyn SearchProvider>>,
    pub db: Option<Arc<dyn DbAccess>>,
    pub overlay: Option<Arc<dyn Overlay>>,
}

/// Whether a cached store was constructed by the manager (and should be
/// closed on invalidation) or supplied by the caller (who retains ownership).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    Owned,
    Borrowed,
}

/// Registry of named `{store, LLM config}` pairs (§4.3). Stores are opened
/// lazily on first use and cached; `Update`/`Delete` invalidate the cache.
pub struct ConnectionManager {
    registry: RwLock<ConnectionsRegistry>,
    opened: RwLock<HashMap<String, StoreHandle>>,
    ownership: RwLock<HashMap<String, Ownership>>,
    /// `None` for a manager wrapping a single borrowed store — read-only,
    /// no file to persist to (§4.3).
    registry_path: Option<PathBuf>,
}

impl ConnectionManager {
    /// Load (or default-initialize) a registry from a JSON file on disk.
    pub fn open(registry_path: impl AsRef<Path>) -> Result<Self> {
        let registry_path = registry_path.as_ref().to_path_buf();
        let registry = if registry_path.exists() {
            let text = std::fs::read_to_string(&registry_path)?;
            serde_json::from_str(&text)?
        } else {
            let registry = ConnectionsRegistry::default();
            if let Some(parent) = registry_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&registry_path, serde_json::to_string_pretty(&registry)?)?;
            registry
        };
        Ok(Self {
            registry: RwLock::new(registry),
            opened: RwLock::new(HashMap::new()),
            ownership: RwLock::new(HashMap::new()),
            registry_path: Some(registry_path),
        })
    }

    /// Wrap a single caller-supplied store as a read-only, registry-less view
    /// (§4.3: "a manager created from a pre-existing borrowed store has no
    /// registry file").
    pub fn from_borrowed_store(name: impl Into<String>, store: Arc<dyn Store>) -> Self {
        let name = name.into();
        let mut registry = ConnectionsRegistry::default();
        registry.default_connection = name.clone();
        registry.connections.push(Connection::new(name.clone(), DatabaseConfig::default()));

        let mut opened = HashMap::new();
        opened.insert(name.clone(), StoreHandle { store, search: None, db: None, overlay: None });
        let mut ownership = HashMap::new();
        ownership.insert(name, Ownership::Borrowed);

        Self {
            registry: RwLock::new(registry),
            opened: RwLock::new(opened),
            ownership: RwLock::new(ownership),
            registry_path: None,
        }
    }

    fn persist(&self) -> Result<()> {
        if let Some(path) = &self.registry_path {
            let registry = self.registry.read();
            std::fs::write(path, serde_json::to_string_pretty(&*registry)?)?;
        }
        Ok(())
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            return p.to_path_buf();
        }
        match &self.registry_path {
            Some(registry_path) => registry_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(p),
            None => p.to_path_buf(),
        }
    }

    fn find_connection(&self, name: &str) -> Result<Connection> {
        self.registry
            .read()
            .connections
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| MementoError::NotFound(format!("connection '{name}'")))
    }

    async fn construct_store(&self, conn: &Connection) -> Result<StoreHandle> {
        match conn.database.kind {
            DatabaseKind::EmbeddedFile => {
                let path = conn
                    .database
                    .path
                    .as_deref()
                    .ok_or_else(|| MementoError::Config("embedded-file connection missing path".into()))?;
                let resolved = self.resolve_path(path);
                let resolved_str = resolved.to_string_lossy().to_string();
                let backend = tokio::task::spawn_blocking(move || SqliteBackend::open(&resolved_str))
                    .await
                    .map_err(|e| MementoError::Internal(e.to_string()))??;
                let backend = Arc::new(backend);
                // SqliteBackend implements DbAccess but not SearchProvider (§4.1, §4.6):
                // full-text search on this backend falls back to substring matching.
                Ok(StoreHandle { store: backend.clone(), search: None, db: Some(backend.clone()), overlay: Some(backend) })
            }
            #[cfg(feature = "postgres")]
            DatabaseKind::Postgres => {
                let dsn = conn
                    .database
                    .dsn
                    .as_deref()
                    .ok_or_else(|| MementoError::Config("postgres connection missing dsn".into()))?;
                let backend = PostgresBackend::connect(dsn).await.map_err(|e| {
                    MementoError::Storage(e.redacted())
                })?;
                let backend = Arc::new(backend);
                Ok(StoreHandle {
                    store: backend.clone(),
                    search: Some(backend.clone()),
                    db: Some(backend.clone()),
                    overlay: Some(backend),
                })
            }
            #[cfg(not(feature = "postgres"))]
            DatabaseKind::Postgres => Err(MementoError::Config(
                "postgres support not compiled into this build".into(),
            )),
        }
    }

    /// Resolve an empty name to the registry's default connection; returns the
    /// cached store or constructs and caches it (§4.3 `GetStore`).
    pub async fn get_store(&self, name: &str) -> Result<Arc<dyn Store>> {
        Ok(self.get_store_handle(name).await?.store)
    }

    /// Same as [`Self::get_store`] but also returns whichever optional
    /// capability traits the backend satisfies, for the search dispatcher
    /// and activity/graph queries (§4.6).
    pub async fn get_store_handle(&self, name: &str) -> Result<StoreHandle> {
        let name = self.resolve_name(name);

        if let Some(handle) = self.opened.read().get(&name).cloned() {
            return Ok(handle);
        }

        let conn = self.find_connection(&name)?;
        if !conn.enabled {
            return Err(MementoError::InvalidInput(format!("connection '{name}' is disabled")));
        }

        let handle = self.construct_store(&conn).await?;
        self.opened.write().insert(name.clone(), handle.clone());
        self.ownership.write().insert(name, Ownership::Owned);
        Ok(handle)
    }

    fn resolve_name(&self, name: &str) -> String {
        if name.is_empty() {
            self.registry.read().default_connection.clone()
        } else {
            name.to_string()
        }
    }

    async fn invalidate(&self, name: &str) {
        let owned = self.ownership.write().remove(name);
        if let Some(handle) = self.opened.write().remove(name) {
            if owned == Some(Ownership::Owned) {
                let _ = handle.store.close().await;
            }
        }
    }

    pub fn add_connection(&self, conn: Connection) -> Result<()> {
        let mut registry = self.registry.write();
        if registry.connections.iter().any(|c| c.name == conn.name) {
            return Err(MementoError::Conflict(format!("connection '{}' already exists", conn.name)));
        }
        if registry.connections.len() >= registry.settings.max_connections {
            return Err(MementoError::InvalidInput("max_connections reached".into()));
        }
        registry.connections.push(conn);
        drop(registry);
        self.persist()
    }

    pub async fn update_connection(&self, name: &str, updated: Connection) -> Result<()> {
        {
            let mut registry = self.registry.write();
            let slot = registry
                .connections
                .iter_mut()
                .find(|c| c.name == name)
                .ok_or_else(|| MementoError::NotFound(format!("connection '{name}'")))?;
            *slot = updated;
        }
        self.invalidate(name).await;
        self.persist()
    }

    pub async fn delete_connection(&self, name: &str) -> Result<()> {
        {
            let registry = self.registry.read();
            if registry.default_connection == name {
                return Err(MementoError::InvalidInput("cannot delete the default connection".into()));
            }
        }
        {
            let mut registry = self.registry.write();
            let before = registry.connections.len();
            registry.connections.retain(|c| c.name != name);
            if registry.connections.len() == before {
                return Err(MementoError::NotFound(format!("connection '{name}'")));
            }
        }
        self.invalidate(name).await;
        self.persist()
    }

    pub fn set_default_connection(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.write();
        if !registry.connections.iter().any(|c| c.name == name) {
            return Err(MementoError::NotFound(format!("connection '{name}'")));
        }
        registry.default_connection = name.to_string();
        drop(registry);
        self.persist()
    }

    /// Open a fresh store with `cfg`, run a trivial listing, close it (§4.3 `TestConnection`).
    pub async fn test_connection(&self, cfg: &DatabaseConfig) -> Result<()> {
        let probe = Connection::new("__probe__", cfg.clone());
        let handle = self.construct_store(&probe).await?;
        let token = CancellationToken::new();
        handle.store.list(&ListOptions::default(), &token).await?;
        handle.store.close().await
    }

    /// Merged taxonomy for a connection's overlay (§4.4 `ApplyOverlay`).
    pub async fn get_merged_taxonomy(&self, name: &str) -> Result<crate::types::MergedTaxonomy> {
        let overlay = self.get_overlay(name).await?;
        Ok(SettingsOverlayStore::merge(&overlay))
    }

    pub async fn get_overlay(&self, name: &str) -> Result<crate::types::SettingsOverlay> {
        let handle = self.get_store_handle(name).await?;
        let name = self.resolve_name(name);
        match handle.overlay {
            Some(overlay) => overlay.load_overlay(&name, &CancellationToken::new()).await,
            None => Ok(crate::types::SettingsOverlay { connection_id: name, ..Default::default() }),
        }
    }

    pub async fn save_overlay(&self, name: &str, overlay: &crate::types::SettingsOverlay) -> Result<()> {
        let handle = self.get_store_handle(name).await?;
        match handle.overlay {
            Some(backend) => backend.save_overlay(overlay, &CancellationToken::new()).await,
            None => Err(MementoError::Config(format!("connection '{name}' has no overlay-capable backend"))),
        }
    }

    pub fn list_connections(&self) -> Vec<Connection> {
        self.registry.read().connections.clone()
    }

    pub fn get_default_connection(&self) -> Result<Connection> {
        let name = self.registry.read().default_connection.clone();
        self.find_connection(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_get_store_opens_embedded_file() {
        let dir = std::env::temp_dir().join(format!("memento-test-{}", crate::types::generate_id()));
        std::fs::create_dir_all(&dir).unwrap();
        let registry_path = dir.join("connections.json");
        let manager = ConnectionManager::open(&registry_path).unwrap();

        let db_path = dir.join("default.db").to_string_lossy().to_string();
        manager
            .add_connection(Connection::new(
                "default",
                DatabaseConfig {
                    kind: DatabaseKind::EmbeddedFile,
                    path: Some(db_path),
                    dsn: None,
                },
            ))
            .unwrap();
        manager.set_default_connection("default").unwrap();

        let store = manager.get_store("").await.unwrap();
        let page = store
            .list(&ListOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn delete_default_connection_is_refused() {
        let dir = std::env::temp_dir().join(format!("memento-test-{}", crate::types::generate_id()));
        std::fs::create_dir_all(&dir).unwrap();
        let manager = ConnectionManager::open(dir.join("connections.json")).unwrap();
        manager
            .add_connection(Connection::new("default", DatabaseConfig::default()))
            .unwrap();
        manager.set_default_connection("default").unwrap();

        let result = manager.delete_connection("default").await;
        assert!(result.is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn relative_path_resolves_against_registry_directory() {
        let dir = std::env::temp_dir().join(format!("memento-test-{}", crate::types::generate_id()));
        std::fs::create_dir_all(&dir).unwrap();
        let registry_path = dir.join("connections.json");
        let manager = ConnectionManager::open(&registry_path).unwrap();
        let resolved = manager.resolve_path("data.db");
        assert_eq!(resolved, dir.join("data.db"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
