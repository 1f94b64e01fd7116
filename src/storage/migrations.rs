//! Schema versioning, per backend: an incremental `migrate_v1()..migrate_vN()`
//! pattern applied to this crate's memory/entity/relationship/embedding data
//! model.

use rusqlite::Connection;

use crate::error::Result;

/// Current SQLite schema version.
pub const SQLITE_SCHEMA_VERSION: i32 = 1;

/// Run all pending SQLite migrations.
pub fn run_sqlite_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        sqlite_migrate_v1(conn)?;
    }

    Ok(())
}

fn sqlite_migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            source TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            timestamp TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            created_by TEXT,
            importance REAL NOT NULL DEFAULT 0.5,
            access_count INTEGER NOT NULL DEFAULT 0,
            decay_score REAL NOT NULL DEFAULT 1.0,
            status TEXT NOT NULL DEFAULT 'pending',
            entity_status TEXT NOT NULL DEFAULT 'pending',
            relationship_status TEXT NOT NULL DEFAULT 'pending',
            embedding_status TEXT NOT NULL DEFAULT 'pending',
            enrichment_attempts INTEGER NOT NULL DEFAULT 0,
            enrichment_error TEXT,
            enriched_at TEXT,
            deleted_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_memories_status ON memories(status);
        CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at);

        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            description TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memory_entities (
            memory_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            PRIMARY KEY (memory_id, entity_id),
            FOREIGN KEY (memory_id) REFERENCES memories(id) ON DELETE CASCADE,
            FOREIGN KEY (entity_id) REFERENCES entities(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_memory_entities_memory ON memory_entities(memory_id);
        CREATE INDEX IF NOT EXISTS idx_memory_entities_entity ON memory_entities(entity_id);

        CREATE TABLE IF NOT EXISTS relationships (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            relationship_type TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 1.0,
            bidirectional INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY (source_id) REFERENCES entities(id) ON DELETE CASCADE,
            FOREIGN KEY (target_id) REFERENCES entities(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_id);
        CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_id);

        CREATE TABLE IF NOT EXISTS embeddings (
            memory_id TEXT NOT NULL,
            model_name TEXT NOT NULL,
            vector BLOB NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (memory_id, model_name),
            FOREIGN KEY (memory_id) REFERENCES memories(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_embeddings_memory ON embeddings(memory_id);

        CREATE TABLE IF NOT EXISTS unknown_type_stats (
            type_name TEXT PRIMARY KEY,
            count INTEGER NOT NULL DEFAULT 0,
            last_seen TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings_overlay (
            connection_id TEXT PRIMARY KEY,
            custom_entity_types TEXT NOT NULL DEFAULT '[]',
            custom_relationship_types TEXT NOT NULL DEFAULT '[]',
            custom_memory_types TEXT NOT NULL DEFAULT '[]',
            custom_classification_schemas TEXT NOT NULL DEFAULT '[]',
            active_classification_category TEXT
        );
        "#,
    )?;

    conn.execute(
        "INSERT INTO schema_version (version) VALUES (1)",
        [],
    )?;

    Ok(())
}

/// Run all pending Postgres migrations against a fresh pool.
#[cfg(feature = "postgres")]
pub async fn run_postgres_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            source TEXT,
            tags JSONB NOT NULL DEFAULT '[]',
            metadata JSONB NOT NULL DEFAULT '{}',
            timestamp TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            created_by TEXT,
            importance REAL NOT NULL DEFAULT 0.5,
            access_count BIGINT NOT NULL DEFAULT 0,
            decay_score REAL NOT NULL DEFAULT 1.0,
            status TEXT NOT NULL DEFAULT 'pending',
            entity_status TEXT NOT NULL DEFAULT 'pending',
            relationship_status TEXT NOT NULL DEFAULT 'pending',
            embedding_status TEXT NOT NULL DEFAULT 'pending',
            enrichment_attempts BIGINT NOT NULL DEFAULT 0,
            enrichment_error TEXT,
            enriched_at TIMESTAMPTZ,
            deleted_at TIMESTAMPTZ,
            content_tsv TSVECTOR GENERATED ALWAYS AS (to_tsvector('english', content)) STORED
        );
        CREATE INDEX IF NOT EXISTS idx_memories_status ON memories(status);
        CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at);
        CREATE INDEX IF NOT EXISTS idx_memories_content_tsv ON memories USING GIN(content_tsv);

        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            description TEXT,
            created_at TIMESTAMPTZ NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memory_entities (
            memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
            entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
            PRIMARY KEY (memory_id, entity_id)
        );
        CREATE INDEX IF NOT EXISTS idx_memory_entities_memory ON memory_entities(memory_id);
        CREATE INDEX IF NOT EXISTS idx_memory_entities_entity ON memory_entities(entity_id);

        CREATE TABLE IF NOT EXISTS relationships (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
            target_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
            relationship_type TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 1.0,
            bidirectional BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_id);
        CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_id);

        CREATE TABLE IF NOT EXISTS embeddings (
            memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
            model_name TEXT NOT NULL,
            vector BYTEA NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (memory_id, model_name)
        );

        CREATE TABLE IF NOT EXISTS unknown_type_stats (
            type_name TEXT PRIMARY KEY,
            count BIGINT NOT NULL DEFAULT 0,
            last_seen TIMESTAMPTZ NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings_overlay (
            connection_id TEXT PRIMARY KEY,
            custom_entity_types JSONB NOT NULL DEFAULT '[]',
            custom_relationship_types JSONB NOT NULL DEFAULT '[]',
            custom_memory_types JSONB NOT NULL DEFAULT '[]',
            custom_classification_schemas JSONB NOT NULL DEFAULT '[]',
            active_classification_category TEXT
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn migration_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_sqlite_migrations(&conn).unwrap();
        run_sqlite_migrations(&conn).unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SQLITE_SCHEMA_VERSION);
    }

    #[test]
    fn creates_expected_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_sqlite_migrations(&conn).unwrap();
        for table in [
            "memories",
            "entities",
            "memory_entities",
            "relationships",
            "embeddings",
            "unknown_type_stats",
            "settings",
            "settings_overlay",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
