//! SQLite persistence for gateway configuration and interaction records
//!
//! A single embedded database holds seven tables: platforms, models,
//! routing_configs, routing_scenes, user_keys, key_usage_logs and
//! interaction_records. Connections come from an r2d2 pool with WAL mode
//! enabled per connection; async callers wrap store calls in
//! `tokio::task::spawn_blocking`.
//!
//! Writes that must be atomic (usage-log append + used_tokens increment,
//! key reset + usage purge) run inside a single rusqlite transaction.

mod keys;
mod records;
mod routing;

pub use keys::{KeyAdmission, UserKey};
pub use records::{NewRecord, RecordDetail, RecordSummary};
pub use routing::{RoutingConfigRow, SceneInput, SceneRow};

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde::Serialize;
use std::path::Path;

/// Pooled connection type used by the submodules
pub(crate) type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// Handle to the gateway database. Cheap to clone (shares the pool).
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

/// A configured upstream platform
#[derive(Debug, Clone, Serialize)]
pub struct PlatformRow {
    pub id: i64,
    pub platform_type: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub enabled: bool,
    pub timeout_sec: u64,
}

/// A model known to the gateway, unique by (platform_type, model_id)
#[derive(Debug, Clone, Serialize)]
pub struct ModelRow {
    pub id: i64,
    pub platform_type: String,
    pub model_id: String,
    pub model_name: String,
    pub enabled: bool,
    pub priority: i64,
    pub description: String,
}

impl ModelRow {
    /// Canonical external identifier: `<platform_type>:<model_id>`
    pub fn spec(&self) -> String {
        format!("{}:{}", self.platform_type, self.model_id)
    }
}

impl Store {
    /// Open (or create) the database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
        });
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .context("Failed to create connection pool")?;

        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (tests). Pool size is pinned to one
    /// connection so every caller sees the same database.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .context("Failed to create in-memory pool")?;

        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> Result<PooledConn> {
        self.pool.get().context("Failed to get database connection")
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS platforms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                platform_type TEXT NOT NULL UNIQUE,
                api_key TEXT,
                base_url TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                timeout_sec INTEGER NOT NULL DEFAULT 30,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS models (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                platform_type TEXT NOT NULL,
                model_id TEXT NOT NULL,
                model_name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 0,
                description TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (platform_type, model_id)
            );

            CREATE TABLE IF NOT EXISTS routing_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                config_name TEXT NOT NULL UNIQUE,
                config_type TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                config_data TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS routing_scenes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                routing_config_id INTEGER NOT NULL,
                scene_name TEXT NOT NULL,
                scene_description TEXT NOT NULL DEFAULT '',
                models TEXT NOT NULL DEFAULT '[]',
                priority INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scenes_config
                ON routing_scenes (routing_config_id, priority);

            CREATE TABLE IF NOT EXISTS user_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                api_key TEXT NOT NULL UNIQUE,
                max_tokens INTEGER NOT NULL DEFAULT 0,
                used_tokens INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS key_usage_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_key_id INTEGER NOT NULL,
                record_id INTEGER NOT NULL,
                model_name TEXT NOT NULL,
                platform_type TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_key ON key_usage_logs (user_key_id);

            CREATE TABLE IF NOT EXISTS interaction_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                headers TEXT,
                body TEXT,
                response_status INTEGER NOT NULL,
                response_headers TEXT,
                response_body TEXT,
                timestamp TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                target_platform TEXT,
                target_model TEXT,
                platform_base_url TEXT,
                processed_prompt TEXT,
                processed_headers TEXT,
                model_raw_headers TEXT,
                model_raw_response TEXT,
                routing_scene TEXT,
                user_key_id INTEGER,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_records_time ON interaction_records (timestamp);
            "#,
        )
        .context("Failed to initialize schema")?;
        Ok(())
    }

    // ─── Platforms ───────────────────────────────────────────────────────────

    /// All platform rows, enabled or not
    pub fn list_platforms(&self) -> Result<Vec<PlatformRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, platform_type, api_key, base_url, enabled, timeout_sec
             FROM platforms ORDER BY platform_type",
        )?;
        let rows = stmt
            .query_map([], row_to_platform)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Enabled platform rows only (the set the registry is built from)
    pub fn enabled_platforms(&self) -> Result<Vec<PlatformRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, platform_type, api_key, base_url, enabled, timeout_sec
             FROM platforms WHERE enabled = 1 ORDER BY platform_type",
        )?;
        let rows = stmt
            .query_map([], row_to_platform)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Create or update a platform config, unique by platform_type
    pub fn upsert_platform(
        &self,
        platform_type: &str,
        api_key: Option<&str>,
        base_url: Option<&str>,
        enabled: bool,
        timeout_sec: u64,
    ) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO platforms (platform_type, api_key, base_url, enabled, timeout_sec, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT (platform_type) DO UPDATE SET
                 api_key = COALESCE(excluded.api_key, platforms.api_key),
                 base_url = COALESCE(excluded.base_url, platforms.base_url),
                 enabled = excluded.enabled,
                 timeout_sec = excluded.timeout_sec,
                 updated_at = excluded.updated_at",
            params![platform_type, api_key, base_url, enabled, timeout_sec as i64, now],
        )?;
        Ok(())
    }

    // ─── Models ──────────────────────────────────────────────────────────────

    /// Enabled models ordered by priority (lower value wins)
    pub fn enabled_models(&self) -> Result<Vec<ModelRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, platform_type, model_id, model_name, enabled, priority, description
             FROM models WHERE enabled = 1 ORDER BY priority, platform_type, model_id",
        )?;
        let rows = stmt
            .query_map([], row_to_model)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Insert new models and refresh names/descriptions of known ones
    ///
    /// Returns (inserted, updated) counts.
    pub fn save_models(
        &self,
        models: &[(String, String, String, String)], // (platform_type, model_id, model_name, description)
    ) -> Result<(usize, usize)> {
        let now = now_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        let mut updated = 0;
        for (platform_type, model_id, model_name, description) in models {
            let changed = tx.execute(
                "UPDATE models SET model_name = ?3, description = ?4, updated_at = ?5
                 WHERE platform_type = ?1 AND model_id = ?2",
                params![platform_type, model_id, model_name, description, now],
            )?;
            if changed > 0 {
                updated += 1;
            } else {
                tx.execute(
                    "INSERT INTO models (platform_type, model_id, model_name, enabled, priority, description, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 1, 0, ?4, ?5, ?5)",
                    params![platform_type, model_id, model_name, description, now],
                )?;
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok((inserted, updated))
    }
}

fn row_to_platform(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlatformRow> {
    Ok(PlatformRow {
        id: row.get(0)?,
        platform_type: row.get(1)?,
        api_key: row.get(2)?,
        base_url: row.get(3)?,
        enabled: row.get(4)?,
        timeout_sec: row.get::<_, i64>(5)? as u64,
    })
}

fn row_to_model(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelRow> {
    Ok(ModelRow {
        id: row.get(0)?,
        platform_type: row.get(1)?,
        model_id: row.get(2)?,
        model_name: row.get(3)?,
        enabled: row.get(4)?,
        priority: row.get(5)?,
        description: row.get(6)?,
    })
}

/// Current time as RFC 3339 text (the column format for all timestamps)
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_upsert_is_unique_by_type() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_platform("ollama", None, Some("http://localhost:11434"), true, 30)
            .unwrap();
        store
            .upsert_platform("ollama", None, Some("http://other:11434"), false, 60)
            .unwrap();

        let platforms = store.list_platforms().unwrap();
        assert_eq!(platforms.len(), 1);
        assert_eq!(platforms[0].base_url.as_deref(), Some("http://other:11434"));
        assert!(!platforms[0].enabled);
        assert_eq!(platforms[0].timeout_sec, 60);
    }

    #[test]
    fn test_upsert_keeps_api_key_when_omitted() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_platform("openrouter", Some("sk-or-123"), None, true, 30)
            .unwrap();
        store.upsert_platform("openrouter", None, None, true, 30).unwrap();

        let platforms = store.list_platforms().unwrap();
        assert_eq!(platforms[0].api_key.as_deref(), Some("sk-or-123"));
    }

    #[test]
    fn test_save_models_inserts_then_updates() {
        let store = Store::open_in_memory().unwrap();
        let batch = vec![(
            "dashscope".to_string(),
            "qwen-plus".to_string(),
            "qwen-plus".to_string(),
            "".to_string(),
        )];
        let (inserted, updated) = store.save_models(&batch).unwrap();
        assert_eq!((inserted, updated), (1, 0));

        let batch = vec![(
            "dashscope".to_string(),
            "qwen-plus".to_string(),
            "Qwen Plus".to_string(),
            "renamed".to_string(),
        )];
        let (inserted, updated) = store.save_models(&batch).unwrap();
        assert_eq!((inserted, updated), (0, 1));

        let models = store.enabled_models().unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].model_name, "Qwen Plus");
        assert_eq!(models[0].spec(), "dashscope:qwen-plus");
    }
}
