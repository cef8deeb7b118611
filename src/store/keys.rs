//! User key management and token accounting
//!
//! A key admits a request iff it is active, unexpired, and under budget
//! (`max_tokens = 0` means unlimited). `used_tokens` only ever grows while
//! the key exists; the increment and the usage-log append happen in one
//! transaction so the sum over `key_usage_logs` always equals `used_tokens`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{now_rfc3339, Store};
use crate::util::generate_api_key;

/// A user-facing API key row
#[derive(Debug, Clone, Serialize)]
pub struct UserKey {
    pub id: i64,
    pub name: String,
    pub api_key: String,
    pub max_tokens: i64,
    pub used_tokens: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: String,
}

/// Outcome of an admission check
#[derive(Debug)]
pub enum KeyAdmission {
    Admitted(UserKey),
    /// Key exists but is not admissible; the reason is client-safe
    Denied(&'static str),
    NotFound,
}

impl UserKey {
    /// Why this key is not admissible right now, if it is not
    fn admission_failure(&self, now: DateTime<Utc>) -> Option<&'static str> {
        if !self.is_active {
            return Some("API key is disabled");
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at <= now {
                return Some("API key has expired");
            }
        }
        if self.max_tokens > 0 && self.used_tokens >= self.max_tokens {
            return Some("API key token budget exhausted");
        }
        None
    }
}

impl Store {
    /// Create a key with a freshly generated `lxs_` secret
    pub fn create_key(
        &self,
        name: &str,
        max_tokens: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<UserKey> {
        let api_key = generate_api_key();
        let now = now_rfc3339();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO user_keys (name, api_key, max_tokens, used_tokens, expires_at, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, 1, ?5, ?5)",
            params![name, api_key, max_tokens, expires_at.map(|t| t.to_rfc3339()), now],
        )?;
        let id = conn.last_insert_rowid();
        self.key_by_id(id)?
            .context("Key vanished after insert")
    }

    pub fn list_keys(&self) -> Result<Vec<UserKey>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, api_key, max_tokens, used_tokens, expires_at, is_active, created_at
             FROM user_keys ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], row_to_key)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn key_by_id(&self, id: i64) -> Result<Option<UserKey>> {
        let conn = self.conn()?;
        let key = conn
            .query_row(
                "SELECT id, name, api_key, max_tokens, used_tokens, expires_at, is_active, created_at
                 FROM user_keys WHERE id = ?1",
                params![id],
                row_to_key,
            )
            .optional()?;
        Ok(key)
    }

    /// Look up a presented key and evaluate admission
    ///
    /// The read is advisory: concurrent requests admitted against the same
    /// budget may still push `used_tokens` past `max_tokens`; the accounting
    /// invariant (sum of logs = used_tokens) is what is guaranteed.
    pub fn check_key(&self, api_key: &str) -> Result<KeyAdmission> {
        let conn = self.conn()?;
        let key = conn
            .query_row(
                "SELECT id, name, api_key, max_tokens, used_tokens, expires_at, is_active, created_at
                 FROM user_keys WHERE api_key = ?1",
                params![api_key],
                row_to_key,
            )
            .optional()?;

        Ok(match key {
            None => KeyAdmission::NotFound,
            Some(key) => match key.admission_failure(Utc::now()) {
                None => KeyAdmission::Admitted(key),
                Some(reason) => KeyAdmission::Denied(reason),
            },
        })
    }

    /// Append a usage-log row and increment `used_tokens` atomically
    pub fn record_usage(
        &self,
        user_key_id: i64,
        record_id: i64,
        model_name: &str,
        platform_type: &str,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<()> {
        let total_tokens = input_tokens + output_tokens;
        let now = now_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO key_usage_logs (user_key_id, record_id, model_name, platform_type, input_tokens, output_tokens, total_tokens, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![user_key_id, record_id, model_name, platform_type, input_tokens, output_tokens, total_tokens, now],
        )?;
        tx.execute(
            "UPDATE user_keys SET used_tokens = used_tokens + ?2, updated_at = ?3 WHERE id = ?1",
            params![user_key_id, total_tokens, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Zero a key's counter and purge its usage log, atomically
    pub fn reset_key(&self, id: i64) -> Result<()> {
        let now = now_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE user_keys SET used_tokens = 0, updated_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        tx.execute("DELETE FROM key_usage_logs WHERE user_key_id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_key_active(&self, id: i64, is_active: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE user_keys SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, is_active, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn delete_key(&self, id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM key_usage_logs WHERE user_key_id = ?1", params![id])?;
        tx.execute("DELETE FROM user_keys WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    /// Sum of logged totals for one key
    #[allow(dead_code)] // Consistency checks and tests
    pub fn usage_log_total(&self, user_key_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(total_tokens), 0) FROM key_usage_logs WHERE user_key_id = ?1",
            params![user_key_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}

fn row_to_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserKey> {
    let expires_at: Option<String> = row.get(5)?;
    Ok(UserKey {
        id: row.get(0)?,
        name: row.get(1)?,
        api_key: row.get(2)?,
        max_tokens: row.get(3)?,
        used_tokens: row.get(4)?,
        expires_at: expires_at
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(|t| t.with_timezone(&Utc)),
        is_active: row.get(6)?,
        created_at: row.get(7)?,
    })
}
