//! Interaction records: both sides of every hooked call
//!
//! A record captures the original client request, the upstream-bound
//! ("processed") payload and headers, the raw upstream response, the
//! converted client-facing body, routing outcome and token usage. Records
//! are append-only and bulk-truncatable.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{now_rfc3339, Store};
use crate::util::truncate_utf8_safe;

/// Maximum stored size for any single large text column. Oversized bodies
/// are truncated at a UTF-8 boundary rather than rejected.
const MAX_FIELD_BYTES: usize = 1_000_000;

/// Data for a new interaction record
#[derive(Debug, Default, Clone)]
pub struct NewRecord {
    pub method: String,
    pub path: String,
    pub headers: Option<String>,
    pub body: Option<String>,
    pub response_status: u16,
    pub response_headers: Option<String>,
    pub response_body: Option<String>,
    pub duration_ms: i64,
    pub target_platform: Option<String>,
    pub target_model: Option<String>,
    pub platform_base_url: Option<String>,
    pub processed_prompt: Option<String>,
    pub processed_headers: Option<String>,
    pub model_raw_headers: Option<String>,
    pub model_raw_response: Option<String>,
    pub routing_scene: Option<String>,
    pub user_key_id: Option<i64>,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Listing row returned by the records control endpoint
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub id: i64,
    pub method: String,
    pub path: String,
    pub timestamp: String,
    pub response_status: u16,
    pub duration_ms: i64,
    pub target_platform: Option<String>,
    pub target_model: Option<String>,
    pub user_key_id: Option<i64>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

/// Full record detail
#[derive(Debug, Clone, Serialize)]
pub struct RecordDetail {
    #[serde(flatten)]
    pub summary: RecordSummary,
    pub headers: Option<String>,
    pub body: Option<String>,
    pub response_headers: Option<String>,
    pub response_body: Option<String>,
    pub platform_base_url: Option<String>,
    pub processed_prompt: Option<String>,
    pub processed_headers: Option<String>,
    pub model_raw_headers: Option<String>,
    pub model_raw_response: Option<String>,
    pub routing_scene: Option<String>,
}

fn capped(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(|s| truncate_utf8_safe(s, MAX_FIELD_BYTES))
}

impl Store {
    /// Append one interaction record, returning its id
    pub fn insert_record(&self, record: &NewRecord) -> Result<i64> {
        let now = now_rfc3339();
        let total_tokens = record.input_tokens + record.output_tokens;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO interaction_records
                 (method, path, headers, body, response_status, response_headers, response_body,
                  timestamp, duration_ms, target_platform, target_model, platform_base_url,
                  processed_prompt, processed_headers, model_raw_headers, model_raw_response,
                  routing_scene, user_key_id, input_tokens, output_tokens, total_tokens)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            params![
                record.method,
                record.path,
                capped(&record.headers),
                capped(&record.body),
                record.response_status,
                capped(&record.response_headers),
                capped(&record.response_body),
                now,
                record.duration_ms,
                record.target_platform,
                record.target_model,
                record.platform_base_url,
                capped(&record.processed_prompt),
                capped(&record.processed_headers),
                capped(&record.model_raw_headers),
                capped(&record.model_raw_response),
                record.routing_scene,
                record.user_key_id,
                record.input_tokens,
                record.output_tokens,
                total_tokens,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Latest records first
    pub fn list_records(&self, limit: u32) -> Result<Vec<RecordSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, method, path, timestamp, response_status, duration_ms,
                    target_platform, target_model, user_key_id,
                    input_tokens, output_tokens, total_tokens
             FROM interaction_records ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], row_to_summary)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn record_detail(&self, id: i64) -> Result<Option<RecordDetail>> {
        let conn = self.conn()?;
        let detail = conn
            .query_row(
                "SELECT id, method, path, timestamp, response_status, duration_ms,
                        target_platform, target_model, user_key_id,
                        input_tokens, output_tokens, total_tokens,
                        headers, body, response_headers, response_body, platform_base_url,
                        processed_prompt, processed_headers, model_raw_headers,
                        model_raw_response, routing_scene
                 FROM interaction_records WHERE id = ?1",
                params![id],
                |row| {
                    Ok(RecordDetail {
                        summary: row_to_summary(row)?,
                        headers: row.get(12)?,
                        body: row.get(13)?,
                        response_headers: row.get(14)?,
                        response_body: row.get(15)?,
                        platform_base_url: row.get(16)?,
                        processed_prompt: row.get(17)?,
                        processed_headers: row.get(18)?,
                        model_raw_headers: row.get(19)?,
                        model_raw_response: row.get(20)?,
                        routing_scene: row.get(21)?,
                    })
                },
            )
            .optional()?;
        Ok(detail)
    }

    /// Bulk-truncate all records
    pub fn clear_records(&self) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM interaction_records", [])?;
        Ok(deleted)
    }
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordSummary> {
    Ok(RecordSummary {
        id: row.get(0)?,
        method: row.get(1)?,
        path: row.get(2)?,
        timestamp: row.get(3)?,
        response_status: row.get::<_, i64>(4)? as u16,
        duration_ms: row.get(5)?,
        target_platform: row.get(6)?,
        target_model: row.get(7)?,
        user_key_id: row.get(8)?,
        input_tokens: row.get(9)?,
        output_tokens: row.get(10)?,
        total_tokens: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> NewRecord {
        NewRecord {
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            headers: Some("{}".to_string()),
            body: Some(r#"{"model":"claude-x"}"#.to_string()),
            response_status: 200,
            response_body: Some("event:message_stop".to_string()),
            duration_ms: 42,
            target_platform: Some("openrouter".to_string()),
            target_model: Some("openai/gpt-4o-mini".to_string()),
            input_tokens: 5,
            output_tokens: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_and_detail_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_record(&sample_record()).unwrap();

        let detail = store.record_detail(id).unwrap().unwrap();
        assert_eq!(detail.summary.response_status, 200);
        assert_eq!(detail.summary.total_tokens, 7);
        assert_eq!(detail.summary.target_model.as_deref(), Some("openai/gpt-4o-mini"));
        assert_eq!(detail.body.as_deref(), Some(r#"{"model":"claude-x"}"#));
    }

    #[test]
    fn test_listing_is_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let first = store.insert_record(&sample_record()).unwrap();
        let second = store.insert_record(&sample_record()).unwrap();

        let records = store.list_records(10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, second);
        assert_eq!(records[1].id, first);
    }

    #[test]
    fn test_clear_records() {
        let store = Store::open_in_memory().unwrap();
        store.insert_record(&sample_record()).unwrap();
        store.insert_record(&sample_record()).unwrap();

        assert_eq!(store.clear_records().unwrap(), 2);
        assert!(store.list_records(10).unwrap().is_empty());
    }

    #[test]
    fn test_oversized_body_is_truncated_not_rejected() {
        let store = Store::open_in_memory().unwrap();
        let mut record = sample_record();
        record.response_body = Some("x".repeat(MAX_FIELD_BYTES + 100));
        let id = store.insert_record(&record).unwrap();

        let detail = store.record_detail(id).unwrap().unwrap();
        assert_eq!(detail.response_body.unwrap().len(), MAX_FIELD_BYTES);
    }
}
