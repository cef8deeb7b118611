//! Routing configuration rows and scene persistence
//!
//! At most one routing config is active at a time; saving a config activates
//! it and deactivates the rest. Smart-routing configs own a set of scene
//! rows; a scene named "default" is inserted at priority 0 on save if the
//! caller did not provide one.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{now_rfc3339, Store};

/// Name of the scene selected when classification fails or is ambiguous
pub const DEFAULT_SCENE_NAME: &str = "default";

/// A routing configuration row. `config_data` is mode-specific JSON:
/// `model_priority_list` for global_direct, `routing_models` for
/// smart_routing, `target_url`/`timeout_sec` for claude_code.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingConfigRow {
    pub id: i64,
    pub config_name: String,
    pub config_type: String,
    pub is_active: bool,
    pub config_data: String,
}

/// A persisted scene row
#[derive(Debug, Clone, Serialize)]
pub struct SceneRow {
    pub id: i64,
    pub routing_config_id: i64,
    pub scene_name: String,
    pub scene_description: String,
    pub models: Vec<String>,
    pub priority: i64,
    pub enabled: bool,
}

/// Scene payload accepted by the save endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Store {
    /// The single active routing config, if any
    pub fn active_routing_config(&self) -> Result<Option<RoutingConfigRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, config_name, config_type, is_active, config_data
                 FROM routing_configs WHERE is_active = 1 LIMIT 1",
                [],
                row_to_config,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_routing_configs(&self) -> Result<Vec<RoutingConfigRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, config_name, config_type, is_active, config_data
             FROM routing_configs ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], row_to_config)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Enabled scenes of a config, ordered by priority
    pub fn scenes_for_config(&self, routing_config_id: i64) -> Result<Vec<SceneRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, routing_config_id, scene_name, scene_description, models, priority, enabled
             FROM routing_scenes WHERE routing_config_id = ?1 AND enabled = 1
             ORDER BY priority",
        )?;
        let rows = stmt
            .query_map(params![routing_config_id], |row| {
                let models_json: String = row.get(4)?;
                Ok(SceneRow {
                    id: row.get(0)?,
                    routing_config_id: row.get(1)?,
                    scene_name: row.get(2)?,
                    scene_description: row.get(3)?,
                    models: serde_json::from_str(&models_json).unwrap_or_default(),
                    priority: row.get(5)?,
                    enabled: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Save a routing config, activate it, and deactivate all others.
    ///
    /// For smart_routing configs the given scenes replace any existing ones;
    /// a "default" scene is prepended when missing so classification always
    /// has a fallback target.
    pub fn save_routing_config(
        &self,
        config_name: &str,
        config_type: &str,
        config_data: &serde_json::Value,
        scenes: Option<Vec<SceneInput>>,
    ) -> Result<i64> {
        let data_json =
            serde_json::to_string(config_data).context("Failed to serialize routing config")?;
        let now = now_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM routing_configs WHERE config_name = ?1",
                params![config_name],
                |row| row.get(0),
            )
            .optional()?;

        let config_id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE routing_configs
                     SET config_type = ?2, config_data = ?3, is_active = 1, updated_at = ?4
                     WHERE id = ?1",
                    params![id, config_type, data_json, now],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO routing_configs (config_name, config_type, is_active, config_data, created_at, updated_at)
                     VALUES (?1, ?2, 1, ?3, ?4, ?4)",
                    params![config_name, config_type, data_json, now],
                )?;
                tx.last_insert_rowid()
            }
        };

        tx.execute(
            "UPDATE routing_configs SET is_active = 0 WHERE id != ?1",
            params![config_id],
        )?;

        if config_type == "smart_routing" {
            let mut scenes = scenes.unwrap_or_default();
            if !scenes.iter().any(|s| s.name == DEFAULT_SCENE_NAME) {
                scenes.insert(
                    0,
                    SceneInput {
                        name: DEFAULT_SCENE_NAME.to_string(),
                        description: "Fallback conversation scene used when no specific scene matches"
                            .to_string(),
                        models: vec!["dashscope:qwen-plus".to_string()],
                        priority: 0,
                        enabled: true,
                    },
                );
                for (i, scene) in scenes.iter_mut().enumerate().skip(1) {
                    scene.priority = i as i64;
                }
            }

            tx.execute(
                "DELETE FROM routing_scenes WHERE routing_config_id = ?1",
                params![config_id],
            )?;
            for scene in &scenes {
                let models_json = serde_json::to_string(&scene.models)
                    .context("Failed to serialize scene models")?;
                tx.execute(
                    "INSERT INTO routing_scenes (routing_config_id, scene_name, scene_description, models, priority, enabled, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        config_id,
                        scene.name,
                        scene.description,
                        models_json,
                        scene.priority,
                        scene.enabled,
                        now
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(config_id)
    }
}

fn row_to_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoutingConfigRow> {
    Ok(RoutingConfigRow {
        id: row.get(0)?,
        config_name: row.get(1)?,
        config_type: row.get(2)?,
        is_active: row.get(3)?,
        config_data: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_save_activates_and_deactivates_others() {
        let store = Store::open_in_memory().unwrap();
        let first = store
            .save_routing_config(
                "direct",
                "global_direct",
                &json!({"model_priority_list": ["openrouter:openai/gpt-4o-mini"]}),
                None,
            )
            .unwrap();
        let second = store
            .save_routing_config("legacy", "claude_code", &json!({}), None)
            .unwrap();

        let active = store.active_routing_config().unwrap().unwrap();
        assert_eq!(active.id, second);
        assert_ne!(active.id, first);
        assert_eq!(active.config_type, "claude_code");
    }

    #[test]
    fn test_default_scene_inserted_at_priority_zero() {
        let store = Store::open_in_memory().unwrap();
        let scenes = vec![
            SceneInput {
                name: "coding".to_string(),
                description: "programming questions".to_string(),
                models: vec!["dashscope:qwen-coder".to_string()],
                priority: 0,
                enabled: true,
            },
            SceneInput {
                name: "translation".to_string(),
                description: "translate between languages".to_string(),
                models: vec!["dashscope:qwen-turbo".to_string()],
                priority: 1,
                enabled: true,
            },
        ];
        let config_id = store
            .save_routing_config(
                "smart",
                "smart_routing",
                &json!({"routing_models": ["dashscope:qwen-turbo"]}),
                Some(scenes),
            )
            .unwrap();

        let scenes = store.scenes_for_config(config_id).unwrap();
        assert_eq!(scenes.len(), 3);
        assert_eq!(scenes[0].scene_name, DEFAULT_SCENE_NAME);
        assert_eq!(scenes[0].priority, 0);
        assert_eq!(scenes[1].scene_name, "coding");
        assert_eq!(scenes[2].scene_name, "translation");
    }

    #[test]
    fn test_provided_default_scene_not_duplicated() {
        let store = Store::open_in_memory().unwrap();
        let scenes = vec![SceneInput {
            name: DEFAULT_SCENE_NAME.to_string(),
            description: "fallback".to_string(),
            models: vec!["ollama:llama3".to_string()],
            priority: 0,
            enabled: true,
        }];
        let config_id = store
            .save_routing_config("smart", "smart_routing", &json!({}), Some(scenes))
            .unwrap();

        let scenes = store.scenes_for_config(config_id).unwrap();
        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].models, vec!["ollama:llama3".to_string()]);
    }

    #[test]
    fn test_disabled_scenes_filtered_from_lookup() {
        let store = Store::open_in_memory().unwrap();
        let scenes = vec![
            SceneInput {
                name: DEFAULT_SCENE_NAME.to_string(),
                description: "fallback".to_string(),
                models: vec!["dashscope:qwen-plus".to_string()],
                priority: 0,
                enabled: true,
            },
            SceneInput {
                name: "disabled".to_string(),
                description: "should not appear".to_string(),
                models: vec![],
                priority: 1,
                enabled: false,
            },
        ];
        let config_id = store
            .save_routing_config("smart", "smart_routing", &json!({}), Some(scenes))
            .unwrap();

        let scenes = store.scenes_for_config(config_id).unwrap();
        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].scene_name, DEFAULT_SCENE_NAME);
    }
}
