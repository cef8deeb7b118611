//! Control API consumed by the operator UI
//!
//! JSON endpoints under `/_api/` (plus `/control/clear-records` and
//! `/about`) for managing platforms, models, routing configs, user keys and
//! interaction records. Login/session enforcement is the external UI
//! layer's job, not the core's. Every mutation that affects dispatch
//! rebuilds the registry and routing snapshots atomically via
//! `GatewayState::reload`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::VERSION;
use crate::gateway::GatewayState;
use crate::providers::PlatformType;
use crate::store::{SceneInput, Store};

type ControlResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    tracing::error!("Control API error: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.into()})),
    )
}

fn not_found(message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({"error": message.into()})))
}

/// Run a blocking store closure on the blocking pool
async fn with_store<T, F>(store: &Store, f: F) -> Result<T, (StatusCode, Json<Value>)>
where
    T: Send + 'static,
    F: FnOnce(Store) -> anyhow::Result<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store))
        .await
        .map_err(internal_error)?
        .map_err(internal_error)
}

pub fn routes() -> Router<GatewayState> {
    Router::new()
        .route("/about", get(about))
        .route("/_api/platforms", get(list_platforms).post(save_platform))
        .route("/_api/platforms/test", post(test_platforms))
        .route("/_api/models", get(list_models))
        .route("/_api/models/refresh", post(refresh_models))
        .route("/_api/routing", get(get_routing).post(save_routing))
        .route("/_api/keys", get(list_keys).post(create_key))
        .route("/_api/keys/:id", delete(delete_key).patch(update_key))
        .route("/_api/keys/:id/reset", post(reset_key))
        .route("/_api/records", get(list_records))
        .route("/_api/records/:id", get(record_detail))
        .route("/control/clear-records", post(clear_records))
        .route("/_api/reinitialize", post(reinitialize))
}

async fn about(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "name": "switchboard",
        "version": VERSION,
        "work_mode": state.current_mode().as_str(),
        "loaded_platforms": state.providers().len(),
        "broadcast_subscribers": state.broadcaster.subscriber_count(),
    }))
}

// ─── Platforms ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PlatformPayload {
    platform_type: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default = "default_timeout")]
    timeout_sec: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

async fn list_platforms(State(state): State<GatewayState>) -> ControlResult {
    let platforms = with_store(&state.store, |store| store.list_platforms()).await?;
    Ok(Json(json!(platforms)))
}

async fn save_platform(
    State(state): State<GatewayState>,
    Json(payload): Json<PlatformPayload>,
) -> ControlResult {
    if PlatformType::parse(&payload.platform_type).is_none() {
        return Err(bad_request(format!(
            "Unknown platform type: {}",
            payload.platform_type
        )));
    }

    with_store(&state.store, move |store| {
        store.upsert_platform(
            &payload.platform_type,
            payload.api_key.as_deref().filter(|k| !k.is_empty()),
            payload.base_url.as_deref().filter(|u| !u.is_empty()),
            payload.enabled,
            payload.timeout_sec,
        )
    })
    .await?;

    state.reload().await.map_err(internal_error)?;
    Ok(Json(json!({"message": "Platform configuration saved"})))
}

async fn test_platforms(State(state): State<GatewayState>) -> ControlResult {
    let results = state.providers().test_all().await;
    Ok(Json(json!(results)))
}

// ─── Models ──────────────────────────────────────────────────────────────────

async fn list_models(State(state): State<GatewayState>) -> ControlResult {
    let mut models = with_store(&state.store, |store| store.enabled_models()).await?;

    // First run: nothing cached yet, pull the lists from the platforms
    if models.is_empty() && !state.providers().is_empty() {
        refresh_all_models(&state).await?;
        models = with_store(&state.store, |store| store.enabled_models()).await?;
    }

    let listed: Vec<Value> = models
        .iter()
        .map(|model| {
            json!({
                "id": model.spec(),
                "name": model.model_name,
                "platform": model.platform_type,
                "description": model.description,
                "enabled": model.enabled,
            })
        })
        .collect();
    Ok(Json(json!(listed)))
}

#[derive(Debug, Default, Deserialize)]
struct RefreshPayload {
    #[serde(default)]
    platform_type: Option<String>,
}

async fn refresh_models(
    State(state): State<GatewayState>,
    payload: Option<Json<RefreshPayload>>,
) -> ControlResult {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();

    match payload.platform_type.as_deref() {
        None => refresh_all_models(&state).await?,
        Some(platform_str) => {
            let Some(platform) = PlatformType::parse(platform_str) else {
                return Err(bad_request(format!("Unknown platform type: {}", platform_str)));
            };
            let Some(client) = state.providers().get(platform) else {
                return Err(bad_request(format!("Platform {} is not loaded", platform_str)));
            };
            let models = client.list_models().await.map_err(internal_error)?;
            save_model_batch(&state, models).await?;
        }
    }

    Ok(Json(json!({"message": "Model list refreshed"})))
}

async fn refresh_all_models(state: &GatewayState) -> Result<(), (StatusCode, Json<Value>)> {
    let models = state.providers().all_models().await;
    save_model_batch(state, models).await
}

async fn save_model_batch(
    state: &GatewayState,
    models: Vec<crate::providers::ModelInfo>,
) -> Result<(), (StatusCode, Json<Value>)> {
    if models.is_empty() {
        return Ok(());
    }
    let batch: Vec<(String, String, String, String)> = models
        .into_iter()
        .map(|model| {
            (
                model.platform.as_str().to_string(),
                model.id,
                model.name,
                model.description,
            )
        })
        .collect();
    let (inserted, updated) =
        with_store(&state.store, move |store| store.save_models(&batch)).await?;
    tracing::info!("Model refresh: {} inserted, {} updated", inserted, updated);
    Ok(())
}

// ─── Routing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RoutingPayload {
    config_name: String,
    config_type: String,
    #[serde(default)]
    config_data: Value,
    #[serde(default)]
    scenes: Option<Vec<SceneInput>>,
}

async fn get_routing(State(state): State<GatewayState>) -> ControlResult {
    let (configs, scenes_by_config) = with_store(&state.store, |store| {
        let configs = store.list_routing_configs()?;
        let mut scenes = Vec::new();
        for config in &configs {
            if config.config_type == "smart_routing" {
                scenes.push((config.id, store.scenes_for_config(config.id)?));
            }
        }
        Ok((configs, scenes))
    })
    .await?;

    let configs_json: Vec<Value> = configs
        .iter()
        .map(|config| {
            let mut entry = json!({
                "id": config.id,
                "name": config.config_name,
                "type": config.config_type,
                "is_active": config.is_active,
                "data": serde_json::from_str::<Value>(&config.config_data).unwrap_or(json!({})),
            });
            if let Some((_, scenes)) = scenes_by_config.iter().find(|(id, _)| *id == config.id) {
                entry["scenes"] = json!(scenes);
            }
            entry
        })
        .collect();

    Ok(Json(json!({
        "current_mode": state.current_mode().as_str(),
        "configs": configs_json,
    })))
}

async fn save_routing(
    State(state): State<GatewayState>,
    Json(payload): Json<RoutingPayload>,
) -> ControlResult {
    if !matches!(
        payload.config_type.as_str(),
        "global_direct" | "smart_routing" | "claude_code"
    ) {
        return Err(bad_request(format!(
            "Unknown routing config type: {}",
            payload.config_type
        )));
    }

    with_store(&state.store, move |store| {
        store.save_routing_config(
            &payload.config_name,
            &payload.config_type,
            &payload.config_data,
            payload.scenes,
        )
    })
    .await?;

    state.reload().await.map_err(internal_error)?;
    Ok(Json(json!({"message": "Routing configuration saved"})))
}

// ─── User Keys ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct KeyPayload {
    name: String,
    #[serde(default)]
    max_tokens: i64,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct KeyUpdatePayload {
    is_active: bool,
}

async fn list_keys(State(state): State<GatewayState>) -> ControlResult {
    let keys = with_store(&state.store, |store| store.list_keys()).await?;
    Ok(Json(json!(keys)))
}

async fn create_key(
    State(state): State<GatewayState>,
    Json(payload): Json<KeyPayload>,
) -> ControlResult {
    if payload.name.trim().is_empty() {
        return Err(bad_request("Key name must not be empty"));
    }
    if payload.max_tokens < 0 {
        return Err(bad_request("max_tokens must be zero or positive"));
    }

    let key = with_store(&state.store, move |store| {
        store.create_key(payload.name.trim(), payload.max_tokens, payload.expires_at)
    })
    .await?;

    // The generated secret is shown exactly once, here
    Ok(Json(json!(key)))
}

async fn update_key(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
    Json(payload): Json<KeyUpdatePayload>,
) -> ControlResult {
    with_store(&state.store, move |store| {
        store.set_key_active(id, payload.is_active)
    })
    .await?;
    Ok(Json(json!({"message": "Key updated"})))
}

async fn reset_key(State(state): State<GatewayState>, Path(id): Path<i64>) -> ControlResult {
    with_store(&state.store, move |store| store.reset_key(id)).await?;
    Ok(Json(json!({"message": "Key usage reset"})))
}

async fn delete_key(State(state): State<GatewayState>, Path(id): Path<i64>) -> ControlResult {
    with_store(&state.store, move |store| store.delete_key(id)).await?;
    Ok(Json(json!({"message": "Key deleted"})))
}

// ─── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RecordsQuery {
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    100
}

async fn list_records(
    State(state): State<GatewayState>,
    Query(query): Query<RecordsQuery>,
) -> ControlResult {
    let limit = query.limit.min(1000);
    let records = with_store(&state.store, move |store| store.list_records(limit)).await?;
    Ok(Json(json!(records)))
}

async fn record_detail(State(state): State<GatewayState>, Path(id): Path<i64>) -> ControlResult {
    let detail = with_store(&state.store, move |store| store.record_detail(id)).await?;
    match detail {
        Some(detail) => Ok(Json(json!(detail))),
        None => Err(not_found("Record not found")),
    }
}

async fn clear_records(State(state): State<GatewayState>) -> ControlResult {
    let deleted = with_store(&state.store, |store| store.clear_records()).await?;
    Ok(Json(json!({"message": "Records cleared", "deleted": deleted})))
}

// ─── Reinitialization ────────────────────────────────────────────────────────

async fn reinitialize(State(state): State<GatewayState>) -> ControlResult {
    state.reload().await.map_err(internal_error)?;
    Ok(Json(json!({
        "message": "Provider registry and routing reloaded",
        "work_mode": state.current_mode().as_str(),
        "loaded_platforms": state.providers().len(),
    })))
}
