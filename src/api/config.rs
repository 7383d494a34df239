//! Runtime configuration management (admin only).

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};

use super::auth::AuthUser;
use super::routes::AppState;
use super::types::{
    internal_error, ConfigCreateRequest, ConfigEntryResponse, ConfigUpdateRequest,
    MessageResponse, ReloadResponse,
};
use crate::config_cache::{ConfigEntryInfo, ConfigValue, MASKED_VALUE};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_config).post(create_config))
        .route("/reload", post(reload_config))
        .route(
            "/:key",
            get(get_config).put(update_config).delete(delete_config),
        )
}

impl From<ConfigEntryInfo> for ConfigEntryResponse {
    fn from(info: ConfigEntryInfo) -> Self {
        Self {
            config_key: info.key,
            config_value: info.value.map(|v| v.to_json()),
            description: info.description,
            is_encrypted: info.is_encrypted,
            updated_at: Some(info.updated_at),
        }
    }
}

fn config_not_found() -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, "Configuration not found".to_string())
}

/// Response for a write, never echoing an encrypted value back.
fn written(key: &str, value: &ConfigValue, description: Option<String>, encrypted: bool) -> ConfigEntryResponse {
    let shown = if encrypted {
        ConfigValue::from(MASKED_VALUE)
    } else {
        value.clone()
    };
    ConfigEntryResponse {
        config_key: key.to_string(),
        config_value: Some(shown.to_json()),
        description,
        is_encrypted: encrypted,
        updated_at: None,
    }
}

async fn list_config(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<ConfigEntryResponse>>, (StatusCode, String)> {
    user.require_admin()?;
    let entries = state.config_cache.entries().await.map_err(internal_error)?;
    Ok(Json(entries.into_iter().map(Into::into).collect()))
}

async fn create_config(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ConfigCreateRequest>,
) -> Result<Json<ConfigEntryResponse>, (StatusCode, String)> {
    user.require_admin()?;
    let key = req.config_key.trim();
    if key.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "config_key must not be empty".to_string(),
        ));
    }
    if state
        .config_cache
        .entry(key)
        .await
        .map_err(internal_error)?
        .is_some()
    {
        return Err((
            StatusCode::BAD_REQUEST,
            "Configuration key already exists".to_string(),
        ));
    }

    let value = ConfigValue::from_json(req.config_value);
    if !state
        .config_cache
        .set(key, value.clone(), req.description.as_deref(), req.is_encrypted)
        .await
    {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to create configuration".to_string(),
        ));
    }
    tracing::info!("Admin {} created configuration {}", user.username, key);
    Ok(Json(written(key, &value, req.description, req.is_encrypted)))
}

async fn get_config(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(key): Path<String>,
) -> Result<Json<ConfigEntryResponse>, (StatusCode, String)> {
    user.require_admin()?;
    let entry = state
        .config_cache
        .entry(&key)
        .await
        .map_err(internal_error)?
        .ok_or_else(config_not_found)?;
    Ok(Json(entry.into()))
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(key): Path<String>,
    Json(req): Json<ConfigUpdateRequest>,
) -> Result<Json<ConfigEntryResponse>, (StatusCode, String)> {
    user.require_admin()?;
    let existing = state
        .config_cache
        .entry(&key)
        .await
        .map_err(internal_error)?
        .ok_or_else(config_not_found)?;

    let value = ConfigValue::from_json(req.config_value);
    if !state
        .config_cache
        .set(&key, value.clone(), req.description.as_deref(), req.is_encrypted)
        .await
    {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to update configuration".to_string(),
        ));
    }
    let description = req.description.or(existing.description);
    Ok(Json(written(&key, &value, description, req.is_encrypted)))
}

async fn delete_config(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(key): Path<String>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    user.require_admin()?;
    if !state.config_cache.delete(&key).await {
        return Err(config_not_found());
    }
    tracing::info!("Admin {} deleted configuration {}", user.username, key);
    Ok(Json(MessageResponse::new("Configuration deleted successfully")))
}

async fn reload_config(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<ReloadResponse>, (StatusCode, String)> {
    user.require_admin()?;
    let keys = state.config_cache.reload().await.map_err(internal_error)?;
    Ok(Json(ReloadResponse {
        message: "Configuration reloaded successfully".to_string(),
        keys,
    }))
}
