//! Request and response types shared by the API handlers.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ServiceError;

/// Map a service error to an HTTP status and message.
pub fn error_response(err: ServiceError) -> (StatusCode, String) {
    let status = match &err {
        ServiceError::NotFound(_) | ServiceError::AgentNotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        ServiceError::Validation(_)
        | ServiceError::MissingVariables(_)
        | ServiceError::AgentInactive(_) => StatusCode::BAD_REQUEST,
        ServiceError::Upstream(_) => StatusCode::BAD_GATEWAY,
        ServiceError::Persistence(_) | ServiceError::Crypto(_) => {
            tracing::error!("Request failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

pub fn internal_error(err: impl std::fmt::Display) -> (StatusCode, String) {
    tracing::error!("Internal error: {}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

pub fn forbidden() -> (StatusCode, String) {
    (StatusCode::FORBIDDEN, "Not enough permissions".to_string())
}

pub fn not_found(what: &str) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("{} not found", what))
}

fn default_limit() -> u32 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub skip: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: default_limit(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub dev_mode: bool,
    pub auth_required: bool,
    pub hot_reload_running: bool,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// Auth

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Username or email.
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    /// Unix seconds.
    pub exp: i64,
}

// Agents

#[derive(Debug, Deserialize)]
pub struct ExecuteAgentRequest {
    pub input_message: String,
    #[serde(default)]
    pub context: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct LinkToolRequest {
    pub tool_id: i64,
    #[serde(default)]
    pub configuration: Option<Value>,
}

// Tools

#[derive(Debug, Deserialize)]
pub struct StoreCredentialRequest {
    pub credential_name: String,
    pub credential_data: Value,
}

#[derive(Debug, Serialize)]
pub struct CredentialListResponse {
    pub credentials: Vec<String>,
}

// Prompts

#[derive(Debug, Deserialize)]
pub struct RenderRequest {
    #[serde(default)]
    pub variables: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct RenderResponse {
    pub template_id: i64,
    pub rendered_content: String,
    pub variables_used: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateContentRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateVersionRequest {
    pub content: String,
    #[serde(default)]
    pub description: Option<String>,
}

// Metrics

#[derive(Debug, Default, Deserialize)]
pub struct CostQuery {
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub cost_type: Option<String>,
    #[serde(default)]
    pub skip: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecutionQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub agent_id: Option<i64>,
    #[serde(default)]
    pub skip: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

// Config

#[derive(Debug, Deserialize)]
pub struct ConfigCreateRequest {
    pub config_key: String,
    pub config_value: Value,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_encrypted: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConfigUpdateRequest {
    pub config_value: Value,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_encrypted: bool,
}

#[derive(Debug, Serialize)]
pub struct ConfigEntryResponse {
    pub config_key: String,
    pub config_value: Option<Value>,
    pub description: Option<String>,
    pub is_encrypted: bool,
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub message: String,
    pub keys: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_errors_map_to_statuses() {
        let cases = [
            (ServiceError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ServiceError::AgentNotFound(1), StatusCode::NOT_FOUND),
            (ServiceError::PermissionDenied("x".into()), StatusCode::FORBIDDEN),
            (ServiceError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ServiceError::MissingVariables(vec!["a".into()]), StatusCode::BAD_REQUEST),
            (ServiceError::AgentInactive("a".into()), StatusCode::BAD_REQUEST),
            (ServiceError::Upstream("x".into()), StatusCode::BAD_GATEWAY),
        ];
        for (err, status) in cases {
            assert_eq!(error_response(err).0, status);
        }
    }

    #[test]
    fn pagination_defaults() {
        let page: Pagination = serde_json::from_str("{}").unwrap();
        assert_eq!(page.skip, 0);
        assert_eq!(page.limit, 100);
    }
}
