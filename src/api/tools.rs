//! Tool registry, invocation and the caller's credential bundles.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;

use super::auth::AuthUser;
use super::routes::AppState;
use super::types::{
    error_response, forbidden, internal_error, not_found, CredentialListResponse,
    MessageResponse, Pagination, StoreCredentialRequest,
};
use crate::store::{NewTool, Tool, ToolUpdate};
use crate::tools::{ToolCall, ToolCallResult};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_tools).post(create_tool))
        .route(
            "/credentials",
            get(list_credentials).post(store_credential),
        )
        .route("/credentials/:name", delete(delete_credential))
        .route("/:id", get(get_tool).put(update_tool).delete(delete_tool))
        .route("/:id/invoke", post(invoke_tool))
}

#[derive(Debug, Deserialize)]
struct CreateToolRequest {
    #[serde(flatten)]
    tool: NewTool,
    /// Admin-only: register without an owner so every user can use it.
    #[serde(default)]
    shared: bool,
}

/// Shared tools are readable by everyone.
fn can_read(user: &AuthUser, tool: &Tool) -> bool {
    tool.owner_id.is_none() || user.can_modify(tool.owner_id)
}

async fn load_tool(state: &AppState, id: i64) -> Result<Tool, (StatusCode, String)> {
    state
        .db
        .get_tool(id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Tool"))
}

async fn list_tools(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<Tool>>, (StatusCode, String)> {
    let viewer = (!user.is_admin()).then_some(user.id);
    let tools = state
        .db
        .list_tools(viewer, page.skip, page.limit)
        .await
        .map_err(internal_error)?;
    Ok(Json(tools))
}

async fn create_tool(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateToolRequest>,
) -> Result<Json<Tool>, (StatusCode, String)> {
    user.require_writer()?;
    if req.shared {
        user.require_admin()?;
    }
    req.tool
        .validate()
        .map_err(|reason| (StatusCode::BAD_REQUEST, reason))?;

    let owner = (!req.shared).then_some(user.id);
    let tool = state.db.create_tool(owner, req.tool).await.map_err(|e| {
        if e.is_constraint_violation() {
            (
                StatusCode::BAD_REQUEST,
                "Tool name already exists".to_string(),
            )
        } else {
            internal_error(e)
        }
    })?;
    tracing::info!("User {} registered tool {} ({})", user.username, tool.name, tool.id);
    Ok(Json(tool))
}

async fn get_tool(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> Result<Json<Tool>, (StatusCode, String)> {
    let tool = load_tool(&state, id).await?;
    if !can_read(&user, &tool) {
        return Err(forbidden());
    }
    Ok(Json(tool))
}

async fn update_tool(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(update): Json<ToolUpdate>,
) -> Result<Json<Tool>, (StatusCode, String)> {
    let tool = load_tool(&state, id).await?;
    if !user.can_modify(tool.owner_id) {
        return Err(forbidden());
    }
    match state
        .db
        .update_tool(id, update)
        .await
        .map_err(internal_error)?
    {
        Some(Ok(tool)) => Ok(Json(tool)),
        Some(Err(reason)) => Err((StatusCode::BAD_REQUEST, reason)),
        None => Err(not_found("Tool")),
    }
}

async fn delete_tool(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    let tool = load_tool(&state, id).await?;
    if !user.can_modify(tool.owner_id) {
        return Err(forbidden());
    }
    if !state.db.delete_tool(id).await.map_err(internal_error)? {
        return Err(not_found("Tool"));
    }
    Ok(Json(MessageResponse::new("Tool deleted successfully")))
}

async fn invoke_tool(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(mut call): Json<ToolCall>,
) -> Result<Json<ToolCallResult>, (StatusCode, String)> {
    let tool = load_tool(&state, id).await?;
    if !can_read(&user, &tool) {
        return Err(forbidden());
    }
    call.tool_id = id;
    call.user_id = user.id;
    let result = state.tools.invoke(call).await.map_err(error_response)?;
    Ok(Json(result))
}

async fn store_credential(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<StoreCredentialRequest>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    let name = req.credential_name.trim();
    if name.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "credential_name must not be empty".to_string(),
        ));
    }
    if !req.credential_data.is_object() {
        return Err((
            StatusCode::BAD_REQUEST,
            "credential_data must be a JSON object".to_string(),
        ));
    }
    state
        .vault
        .store(user.id, name, &req.credential_data)
        .await
        .map_err(error_response)?;
    Ok(Json(MessageResponse::new(format!(
        "Credential {} stored",
        name
    ))))
}

async fn list_credentials(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<CredentialListResponse>, (StatusCode, String)> {
    let credentials = state.vault.list(user.id).await.map_err(error_response)?;
    Ok(Json(CredentialListResponse { credentials }))
}

async fn delete_credential(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    if !state
        .vault
        .delete(user.id, &name)
        .await
        .map_err(error_response)?
    {
        return Err(not_found("Credential"));
    }
    Ok(Json(MessageResponse::new("Credential deleted")))
}
