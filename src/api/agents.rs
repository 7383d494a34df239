//! Agent CRUD, tool links, execution and per-agent costs.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde_json::{json, Value};

use super::auth::AuthUser;
use super::routes::AppState;
use super::types::{
    error_response, forbidden, internal_error, not_found, ExecuteAgentRequest, LinkToolRequest,
    MessageResponse, Pagination,
};
use crate::agents::ExecuteRequest;
use crate::store::{
    validate_agent_settings, Agent, AgentCostSummary, AgentToolLink, AgentUpdate, Execution,
    NewAgent,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_agents).post(create_agent))
        .route("/:id", get(get_agent).put(update_agent).delete(delete_agent))
        .route("/:id/execute", post(execute_agent))
        .route("/:id/tools", get(list_agent_tools).post(link_tool))
        .route("/:id/tools/:tool_id", delete(unlink_tool))
        .route("/:id/costs", get(agent_costs))
}

/// Load an agent the caller may act on.
async fn owned_agent(state: &AppState, user: &AuthUser, id: i64) -> Result<Agent, (StatusCode, String)> {
    let agent = state
        .db
        .get_agent(id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Agent"))?;
    if !user.can_modify(Some(agent.owner_id)) {
        return Err(forbidden());
    }
    Ok(agent)
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<Agent>>, (StatusCode, String)> {
    let owner = (!user.is_admin()).then_some(user.id);
    let agents = state
        .db
        .list_agents(owner, page.skip, page.limit)
        .await
        .map_err(internal_error)?;
    Ok(Json(agents))
}

async fn create_agent(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(new): Json<NewAgent>,
) -> Result<Json<Agent>, (StatusCode, String)> {
    user.require_writer()?;
    new.validate()
        .map_err(|reason| (StatusCode::BAD_REQUEST, reason))?;
    let agent = state
        .db
        .create_agent(user.id, new)
        .await
        .map_err(internal_error)?;
    tracing::info!("User {} created agent {} ({})", user.username, agent.name, agent.id);
    Ok(Json(agent))
}

async fn get_agent(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> Result<Json<Agent>, (StatusCode, String)> {
    Ok(Json(owned_agent(&state, &user, id).await?))
}

async fn update_agent(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(update): Json<AgentUpdate>,
) -> Result<Json<Agent>, (StatusCode, String)> {
    owned_agent(&state, &user, id).await?;
    match state
        .db
        .update_agent(id, update, validate_agent_settings)
        .await
        .map_err(internal_error)?
    {
        Some(Ok(agent)) => Ok(Json(agent)),
        Some(Err(reason)) => Err((StatusCode::BAD_REQUEST, reason)),
        None => Err(not_found("Agent")),
    }
}

async fn delete_agent(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    owned_agent(&state, &user, id).await?;
    if !state.db.delete_agent(id).await.map_err(internal_error)? {
        return Err(not_found("Agent"));
    }
    Ok(Json(MessageResponse::new("Agent deleted successfully")))
}

async fn execute_agent(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(req): Json<ExecuteAgentRequest>,
) -> Result<Json<Execution>, (StatusCode, String)> {
    owned_agent(&state, &user, id).await?;
    let execution = state
        .executor
        .execute(ExecuteRequest {
            agent_id: id,
            user_id: user.id,
            input: req.input_message,
            context: req.context,
        })
        .await
        .map_err(error_response)?;
    Ok(Json(execution))
}

async fn list_agent_tools(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<AgentToolLink>>, (StatusCode, String)> {
    owned_agent(&state, &user, id).await?;
    let links = state.db.agent_tools(id).await.map_err(internal_error)?;
    Ok(Json(links))
}

async fn link_tool(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(req): Json<LinkToolRequest>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    owned_agent(&state, &user, id).await?;
    let tool = state
        .db
        .get_tool(req.tool_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Tool"))?;
    // Shared tools can be attached by anyone.
    if tool.owner_id.is_some() && !user.can_modify(tool.owner_id) {
        return Err(forbidden());
    }
    let configuration = req.configuration.unwrap_or_else(|| json!({}));
    if !configuration.is_object() {
        return Err((
            StatusCode::BAD_REQUEST,
            "configuration must be a JSON object".to_string(),
        ));
    }
    state
        .db
        .link_agent_tool(id, tool.id, configuration)
        .await
        .map_err(internal_error)?;
    Ok(Json(MessageResponse::new(format!(
        "Tool {} attached to agent",
        tool.name
    ))))
}

async fn unlink_tool(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((id, tool_id)): Path<(i64, i64)>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    owned_agent(&state, &user, id).await?;
    if !state
        .db
        .unlink_agent_tool(id, tool_id)
        .await
        .map_err(internal_error)?
    {
        return Err(not_found("Tool link"));
    }
    Ok(Json(MessageResponse::new("Tool detached from agent")))
}

async fn agent_costs(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let agent = owned_agent(&state, &user, id).await?;
    let AgentCostSummary {
        agent_id,
        total_amount,
        total_tokens,
        total_calls,
    } = state.ledger.agent_summary(id).await.map_err(error_response)?;
    Ok(Json(json!({
        "agent_id": agent_id,
        "agent_name": agent.name,
        "total_amount": total_amount,
        "total_tokens": total_tokens,
        "total_calls": total_calls,
    })))
}
