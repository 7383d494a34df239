//! Prompt template endpoints.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};

use super::auth::AuthUser;
use super::routes::AppState;
use super::types::{
    error_response, forbidden, CreateVersionRequest, MessageResponse, Pagination, RenderRequest,
    RenderResponse, ValidateContentRequest,
};
use crate::prompts::{self, TemplateValidation};
use crate::store::{NewPromptTemplate, PromptTemplate, PromptTemplateUpdate};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_templates).post(create_template))
        .route("/validate", post(validate_content))
        .route(
            "/:id",
            get(get_template).put(update_template).delete(delete_template),
        )
        .route("/:id/render", post(render_template))
        .route("/:id/validate", get(validate_template))
        .route("/:id/versions", post(create_version))
}

async fn owned_template(
    state: &AppState,
    user: &AuthUser,
    id: i64,
) -> Result<PromptTemplate, (StatusCode, String)> {
    let template = state.prompts.get(id).await.map_err(error_response)?;
    if !user.can_modify(Some(template.owner_id)) {
        return Err(forbidden());
    }
    Ok(template)
}

async fn list_templates(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<PromptTemplate>>, (StatusCode, String)> {
    let owner = (!user.is_admin()).then_some(user.id);
    let templates = state
        .prompts
        .list(owner, page.skip, page.limit)
        .await
        .map_err(error_response)?;
    Ok(Json(templates))
}

async fn create_template(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(new): Json<NewPromptTemplate>,
) -> Result<Json<PromptTemplate>, (StatusCode, String)> {
    user.require_writer()?;
    let template = state
        .prompts
        .create(user.id, new)
        .await
        .map_err(error_response)?;
    Ok(Json(template))
}

async fn validate_content(
    Json(req): Json<ValidateContentRequest>,
) -> Json<TemplateValidation> {
    Json(prompts::validate(&req.content))
}

async fn get_template(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> Result<Json<PromptTemplate>, (StatusCode, String)> {
    Ok(Json(owned_template(&state, &user, id).await?))
}

async fn update_template(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(update): Json<PromptTemplateUpdate>,
) -> Result<Json<PromptTemplate>, (StatusCode, String)> {
    owned_template(&state, &user, id).await?;
    let template = state
        .prompts
        .update(id, update)
        .await
        .map_err(error_response)?;
    Ok(Json(template))
}

async fn delete_template(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    owned_template(&state, &user, id).await?;
    state.prompts.delete(id).await.map_err(error_response)?;
    Ok(Json(MessageResponse::new("Template deleted successfully")))
}

async fn render_template(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(req): Json<RenderRequest>,
) -> Result<Json<RenderResponse>, (StatusCode, String)> {
    owned_template(&state, &user, id).await?;
    let rendered = state
        .prompts
        .render(id, &req.variables)
        .await
        .map_err(error_response)?;
    Ok(Json(RenderResponse {
        template_id: id,
        rendered_content: rendered,
        variables_used: req.variables,
    }))
}

async fn validate_template(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> Result<Json<TemplateValidation>, (StatusCode, String)> {
    let template = owned_template(&state, &user, id).await?;
    Ok(Json(prompts::validate(&template.content)))
}

async fn create_version(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(req): Json<CreateVersionRequest>,
) -> Result<Json<PromptTemplate>, (StatusCode, String)> {
    owned_template(&state, &user, id).await?;
    let template = state
        .prompts
        .create_version(id, user.id, req.content, req.description)
        .await
        .map_err(error_response)?;
    tracing::info!(
        "Created version {} of template {}",
        template.version,
        template.name
    );
    Ok(Json(template))
}
