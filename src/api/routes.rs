//! Router assembly, shared state and the server loop.

use std::sync::Arc;

use axum::middleware;
use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use rand::RngCore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agents::AgentExecutor;
use crate::config::Config;
use crate::config_cache::ConfigCache;
use crate::ledger::CostLedger;
use crate::llm::{LlmClient, OpenAiClient};
use crate::prompts::PromptEngine;
use crate::store::{Database, NewUser, Role};
use crate::tools::{CredentialVault, ToolInvoker};

use super::agents as agents_api;
use super::auth::{self, AuthUser};
use super::config as config_api;
use super::metrics as metrics_api;
use super::prompts as prompts_api;
use super::tools as tools_api;
use super::types::HealthResponse;

const DEV_USERNAME: &str = "dev";

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub db: Database,
    /// Runtime configuration with encrypted values and hot reload
    pub config_cache: Arc<ConfigCache>,
    pub executor: AgentExecutor,
    pub ledger: CostLedger,
    pub prompts: PromptEngine,
    pub tools: ToolInvoker,
    /// Per-user encrypted credential bundles
    pub vault: CredentialVault,
    /// Identity every request assumes in dev mode
    pub dev_user: Option<AuthUser>,
}

impl AppState {
    /// Wire every service over one database handle.
    pub async fn new(
        config: Config,
        db: Database,
        llm: Arc<dyn LlmClient>,
    ) -> anyhow::Result<Arc<Self>> {
        let cipher = config.cipher.clone();
        let config_cache = Arc::new(ConfigCache::with_interval(
            Arc::new(db.clone()),
            cipher.clone(),
            config.config_reload_interval,
        ));
        let ledger = CostLedger::new(db.clone());
        let vault = CredentialVault::new(db.clone(), cipher);
        let tools = ToolInvoker::new(db.clone(), vault.clone()).with_ledger(ledger.clone());
        let executor = AgentExecutor::new(db.clone(), llm, ledger.clone());
        let prompts = PromptEngine::new(db.clone());

        let dev_user = if config.dev_mode {
            Some(ensure_dev_user(&db).await?)
        } else {
            None
        };

        Ok(Arc::new(Self {
            config,
            db,
            config_cache,
            executor,
            ledger,
            prompts,
            tools,
            vault,
            dev_user,
        }))
    }
}

/// Find or create the admin account dev-mode requests act as.
async fn ensure_dev_user(db: &Database) -> anyhow::Result<AuthUser> {
    if let Some(user) = db.find_user_by_login(DEV_USERNAME).await? {
        return Ok(AuthUser {
            id: user.id,
            username: user.username,
            role: Role::Admin,
        });
    }

    // Unguessable password; the account is only reachable through dev mode.
    let mut secret = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut secret);
    let user = db
        .create_user(NewUser {
            username: DEV_USERNAME.to_string(),
            email: "dev@localhost".to_string(),
            password_hash: auth::hash_password(&hex::encode(secret)),
            full_name: Some("Development Admin".to_string()),
            role: Role::Admin,
        })
        .await?;
    tracing::warn!("DEV_MODE enabled: requests act as admin user {}", user.id);
    Ok(AuthUser::from(&user))
}

/// Build the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .nest("/api/agents", agents_api::routes())
        .nest("/api/tools", tools_api::routes())
        .nest("/api/prompts", prompts_api::routes())
        .nest("/api/metrics", metrics_api::routes())
        .nest("/api/config", config_api::routes())
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database_path).await?;
    tracing::info!("Database opened at {}", config.database_path.display());

    if config.llm.api_key.is_none() {
        tracing::warn!("LLM_API_KEY not set; agent executions will fail");
    }
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(
        config.llm.api_key.clone(),
        config.llm.api_url.clone(),
    ));

    let state = AppState::new(config, db, llm).await?;

    match state.config_cache.reload().await {
        Ok(keys) => tracing::info!("Loaded {} configuration keys", keys),
        Err(e) => tracing::error!("Initial configuration load failed: {}", e),
    }
    if state.config_cache.is_hot_reload_enabled().await {
        state.config_cache.start_hot_reload().await;
    } else {
        tracing::info!("Hot reload disabled by configuration");
    }

    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    // Setup graceful shutdown on SIGTERM/SIGINT
    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_state).await;
        })
        .await?;

    Ok(())
}

/// Wait for SIGINT/SIGTERM, then stop background work.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping config reload...");
    state.config_cache.stop_hot_reload().await;
    tracing::info!("Graceful shutdown complete");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dev_mode: state.config.dev_mode,
        auth_required: state.config.auth.auth_required(state.config.dev_mode),
        hot_reload_running: state.config_cache.is_hot_reload_running().await,
    })
}
