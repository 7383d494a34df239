//! HTTP API for the agent platform.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /api/auth/register`, `POST /api/auth/login` - Accounts and tokens
//! - `/api/agents` - Agent CRUD, `/:id/execute`, `/:id/tools`, `/:id/costs`
//! - `/api/tools` - Tool CRUD, `/:id/invoke`, `/credentials`
//! - `/api/prompts` - Templates, `/validate`, `/:id/render`, `/:id/versions`
//! - `/api/metrics` - `/costs`, `/costs/detailed`, `/usage`, `/executions`
//! - `/api/config` - Runtime configuration (admin only), `/reload`

mod agents;
pub mod auth;
mod config;
mod metrics;
mod prompts;
mod routes;
mod tools;
pub mod types;

pub use routes::{router, serve, AppState};
