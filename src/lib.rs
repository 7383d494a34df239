//! # Agent Platform
//!
//! Multi-tenant backend for configurable LLM agents.
//!
//! Users register agents (a system prompt plus model settings), attach HTTP
//! tools, keep reusable prompt templates and track what everything costs.
//! Secrets never touch the database in plain text: tool credentials and
//! flagged configuration values are sealed with AES-256-GCM.
//!
//! ## Request Flow
//! 1. Authenticate the caller (JWT, or the dev admin in dev mode)
//! 2. Check ownership of the agent, tool or template
//! 3. Call the model or tool endpoint
//! 4. Record the execution and append cost entries to the ledger
//!
//! ## Modules
//! - `agents`: Agent execution against an LLM
//! - `config_cache`: Runtime configuration with hot reload
//! - `ledger`: Append-only cost ledger and summaries
//! - `prompts`: `{name}` templates with versioning
//! - `tools`: Tool invocation and encrypted credentials
//! - `store`: SQLite persistence

pub mod agents;
pub mod api;
pub mod config;
pub mod config_cache;
pub mod cost;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod llm;
pub mod prompts;
pub mod store;
pub mod tools;
pub mod util;

pub use config::Config;
pub use config_cache::{ConfigCache, ConfigValue};
pub use crypto::Cipher;
