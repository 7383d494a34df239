//! Agent execution.
//!
//! An agent is a stored model configuration (prompt, personality, sampling
//! parameters). [`AgentExecutor`] turns one user message into one tracked
//! `Execution` with its cost recorded in the ledger.

mod executor;

pub use executor::{build_messages, AgentExecutor, ExecuteRequest, LLM_CALL_COST_TYPE};
