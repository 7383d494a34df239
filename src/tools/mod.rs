//! HTTP tools callable by agents and users.
//!
//! A tool is a stored endpoint description (allowed methods, default
//! headers, timeout, flat per-request cost). Invocation resolves the tool,
//! merges headers, applies authentication from an encrypted credential
//! bundle and performs the request. Transport failures come back as
//! synthetic results rather than errors so callers always see a cost.

mod credentials;
mod invoke;

pub use credentials::{AuthScheme, CredentialVault};
pub use invoke::{merge_headers, method_allowed, ToolCall, ToolCallResult, ToolInvoker, TOOL_CALL_COST_TYPE};
