use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::credentials::{AuthScheme, CredentialVault};
use crate::error::{ServiceError, ServiceResult};
use crate::ledger::CostLedger;
use crate::store::{Database, NewCostEntry, Tool};

pub const TOOL_CALL_COST_TYPE: &str = "tool_call";

/// Status reported when the tool's timeout elapses.
const TIMEOUT_STATUS: u16 = 408;
/// Status reported for any other transport failure.
const TRANSPORT_ERROR_STATUS: u16 = 500;

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    #[serde(skip)]
    pub tool_id: i64,
    #[serde(skip)]
    pub user_id: i64,
    #[serde(default = "default_method")]
    pub method: String,
    /// Falls back to the tool's endpoint template.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Name of a stored credential bundle.
    #[serde(default)]
    pub auth_config: Option<String>,
}

impl ToolCall {
    pub fn new(tool_id: i64, user_id: i64, method: impl Into<String>) -> Self {
        Self {
            tool_id,
            user_id,
            method: method.into(),
            endpoint: None,
            headers: BTreeMap::new(),
            body: None,
            auth_config: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub status_code: u16,
    /// Parsed JSON body, or the raw text when the body is not JSON.
    pub data: Value,
    /// Seconds.
    pub execution_time: f64,
    pub cost: Decimal,
}

/// Case-insensitive membership in the tool's allow-list.
pub fn method_allowed(tool: &Tool, method: &str) -> bool {
    let wanted = method.trim();
    tool.allowed_methods
        .iter()
        .any(|allowed| allowed.trim().eq_ignore_ascii_case(wanted))
}

/// Tool defaults overlaid with caller headers; the caller wins, compared
/// case-insensitively.
pub fn merge_headers(
    defaults: &BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = defaults.clone();
    for (name, value) in overrides {
        merged.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
        merged.insert(name.clone(), value.clone());
    }
    merged
}

#[derive(Clone)]
pub struct ToolInvoker {
    db: Database,
    vault: CredentialVault,
    ledger: Option<CostLedger>,
    client: Client,
}

impl ToolInvoker {
    pub fn new(db: Database, vault: CredentialVault) -> Self {
        Self {
            db,
            vault,
            ledger: None,
            client: Client::new(),
        }
    }

    /// Also record a `tool_call` cost entry for every priced invocation.
    pub fn with_ledger(mut self, ledger: CostLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Call the tool's endpoint.
    ///
    /// Unknown tools are `NotFound`; inactive tools and disallowed methods
    /// are `Validation`. Once the request is attempted the call always
    /// returns a result: a timeout becomes status 408 and any other
    /// transport failure becomes status 500.
    pub async fn invoke(&self, call: ToolCall) -> ServiceResult<ToolCallResult> {
        let tool = self
            .db
            .get_tool(call.tool_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Tool with id {} not found", call.tool_id)))?;
        if !tool.is_active {
            return Err(ServiceError::Validation(format!("Tool {} is not active", tool.name)));
        }
        if !method_allowed(&tool, &call.method) {
            return Err(ServiceError::Validation(format!(
                "Method {} not allowed for tool {}",
                call.method, tool.name
            )));
        }
        let endpoint = call
            .endpoint
            .clone()
            .or_else(|| tool.endpoint_template.clone())
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| {
                ServiceError::Validation(format!("No endpoint given for tool {}", tool.name))
            })?;

        let mut headers = merge_headers(&tool.default_headers, &call.headers);
        if tool.requires_auth {
            if let Some(name) = call.auth_config.as_deref() {
                match self.vault.load(call.user_id, name).await? {
                    Some(bundle) => match AuthScheme::from_bundle(&bundle) {
                        Some(scheme) => scheme.apply(&mut headers),
                        None => warn!("Credential {} has no usable auth type", name),
                    },
                    None => warn!("Credential {} unavailable for tool {}", name, tool.name),
                }
            }
        }

        let started = Instant::now();
        let (status_code, data) = match self.send(&tool, &call, &endpoint, &headers).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_timeout() => {
                warn!("Tool {} timed out after {}s", tool.name, tool.timeout_seconds);
                (TIMEOUT_STATUS, json!({"error": "Request timeout"}))
            }
            Err(e) => {
                warn!("Tool {} request failed: {}", tool.name, e);
                (TRANSPORT_ERROR_STATUS, json!({"error": e.to_string()}))
            }
        };
        let result = ToolCallResult {
            status_code,
            data,
            execution_time: started.elapsed().as_secs_f64(),
            cost: tool.cost_per_request,
        };
        debug!(
            "Tool {} {} {} -> {} in {:.3}s",
            tool.name, call.method, endpoint, result.status_code, result.execution_time
        );

        self.charge(&tool, call.user_id).await;
        Ok(result)
    }

    async fn send(
        &self,
        tool: &Tool,
        call: &ToolCall,
        endpoint: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<(u16, Value), TransportError> {
        let method = Method::from_bytes(call.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| TransportError::Other(format!("Unsupported HTTP method: {}", call.method)))?;
        let sends_body = !matches!(method, Method::GET | Method::DELETE | Method::HEAD);

        let mut request = self
            .client
            .request(method, endpoint)
            .timeout(Duration::from_secs(tool.timeout_seconds));
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let (true, Some(body)) = (sends_body, call.body.as_ref()) {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let data = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok((status, data))
    }

    async fn charge(&self, tool: &Tool, user_id: i64) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        if tool.cost_per_request <= Decimal::ZERO {
            return;
        }
        let entry = NewCostEntry::new(user_id, TOOL_CALL_COST_TYPE, tool.cost_per_request)
            .tool(tool.id)
            .description(format!("Tool call to {}", tool.name));
        if let Err(e) = ledger.record(entry).await {
            warn!("Failed to record cost for tool {}: {}", tool.name, e);
        }
    }
}

#[derive(Debug)]
enum TransportError {
    Http(reqwest::Error),
    Other(String),
}

impl TransportError {
    fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Http(e) if e.is_timeout())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Http(e)
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Http(e) => write!(f, "{}", e),
            TransportError::Other(msg) => f.write_str(msg),
        }
    }
}
