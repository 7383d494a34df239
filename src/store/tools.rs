use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{decimal_column, json_column, Database, StoreError};
use crate::util::now_string;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub endpoint_template: Option<String>,
    pub allowed_methods: Vec<String>,
    pub default_headers: BTreeMap<String, String>,
    pub requires_auth: bool,
    pub cost_per_request: Decimal,
    pub timeout_seconds: u64,
    pub is_active: bool,
    /// `None` for shared tools.
    pub owner_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

fn default_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_timeout() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub endpoint_template: Option<String>,
    #[serde(default = "default_methods")]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub cost_per_request: Decimal,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl NewTool {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            endpoint_template: None,
            allowed_methods: default_methods(),
            default_headers: BTreeMap::new(),
            requires_auth: false,
            cost_per_request: Decimal::ZERO,
            timeout_seconds: default_timeout(),
            is_active: true,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_tool_settings(&Tool {
            id: 0,
            name: self.name.clone(),
            description: None,
            endpoint_template: None,
            allowed_methods: self.allowed_methods.clone(),
            default_headers: BTreeMap::new(),
            requires_auth: self.requires_auth,
            cost_per_request: self.cost_per_request,
            timeout_seconds: self.timeout_seconds,
            is_active: self.is_active,
            owner_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolUpdate {
    pub description: Option<String>,
    pub endpoint_template: Option<String>,
    pub allowed_methods: Option<Vec<String>>,
    pub default_headers: Option<BTreeMap<String, String>>,
    pub requires_auth: Option<bool>,
    pub cost_per_request: Option<Decimal>,
    pub timeout_seconds: Option<u64>,
    pub is_active: Option<bool>,
}

/// Sanity checks shared by create and update.
pub fn validate_tool_settings(tool: &Tool) -> Result<(), String> {
    if tool.name.trim().is_empty() {
        return Err("name must not be empty".to_string());
    }
    if tool.cost_per_request < Decimal::ZERO {
        return Err("cost_per_request must not be negative".to_string());
    }
    if tool.timeout_seconds == 0 || tool.timeout_seconds > 300 {
        return Err("timeout_seconds must be between 1 and 300".to_string());
    }
    if tool.allowed_methods.iter().any(|m| m.trim().is_empty()) {
        return Err("allowed_methods must not contain empty entries".to_string());
    }
    Ok(())
}

const TOOL_COLUMNS: &str = "id, name, description, endpoint_template, allowed_methods, \
     default_headers, requires_auth, cost_per_request, timeout_seconds, is_active, owner_id, \
     created_at, updated_at";

fn join_methods(methods: &[String]) -> String {
    methods
        .iter()
        .map(|m| m.trim().to_uppercase())
        .collect::<Vec<_>>()
        .join(",")
}

fn tool_from_row(row: &Row<'_>) -> rusqlite::Result<Tool> {
    let methods: String = row.get(4)?;
    let timeout: i64 = row.get(8)?;
    Ok(Tool {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        endpoint_template: row.get(3)?,
        allowed_methods: methods
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(String::from)
            .collect(),
        default_headers: json_column(row, 5)?,
        requires_auth: row.get(6)?,
        cost_per_request: decimal_column(row, 7)?,
        timeout_seconds: timeout.max(1) as u64,
        is_active: row.get(9)?,
        owner_id: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

pub(super) fn query_tool(conn: &Connection, id: i64) -> rusqlite::Result<Option<Tool>> {
    conn.query_row(
        &format!("SELECT {TOOL_COLUMNS} FROM tools WHERE id = ?1"),
        params![id],
        tool_from_row,
    )
    .optional()
}

fn write_tool(conn: &Connection, tool: &Tool) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE tools SET description = ?1, endpoint_template = ?2, allowed_methods = ?3,
            default_headers = ?4, requires_auth = ?5, cost_per_request = ?6,
            timeout_seconds = ?7, is_active = ?8, updated_at = ?9
         WHERE id = ?10",
        params![
            tool.description,
            tool.endpoint_template,
            join_methods(&tool.allowed_methods),
            serde_json::to_string(&tool.default_headers)?,
            tool.requires_auth,
            tool.cost_per_request.to_string(),
            tool.timeout_seconds as i64,
            tool.is_active,
            tool.updated_at,
            tool.id
        ],
    )?;
    Ok(())
}

impl Database {
    pub async fn create_tool(&self, owner_id: Option<i64>, new: NewTool) -> Result<Tool, StoreError> {
        let headers = serde_json::to_string(&new.default_headers)?;
        self.call(move |conn| {
            let now = now_string();
            conn.execute(
                "INSERT INTO tools (name, description, endpoint_template, allowed_methods,
                    default_headers, requires_auth, cost_per_request, timeout_seconds, is_active,
                    owner_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    new.name,
                    new.description,
                    new.endpoint_template,
                    join_methods(&new.allowed_methods),
                    headers,
                    new.requires_auth,
                    new.cost_per_request.to_string(),
                    new.timeout_seconds as i64,
                    new.is_active,
                    owner_id,
                    now
                ],
            )?;
            let id = conn.last_insert_rowid();
            query_tool(conn, id)?
                .ok_or_else(|| StoreError::Conflict(format!("tool {id} vanished after insert")))
        })
        .await
    }

    pub async fn get_tool(&self, id: i64) -> Result<Option<Tool>, StoreError> {
        self.call(move |conn| Ok(query_tool(conn, id)?)).await
    }

    /// Tools visible to `viewer` (own plus shared), or every tool for `None`.
    pub async fn list_tools(
        &self,
        viewer: Option<i64>,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<Tool>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TOOL_COLUMNS} FROM tools
                 WHERE (?1 IS NULL OR owner_id = ?1 OR owner_id IS NULL)
                 ORDER BY id LIMIT ?2 OFFSET ?3"
            ))?;
            let tools = stmt
                .query_map(params![viewer, limit, skip], tool_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tools)
        })
        .await
    }

    /// Apply `update`, returning `None` when the tool does not exist.
    pub async fn update_tool(
        &self,
        id: i64,
        update: ToolUpdate,
    ) -> Result<Option<Result<Tool, String>>, StoreError> {
        self.call(move |conn| {
            let Some(mut tool) = query_tool(conn, id)? else {
                return Ok(None);
            };
            if let Some(v) = update.description {
                tool.description = Some(v);
            }
            if let Some(v) = update.endpoint_template {
                tool.endpoint_template = Some(v);
            }
            if let Some(v) = update.allowed_methods {
                tool.allowed_methods = v;
            }
            if let Some(v) = update.default_headers {
                tool.default_headers = v;
            }
            if let Some(v) = update.requires_auth {
                tool.requires_auth = v;
            }
            if let Some(v) = update.cost_per_request {
                tool.cost_per_request = v;
            }
            if let Some(v) = update.timeout_seconds {
                tool.timeout_seconds = v;
            }
            if let Some(v) = update.is_active {
                tool.is_active = v;
            }
            if let Err(reason) = validate_tool_settings(&tool) {
                return Ok(Some(Err(reason)));
            }
            tool.updated_at = now_string();
            write_tool(conn, &tool)?;
            Ok(query_tool(conn, id)?.map(Ok))
        })
        .await
    }

    pub async fn delete_tool(&self, id: i64) -> Result<bool, StoreError> {
        self.call(move |conn| Ok(conn.execute("DELETE FROM tools WHERE id = ?1", params![id])? > 0))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::seed_user;
    use crate::store::Role;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn tool_roundtrip_preserves_decimal_and_headers() {
        let db = Database::open_in_memory().await.unwrap();
        let owner = seed_user(&db, "owner", Role::User).await;

        let mut new = NewTool::named("weather");
        new.cost_per_request = dec!(0.0015);
        new.allowed_methods = vec!["get".into(), " post ".into()];
        new.default_headers
            .insert("Accept".into(), "application/json".into());
        let tool = db.create_tool(Some(owner), new).await.unwrap();

        assert_eq!(tool.cost_per_request, dec!(0.0015));
        assert_eq!(tool.allowed_methods, vec!["GET", "POST"]);
        assert_eq!(tool.default_headers["Accept"], "application/json");
        assert_eq!(tool.timeout_seconds, 30);
    }

    #[tokio::test]
    async fn shared_tools_are_visible_to_everyone() {
        let db = Database::open_in_memory().await.unwrap();
        let alice = seed_user(&db, "alice", Role::User).await;
        let bob = seed_user(&db, "bob", Role::User).await;
        db.create_tool(None, NewTool::named("shared")).await.unwrap();
        db.create_tool(Some(alice), NewTool::named("private"))
            .await
            .unwrap();

        let names = |tools: Vec<Tool>| tools.into_iter().map(|t| t.name).collect::<Vec<_>>();
        assert_eq!(
            names(db.list_tools(Some(bob), 0, 50).await.unwrap()),
            vec!["shared"]
        );
        assert_eq!(db.list_tools(Some(alice), 0, 50).await.unwrap().len(), 2);
        assert_eq!(db.list_tools(None, 0, 50).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_rejects_bad_timeout() {
        let db = Database::open_in_memory().await.unwrap();
        let tool = db.create_tool(None, NewTool::named("t")).await.unwrap();
        let result = db
            .update_tool(
                tool.id,
                ToolUpdate {
                    timeout_seconds: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());

        let updated = db
            .update_tool(
                tool.id,
                ToolUpdate {
                    timeout_seconds: Some(5),
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(updated.timeout_seconds, 5);
        assert!(!updated.is_active);
        assert!(db.update_tool(999, ToolUpdate::default()).await.unwrap().is_none());
    }
}
