use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::tools::query_tool;
use super::{json_column, Database, StoreError, Tool};
use crate::util::now_string;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub system_prompt: Option<String>,
    pub personality: Option<String>,
    pub model_name: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub rate_limit_per_minute: u32,
    pub is_active: bool,
    pub owner_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_top_p() -> f64 {
    1.0
}
fn default_rate_limit() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAgent {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub personality: Option<String>,
    #[serde(default = "default_model")]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default)]
    pub frequency_penalty: f64,
    #[serde(default)]
    pub presence_penalty: f64,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
}

impl NewAgent {
    /// Agent with default model settings.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            system_prompt: None,
            personality: None,
            model_name: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            rate_limit_per_minute: default_rate_limit(),
        }
    }

    /// Same checks as [`validate_agent_settings`], before the row exists.
    pub fn validate(&self) -> Result<(), String> {
        validate_agent_settings(&Agent {
            id: 0,
            name: self.name.clone(),
            description: None,
            system_prompt: None,
            personality: None,
            model_name: self.model_name.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
            rate_limit_per_minute: self.rate_limit_per_minute,
            is_active: true,
            owner_id: 0,
            created_at: String::new(),
            updated_at: String::new(),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub system_prompt: Option<String>,
    pub personality: Option<String>,
    pub model_name: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub rate_limit_per_minute: Option<u32>,
    pub is_active: Option<bool>,
}

impl AgentUpdate {
    fn apply(self, agent: &mut Agent) {
        if let Some(v) = self.name {
            agent.name = v;
        }
        if let Some(v) = self.description {
            agent.description = Some(v);
        }
        if let Some(v) = self.system_prompt {
            agent.system_prompt = Some(v);
        }
        if let Some(v) = self.personality {
            agent.personality = Some(v);
        }
        if let Some(v) = self.model_name {
            agent.model_name = v;
        }
        if let Some(v) = self.temperature {
            agent.temperature = v;
        }
        if let Some(v) = self.max_tokens {
            agent.max_tokens = v;
        }
        if let Some(v) = self.top_p {
            agent.top_p = v;
        }
        if let Some(v) = self.frequency_penalty {
            agent.frequency_penalty = v;
        }
        if let Some(v) = self.presence_penalty {
            agent.presence_penalty = v;
        }
        if let Some(v) = self.rate_limit_per_minute {
            agent.rate_limit_per_minute = v;
        }
        if let Some(v) = self.is_active {
            agent.is_active = v;
        }
    }
}

/// Model settings shared by create and update.
pub fn validate_agent_settings(agent: &Agent) -> Result<(), String> {
    if agent.name.trim().is_empty() {
        return Err("name must not be empty".to_string());
    }
    if !(0.0..=2.0).contains(&agent.temperature) {
        return Err("temperature must be between 0 and 2".to_string());
    }
    if !(1..=4000).contains(&agent.max_tokens) {
        return Err("max_tokens must be between 1 and 4000".to_string());
    }
    if !(0.0..=1.0).contains(&agent.top_p) {
        return Err("top_p must be between 0 and 1".to_string());
    }
    for (label, value) in [
        ("frequency_penalty", agent.frequency_penalty),
        ("presence_penalty", agent.presence_penalty),
    ] {
        if !(-2.0..=2.0).contains(&value) {
            return Err(format!("{label} must be between -2 and 2"));
        }
    }
    if !(1..=1000).contains(&agent.rate_limit_per_minute) {
        return Err("rate_limit_per_minute must be between 1 and 1000".to_string());
    }
    Ok(())
}

/// An active tool attached to an agent, with its per-link configuration.
#[derive(Debug, Clone, Serialize)]
pub struct AgentToolLink {
    pub tool: Tool,
    pub configuration: serde_json::Value,
}

const AGENT_COLUMNS: &str = "id, name, description, system_prompt, personality, model_name, \
     temperature, max_tokens, top_p, frequency_penalty, presence_penalty, \
     rate_limit_per_minute, is_active, owner_id, created_at, updated_at";

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        system_prompt: row.get(3)?,
        personality: row.get(4)?,
        model_name: row.get(5)?,
        temperature: row.get(6)?,
        max_tokens: row.get(7)?,
        top_p: row.get(8)?,
        frequency_penalty: row.get(9)?,
        presence_penalty: row.get(10)?,
        rate_limit_per_minute: row.get(11)?,
        is_active: row.get(12)?,
        owner_id: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

pub(super) fn query_agent(conn: &Connection, id: i64) -> rusqlite::Result<Option<Agent>> {
    conn.query_row(
        &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
        params![id],
        agent_from_row,
    )
    .optional()
}

impl Database {
    pub async fn create_agent(&self, owner_id: i64, new: NewAgent) -> Result<Agent, StoreError> {
        self.call(move |conn| {
            let now = now_string();
            conn.execute(
                "INSERT INTO agents (name, description, system_prompt, personality, model_name,
                    temperature, max_tokens, top_p, frequency_penalty, presence_penalty,
                    rate_limit_per_minute, is_active, owner_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?12, ?13, ?13)",
                params![
                    new.name,
                    new.description,
                    new.system_prompt,
                    new.personality,
                    new.model_name,
                    new.temperature,
                    new.max_tokens,
                    new.top_p,
                    new.frequency_penalty,
                    new.presence_penalty,
                    new.rate_limit_per_minute,
                    owner_id,
                    now
                ],
            )?;
            let id = conn.last_insert_rowid();
            query_agent(conn, id)?.ok_or_else(|| {
                StoreError::Conflict(format!("agent {id} vanished after insert"))
            })
        })
        .await
    }

    pub async fn get_agent(&self, id: i64) -> Result<Option<Agent>, StoreError> {
        self.call(move |conn| Ok(query_agent(conn, id)?)).await
    }

    /// List agents, newest first. `owner` of `None` lists every agent.
    pub async fn list_agents(
        &self,
        owner: Option<i64>,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<Agent>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {AGENT_COLUMNS} FROM agents
                 WHERE (?1 IS NULL OR owner_id = ?1)
                 ORDER BY id DESC LIMIT ?2 OFFSET ?3"
            ))?;
            let agents = stmt
                .query_map(params![owner, limit, skip], agent_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(agents)
        })
        .await
    }

    /// Apply `update` after checking it with `check`. Returns `None` when the
    /// agent does not exist.
    pub async fn update_agent<F>(
        &self,
        id: i64,
        update: AgentUpdate,
        check: F,
    ) -> Result<Option<Result<Agent, String>>, StoreError>
    where
        F: FnOnce(&Agent) -> Result<(), String> + Send + 'static,
    {
        self.call(move |conn| {
            let Some(mut agent) = query_agent(conn, id)? else {
                return Ok(None);
            };
            update.apply(&mut agent);
            if let Err(reason) = check(&agent) {
                return Ok(Some(Err(reason)));
            }
            agent.updated_at = now_string();
            conn.execute(
                "UPDATE agents SET name = ?1, description = ?2, system_prompt = ?3,
                    personality = ?4, model_name = ?5, temperature = ?6, max_tokens = ?7,
                    top_p = ?8, frequency_penalty = ?9, presence_penalty = ?10,
                    rate_limit_per_minute = ?11, is_active = ?12, updated_at = ?13
                 WHERE id = ?14",
                params![
                    agent.name,
                    agent.description,
                    agent.system_prompt,
                    agent.personality,
                    agent.model_name,
                    agent.temperature,
                    agent.max_tokens,
                    agent.top_p,
                    agent.frequency_penalty,
                    agent.presence_penalty,
                    agent.rate_limit_per_minute,
                    agent.is_active,
                    agent.updated_at,
                    id
                ],
            )?;
            Ok(Some(Ok(agent)))
        })
        .await
    }

    pub async fn delete_agent(&self, id: i64) -> Result<bool, StoreError> {
        self.call(move |conn| Ok(conn.execute("DELETE FROM agents WHERE id = ?1", params![id])? > 0))
            .await
    }

    /// Attach a tool to an agent, replacing any existing link configuration.
    pub async fn link_agent_tool(
        &self,
        agent_id: i64,
        tool_id: i64,
        configuration: serde_json::Value,
    ) -> Result<(), StoreError> {
        let configuration = serde_json::to_string(&configuration)?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO agent_tools (agent_id, tool_id, configuration, is_active, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(agent_id, tool_id)
                 DO UPDATE SET configuration = excluded.configuration, is_active = 1",
                params![agent_id, tool_id, configuration, now_string()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn unlink_agent_tool(&self, agent_id: i64, tool_id: i64) -> Result<bool, StoreError> {
        self.call(move |conn| {
            Ok(conn.execute(
                "DELETE FROM agent_tools WHERE agent_id = ?1 AND tool_id = ?2",
                params![agent_id, tool_id],
            )? > 0)
        })
        .await
    }

    /// Active links whose tool is also active.
    pub async fn agent_tools(&self, agent_id: i64) -> Result<Vec<AgentToolLink>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT at.tool_id, at.configuration FROM agent_tools at
                 JOIN tools t ON t.id = at.tool_id
                 WHERE at.agent_id = ?1 AND at.is_active = 1 AND t.is_active = 1
                 ORDER BY at.id",
            )?;
            let rows = stmt
                .query_map(params![agent_id], |row| {
                    let tool_id: i64 = row.get(0)?;
                    let configuration: serde_json::Value = json_column(row, 1)?;
                    Ok((tool_id, configuration))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut links = Vec::with_capacity(rows.len());
            for (tool_id, configuration) in rows {
                if let Some(tool) = query_tool(conn, tool_id)? {
                    links.push(AgentToolLink {
                        tool,
                        configuration,
                    });
                }
            }
            Ok(links)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::seed_user;
    use crate::store::{NewTool, Role};

    #[tokio::test]
    async fn agent_crud_roundtrip() {
        let db = Database::open_in_memory().await.unwrap();
        let owner = seed_user(&db, "owner", Role::User).await;

        let mut new = NewAgent::named("helper");
        new.system_prompt = Some("Be brief.".into());
        let agent = db.create_agent(owner, new).await.unwrap();
        assert_eq!(agent.model_name, "gpt-3.5-turbo");
        assert_eq!(agent.max_tokens, 1000);
        assert!(agent.is_active);

        let updated = db
            .update_agent(
                agent.id,
                AgentUpdate {
                    is_active: Some(false),
                    temperature: Some(0.2),
                    ..Default::default()
                },
                validate_agent_settings,
            )
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!updated.is_active);
        assert_eq!(updated.temperature, 0.2);

        let rejected = db
            .update_agent(
                agent.id,
                AgentUpdate {
                    temperature: Some(3.5),
                    ..Default::default()
                },
                validate_agent_settings,
            )
            .await
            .unwrap()
            .unwrap();
        assert!(rejected.is_err());
        assert_eq!(db.get_agent(agent.id).await.unwrap().unwrap().temperature, 0.2);

        assert_eq!(db.list_agents(Some(owner), 0, 10).await.unwrap().len(), 1);
        assert_eq!(db.list_agents(Some(owner + 1), 0, 10).await.unwrap().len(), 0);
        assert!(db.delete_agent(agent.id).await.unwrap());
        assert!(!db.delete_agent(agent.id).await.unwrap());
    }

    #[tokio::test]
    async fn agent_tools_skip_inactive_tools() {
        let db = Database::open_in_memory().await.unwrap();
        let owner = seed_user(&db, "owner", Role::User).await;
        let agent = db.create_agent(owner, NewAgent::named("a")).await.unwrap();
        let search = db
            .create_tool(Some(owner), NewTool::named("search"))
            .await
            .unwrap();
        let mut disabled = NewTool::named("disabled");
        disabled.is_active = false;
        let disabled = db.create_tool(Some(owner), disabled).await.unwrap();

        db.link_agent_tool(agent.id, search.id, serde_json::json!({"max_results": 3}))
            .await
            .unwrap();
        db.link_agent_tool(agent.id, disabled.id, serde_json::json!({}))
            .await
            .unwrap();

        let links = db.agent_tools(agent.id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].tool.name, "search");
        assert_eq!(links[0].configuration["max_results"], 3);
    }
}
