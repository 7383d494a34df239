use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{json_column, Database, StoreError};
use crate::util::now_string;

#[derive(Debug, Clone, Serialize)]
pub struct PromptTemplate {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub content: String,
    /// Placeholder names found in `content`, sorted.
    pub variables: Vec<String>,
    pub version: u32,
    pub is_active: bool,
    pub owner_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPromptTemplate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptTemplateUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub is_active: Option<bool>,
}

const TEMPLATE_COLUMNS: &str = "id, name, description, content, variables, version, is_active, \
     owner_id, created_at, updated_at";

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<PromptTemplate> {
    Ok(PromptTemplate {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        content: row.get(3)?,
        variables: json_column(row, 4)?,
        version: row.get(5)?,
        is_active: row.get(6)?,
        owner_id: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn query_template(conn: &Connection, id: i64) -> rusqlite::Result<Option<PromptTemplate>> {
    conn.query_row(
        &format!("SELECT {TEMPLATE_COLUMNS} FROM prompt_templates WHERE id = ?1"),
        params![id],
        template_from_row,
    )
    .optional()
}

fn insert_row(
    conn: &Connection,
    owner_id: i64,
    name: &str,
    description: Option<&str>,
    content: &str,
    variables: &str,
    version: u32,
) -> Result<PromptTemplate, StoreError> {
    conn.execute(
        "INSERT INTO prompt_templates (name, description, content, variables, version,
            is_active, owner_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?7)",
        params![name, description, content, variables, version, owner_id, now_string()],
    )?;
    let id = conn.last_insert_rowid();
    query_template(conn, id)?
        .ok_or_else(|| StoreError::Conflict(format!("template {id} vanished after insert")))
}

impl Database {
    pub async fn insert_template(
        &self,
        owner_id: i64,
        new: NewPromptTemplate,
        variables: Vec<String>,
    ) -> Result<PromptTemplate, StoreError> {
        let variables = serde_json::to_string(&variables)?;
        self.call(move |conn| {
            insert_row(
                conn,
                owner_id,
                &new.name,
                new.description.as_deref(),
                &new.content,
                &variables,
                1,
            )
        })
        .await
    }

    /// Insert `content` as the next version of the template family `name`.
    ///
    /// The version is `max(version) + 1` for that name; a missing
    /// description becomes `Version N of <name>`.
    pub async fn insert_next_version(
        &self,
        owner_id: i64,
        name: &str,
        description: Option<String>,
        content: String,
        variables: Vec<String>,
    ) -> Result<PromptTemplate, StoreError> {
        let name = name.to_string();
        let variables = serde_json::to_string(&variables)?;
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let current: Option<u32> = tx.query_row(
                "SELECT MAX(version) FROM prompt_templates WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?;
            let version = current.unwrap_or(0) + 1;
            let description =
                description.unwrap_or_else(|| format!("Version {} of {}", version, name));
            let template = insert_row(
                &tx,
                owner_id,
                &name,
                Some(&description),
                &content,
                &variables,
                version,
            )?;
            tx.commit()?;
            Ok(template)
        })
        .await
    }

    pub async fn get_template(&self, id: i64) -> Result<Option<PromptTemplate>, StoreError> {
        self.call(move |conn| Ok(query_template(conn, id)?)).await
    }

    /// Templates owned by `owner`, or all templates for `None`.
    pub async fn list_templates(
        &self,
        owner: Option<i64>,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<PromptTemplate>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TEMPLATE_COLUMNS} FROM prompt_templates
                 WHERE (?1 IS NULL OR owner_id = ?1)
                 ORDER BY name, version DESC LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(params![owner, limit, skip], template_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Persist every mutable field of `template`.
    pub async fn save_template(&self, template: PromptTemplate) -> Result<PromptTemplate, StoreError> {
        let variables = serde_json::to_string(&template.variables)?;
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE prompt_templates SET name = ?1, description = ?2, content = ?3,
                    variables = ?4, is_active = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    template.name,
                    template.description,
                    template.content,
                    variables,
                    template.is_active,
                    now_string(),
                    template.id
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::Conflict(format!(
                    "template {} no longer exists",
                    template.id
                )));
            }
            query_template(conn, template.id)?
                .ok_or_else(|| StoreError::Conflict(format!("template {} vanished", template.id)))
        })
        .await
    }

    pub async fn delete_template(&self, id: i64) -> Result<bool, StoreError> {
        self.call(move |conn| {
            Ok(conn.execute("DELETE FROM prompt_templates WHERE id = ?1", params![id])? > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::seed_user;
    use crate::store::Role;

    #[tokio::test]
    async fn versions_increment_per_name() {
        let db = Database::open_in_memory().await.unwrap();
        let owner = seed_user(&db, "u", Role::User).await;
        let v1 = db
            .insert_template(
                owner,
                NewPromptTemplate {
                    name: "greet".into(),
                    description: None,
                    content: "Hi {name}".into(),
                },
                vec!["name".into()],
            )
            .await
            .unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v1.variables, vec!["name"]);

        let v2 = db
            .insert_next_version(owner, "greet", None, "Hello {name}".into(), vec!["name".into()])
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.description.as_deref(), Some("Version 2 of greet"));

        let other = db
            .insert_next_version(owner, "fresh", Some("custom".into()), "x".into(), vec![])
            .await
            .unwrap();
        assert_eq!(other.version, 1);
        assert_eq!(other.description.as_deref(), Some("custom"));
    }
}
