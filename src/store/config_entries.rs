use async_trait::async_trait;
use rusqlite::{params, Row};

use super::{Database, StoreError};
use crate::util::now_string;

/// A persisted configuration row. `value` is ciphertext when `is_encrypted`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigRow {
    pub key: String,
    pub value: Option<String>,
    pub description: Option<String>,
    pub is_encrypted: bool,
    pub updated_at: String,
}

/// Backing store for the configuration cache.
#[async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn load_all(&self) -> Result<Vec<ConfigRow>, StoreError>;

    /// Insert or update `key`. A `None` description keeps the existing one.
    async fn upsert(
        &self,
        key: &str,
        value: &str,
        description: Option<&str>,
        is_encrypted: bool,
    ) -> Result<(), StoreError>;

    /// Remove `key`, returning whether a row existed.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;
}

fn config_from_row(row: &Row<'_>) -> rusqlite::Result<ConfigRow> {
    Ok(ConfigRow {
        key: row.get(0)?,
        value: row.get(1)?,
        description: row.get(2)?,
        is_encrypted: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

#[async_trait]
impl ConfigRepository for Database {
    async fn load_all(&self) -> Result<Vec<ConfigRow>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value, description, is_encrypted, updated_at
                 FROM system_config ORDER BY key",
            )?;
            let rows = stmt
                .query_map([], config_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn upsert(
        &self,
        key: &str,
        value: &str,
        description: Option<&str>,
        is_encrypted: bool,
    ) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        let description = description.map(str::to_string);
        self.call(move |conn| {
            let now = now_string();
            conn.execute(
                "INSERT INTO system_config (key, value, description, is_encrypted, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    description = COALESCE(excluded.description, system_config.description),
                    is_encrypted = excluded.is_encrypted,
                    updated_at = excluded.updated_at",
                params![key, value, description, is_encrypted, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.call(move |conn| {
            Ok(conn.execute("DELETE FROM system_config WHERE key = ?1", params![key])? > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_keeps_description_when_omitted() {
        let db = Database::open_in_memory().await.unwrap();
        db.upsert("feature.x", "1", Some("toggle"), false)
            .await
            .unwrap();
        db.upsert("feature.x", "2", None, false).await.unwrap();

        let rows = db.load_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value.as_deref(), Some("2"));
        assert_eq!(rows[0].description.as_deref(), Some("toggle"));

        assert!(db.remove("feature.x").await.unwrap());
        assert!(!db.remove("feature.x").await.unwrap());
    }
}
