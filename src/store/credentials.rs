use rusqlite::{params, OptionalExtension};

use super::{Database, StoreError};
use crate::util::now_string;

#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub name: String,
    pub encrypted_data: String,
    pub created_at: String,
}

impl Database {
    /// Replace the credential `(user_id, name)`.
    ///
    /// Delete and insert run in one transaction, so a concurrent reader sees
    /// either the old row or the new one.
    pub async fn replace_credential(
        &self,
        user_id: i64,
        name: &str,
        encrypted_data: String,
    ) -> Result<(), StoreError> {
        let name = name.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM encrypted_credentials WHERE user_id = ?1 AND name = ?2",
                params![user_id, name],
            )?;
            tx.execute(
                "INSERT INTO encrypted_credentials (user_id, name, encrypted_data, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, name, encrypted_data, now_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_credential(
        &self,
        user_id: i64,
        name: &str,
    ) -> Result<Option<CredentialRow>, StoreError> {
        let name = name.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT name, encrypted_data, created_at FROM encrypted_credentials
                     WHERE user_id = ?1 AND name = ?2",
                    params![user_id, name],
                    |row| {
                        Ok(CredentialRow {
                            name: row.get(0)?,
                            encrypted_data: row.get(1)?,
                            created_at: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    pub async fn list_credential_names(&self, user_id: i64) -> Result<Vec<String>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM encrypted_credentials WHERE user_id = ?1 ORDER BY name",
            )?;
            let names = stmt
                .query_map(params![user_id], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }

    pub async fn delete_credential(&self, user_id: i64, name: &str) -> Result<bool, StoreError> {
        let name = name.to_string();
        self.call(move |conn| {
            Ok(conn.execute(
                "DELETE FROM encrypted_credentials WHERE user_id = ?1 AND name = ?2",
                params![user_id, name],
            )? > 0)
        })
        .await
    }
}
