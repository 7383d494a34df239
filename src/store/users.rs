use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{Database, StoreError};
use crate::util::now_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::Viewer => "viewer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Role::Admin),
            "user" => Some(Role::User),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub full_name: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub full_name: Option<String>,
    pub role: Role,
}

const USER_COLUMNS: &str =
    "id, username, email, password_hash, full_name, role, is_active, created_at, updated_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let role: String = row.get(5)?;
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        full_name: row.get(4)?,
        role: Role::parse(&role).unwrap_or(Role::Viewer),
        is_active: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl Database {
    pub async fn create_user(&self, new: NewUser) -> Result<User, StoreError> {
        self.call(move |conn| {
            let now = now_string();
            conn.execute(
                "INSERT INTO users (username, email, password_hash, full_name, role, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
                params![
                    new.username,
                    new.email,
                    new.password_hash,
                    new.full_name,
                    new.role.as_str(),
                    now
                ],
            )?;
            let id = conn.last_insert_rowid();
            Ok(conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                user_from_row,
            )?)
        })
        .await
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                    params![id],
                    user_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// Look a user up by username or email.
    pub async fn find_user_by_login(&self, login: &str) -> Result<Option<User>, StoreError> {
        let login = login.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {USER_COLUMNS} FROM users WHERE username = ?1 OR email = ?1 LIMIT 1"
                    ),
                    params![login],
                    user_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn count_users(&self) -> Result<u64, StoreError> {
        self.call(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_find_user() {
        let db = Database::open_in_memory().await.unwrap();
        let user = db
            .create_user(NewUser {
                username: "alice".into(),
                email: "alice@example.com".into(),
                password_hash: "hash".into(),
                full_name: Some("Alice".into()),
                role: Role::Admin,
            })
            .await
            .unwrap();
        assert!(user.is_active);
        assert_eq!(user.role, Role::Admin);

        let by_email = db
            .find_user_by_login("alice@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_email.id, user.id);
        assert!(db.find_user_by_login("bob").await.unwrap().is_none());
        assert_eq!(db.count_users().await.unwrap(), 1);
    }

    #[test]
    fn password_hash_is_never_serialized() {
        let user = User {
            id: 1,
            username: "a".into(),
            email: "a@x".into(),
            password_hash: "secret-hash".into(),
            full_name: None,
            role: Role::User,
            is_active: true,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret-hash"));
        assert!(json.contains("\"role\":\"user\""));
    }
}
