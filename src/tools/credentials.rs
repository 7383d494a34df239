//! Per-user credential bundles, encrypted at rest.

use base64::Engine;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

use crate::crypto::Cipher;
use crate::error::ServiceResult;
use crate::store::Database;

#[derive(Clone)]
pub struct CredentialVault {
    db: Database,
    cipher: Cipher,
}

impl CredentialVault {
    pub fn new(db: Database, cipher: Cipher) -> Self {
        Self { db, cipher }
    }

    /// Encrypt and store `data`, replacing any bundle with the same name.
    pub async fn store(&self, user_id: i64, name: &str, data: &Value) -> ServiceResult<()> {
        let encrypted = self.cipher.encrypt(&data.to_string())?;
        self.db.replace_credential(user_id, name, encrypted).await?;
        Ok(())
    }

    /// Decrypted bundle, or `None` if it is missing or unreadable.
    pub async fn load(&self, user_id: i64, name: &str) -> ServiceResult<Option<Value>> {
        let Some(row) = self.db.get_credential(user_id, name).await? else {
            return Ok(None);
        };
        let plaintext = match self.cipher.decrypt(&row.encrypted_data) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!("Failed to decrypt credential {} for user {}: {}", name, user_id, e);
                return Ok(None);
            }
        };
        match serde_json::from_str(&plaintext) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Credential {} for user {} is not valid JSON: {}", name, user_id, e);
                Ok(None)
            }
        }
    }

    pub async fn list(&self, user_id: i64) -> ServiceResult<Vec<String>> {
        Ok(self.db.list_credential_names(user_id).await?)
    }

    pub async fn delete(&self, user_id: i64, name: &str) -> ServiceResult<bool> {
        Ok(self.db.delete_credential(user_id, name).await?)
    }
}

/// How a decrypted bundle authenticates a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    Bearer(String),
    ApiKey { header: String, key: String },
    Basic { username: String, password: String },
}

impl AuthScheme {
    /// Interpret a bundle such as `{"type": "api_key", "api_key": "..."}`.
    ///
    /// `type` defaults to `bearer`. Unknown types and bundles missing their
    /// secret yield `None`.
    pub fn from_bundle(bundle: &Value) -> Option<Self> {
        let field = |name: &str| bundle.get(name).and_then(Value::as_str).map(str::to_string);
        match bundle.get("type").and_then(Value::as_str).unwrap_or("bearer") {
            "bearer" => field("token").map(AuthScheme::Bearer),
            "api_key" => Some(AuthScheme::ApiKey {
                header: field("key_name").unwrap_or_else(|| "X-API-Key".to_string()),
                key: field("api_key")?,
            }),
            "basic" => Some(AuthScheme::Basic {
                username: field("username")?,
                password: field("password").unwrap_or_default(),
            }),
            _ => None,
        }
    }

    pub fn apply(&self, headers: &mut BTreeMap<String, String>) {
        let (name, value) = match self {
            AuthScheme::Bearer(token) => ("Authorization".to_string(), format!("Bearer {}", token)),
            AuthScheme::ApiKey { header, key } => (header.clone(), key.clone()),
            AuthScheme::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                ("Authorization".to_string(), format!("Basic {}", encoded))
            }
        };
        headers.retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::seed_user;
    use crate::store::Role;
    use serde_json::json;

    async fn vault() -> (CredentialVault, Database, i64) {
        let db = Database::open_in_memory().await.unwrap();
        let user = seed_user(&db, "owner", Role::User).await;
        (CredentialVault::new(db.clone(), Cipher::generate()), db, user)
    }

    #[tokio::test]
    async fn store_and_load_roundtrip() {
        let (vault, db, user) = vault().await;
        let bundle = json!({"type": "bearer", "token": "sk-live-1"});
        vault.store(user, "github", &bundle).await.unwrap();

        let row = db.get_credential(user, "github").await.unwrap().unwrap();
        assert!(!row.encrypted_data.contains("sk-live-1"));
        assert_eq!(vault.load(user, "github").await.unwrap(), Some(bundle));
    }

    #[tokio::test]
    async fn store_replaces_existing_bundle() {
        let (vault, _, user) = vault().await;
        vault.store(user, "api", &json!({"token": "old"})).await.unwrap();
        vault.store(user, "api", &json!({"token": "new"})).await.unwrap();
        assert_eq!(vault.list(user).await.unwrap(), vec!["api"]);
        assert_eq!(
            vault.load(user, "api").await.unwrap(),
            Some(json!({"token": "new"}))
        );
    }

    #[tokio::test]
    async fn missing_or_undecryptable_bundles_load_as_none() {
        let (vault, db, user) = vault().await;
        assert_eq!(vault.load(user, "nothing").await.unwrap(), None);

        let foreign = Cipher::generate().encrypt("{\"token\":\"x\"}").unwrap();
        db.replace_credential(user, "foreign", foreign).await.unwrap();
        assert_eq!(vault.load(user, "foreign").await.unwrap(), None);
    }

    #[test]
    fn bundle_parsing() {
        assert_eq!(
            AuthScheme::from_bundle(&json!({"token": "t"})),
            Some(AuthScheme::Bearer("t".into()))
        );
        assert_eq!(
            AuthScheme::from_bundle(&json!({"type": "api_key", "api_key": "k"})),
            Some(AuthScheme::ApiKey {
                header: "X-API-Key".into(),
                key: "k".into()
            })
        );
        assert_eq!(
            AuthScheme::from_bundle(&json!({"type": "api_key", "key_name": "X-Token", "api_key": "k"})),
            Some(AuthScheme::ApiKey {
                header: "X-Token".into(),
                key: "k".into()
            })
        );
        assert_eq!(AuthScheme::from_bundle(&json!({"type": "oauth"})), None);
        assert_eq!(AuthScheme::from_bundle(&json!({"type": "bearer"})), None);
    }

    #[test]
    fn basic_auth_header() {
        let mut headers = BTreeMap::new();
        headers.insert("authorization".to_string(), "stale".to_string());
        AuthScheme::Basic {
            username: "user".into(),
            password: "pass".into(),
        }
        .apply(&mut headers);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["Authorization"], "Basic dXNlcjpwYXNz");
    }
}
