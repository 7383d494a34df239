//! User registration, login and JWT auth.
//!
//! - Clients register at `/api/auth/register` (the first account becomes admin)
//! - `/api/auth/login` exchanges username/email + password for a JWT
//! - Protected endpoints require `Authorization: Bearer <jwt>`; the token's
//!   subject is the user id and the user must still be active
//! - With `DEV_MODE=true` every request acts as the dev admin account

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use sha2::Sha256;

use super::routes::AppState;
use super::types::{internal_error, LoginRequest, LoginResponse, RegisterRequest};
use crate::store::{NewUser, Role, User};

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LENGTH: usize = 16;
const HASH_LENGTH: usize = 32;

/// The authenticated caller, inserted as a request extension.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: i64,
    pub username: String,
    pub role: Role,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins may act on anything; others only on what they own.
    pub fn can_modify(&self, owner_id: Option<i64>) -> bool {
        self.is_admin() || owner_id == Some(self.id)
    }

    /// Viewers are read-only.
    pub fn require_writer(&self) -> Result<(), (StatusCode, String)> {
        if self.role == Role::Viewer {
            Err(super::types::forbidden())
        } else {
            Ok(())
        }
    }

    pub fn require_admin(&self) -> Result<(), (StatusCode, String)> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(super::types::forbidden())
        }
    }
}

impl From<&User> for AuthUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            role: user.role,
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Claims {
    /// User id
    sub: String,
    role: Role,
    /// Issued-at unix seconds
    iat: i64,
    /// Expiration unix seconds
    exp: i64,
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a.len() {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

/// Hash a password as `pbkdf2:iterations:hex_salt:hex_hash`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut hash = [0u8; HASH_LENGTH];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut hash);
    format!(
        "pbkdf2:{}:{}:{}",
        PBKDF2_ITERATIONS,
        hex::encode(salt),
        hex::encode(hash)
    )
}

/// Check `password` against a stored hash. Malformed hashes never verify.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split(':').collect();
    let [scheme, iterations, salt, expected] = parts.as_slice() else {
        return false;
    };
    if *scheme != "pbkdf2" {
        return false;
    }
    let (Ok(iterations), Ok(salt), Ok(expected)) = (
        iterations.parse::<u32>(),
        hex::decode(salt),
        hex::decode(expected),
    ) else {
        return false;
    };
    if iterations == 0 || expected.is_empty() {
        return false;
    }
    let mut hash = vec![0u8; expected.len()];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut hash);
    constant_time_eq(&hash, &expected)
}

fn issue_jwt(secret: &str, user: &User, ttl_minutes: i64) -> anyhow::Result<(String, i64)> {
    let now = Utc::now();
    let exp = now + Duration::minutes(ttl_minutes.max(1));
    let claims = Claims {
        sub: user.id.to_string(),
        role: user.role,
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };
    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok((token, claims.exp))
}

fn verify_jwt(token: &str, secret: &str) -> anyhow::Result<Claims> {
    let token_data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<User>, (StatusCode, String)> {
    let username = req.username.trim();
    let email = req.email.trim();
    if username.is_empty() || !email.contains('@') {
        return Err((
            StatusCode::BAD_REQUEST,
            "A username and a valid email are required".to_string(),
        ));
    }
    if req.password.len() < 8 {
        return Err((
            StatusCode::BAD_REQUEST,
            "Password must be at least 8 characters".to_string(),
        ));
    }

    let role = if state.db.count_users().await.map_err(internal_error)? == 0 {
        Role::Admin
    } else {
        Role::User
    };
    let user = state
        .db
        .create_user(NewUser {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: hash_password(&req.password),
            full_name: req.full_name,
            role,
        })
        .await
        .map_err(|e| {
            if e.is_constraint_violation() {
                (
                    StatusCode::BAD_REQUEST,
                    "Username or email already registered".to_string(),
                )
            } else {
                internal_error(e)
            }
        })?;

    tracing::info!("Registered user {} ({})", user.username, user.role.as_str());
    Ok(Json(user))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, String)> {
    let invalid = || {
        (
            StatusCode::UNAUTHORIZED,
            "Incorrect username or password".to_string(),
        )
    };
    let user = state
        .db
        .find_user_by_login(req.username.trim())
        .await
        .map_err(internal_error)?
        .ok_or_else(invalid)?;
    if !verify_password(&req.password, &user.password_hash) {
        return Err(invalid());
    }
    if !user.is_active {
        return Err((StatusCode::BAD_REQUEST, "Inactive user".to_string()));
    }

    let secret = state.config.auth.jwt_secret.as_deref().ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "JWT_SECRET not configured".to_string(),
        )
    })?;
    let (token, exp) = issue_jwt(secret, &user, state.config.auth.jwt_ttl_minutes)
        .map_err(internal_error)?;

    Ok(Json(LoginResponse {
        access_token: token,
        token_type: "bearer".to_string(),
        exp,
    }))
}

/// Resolve the caller and attach an [`AuthUser`] extension.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    // Dev mode => act as the dev admin.
    if state.config.dev_mode {
        if let Some(dev) = state.dev_user.clone() {
            req.extensions_mut().insert(dev);
            return next.run(req).await;
        }
    }

    // If auth isn't configured, fail closed in non-dev mode.
    let secret = match state.config.auth.jwt_secret.as_deref() {
        Some(s) => s,
        None => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "JWT_SECRET not configured",
            )
                .into_response();
        }
    };

    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    let token = auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .unwrap_or("");
    if token.is_empty() {
        return (StatusCode::UNAUTHORIZED, "Missing Authorization header").into_response();
    }

    let claims = match verify_jwt(token, secret) {
        Ok(claims) => claims,
        Err(_) => return (StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response(),
    };
    let Ok(user_id) = claims.sub.parse::<i64>() else {
        return (StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response();
    };

    let user = match state.db.get_user(user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "User no longer exists").into_response(),
        Err(e) => return internal_error(e).into_response(),
    };
    if !user.is_active {
        return (StatusCode::UNAUTHORIZED, "Inactive user").into_response();
    }

    req.extensions_mut().insert(AuthUser::from(&user));
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_roundtrip() {
        let stored = hash_password("correct horse");
        assert!(stored.starts_with("pbkdf2:100000:"));
        assert!(verify_password("correct horse", &stored));
        assert!(!verify_password("wrong horse", &stored));
    }

    #[test]
    fn malformed_hashes_never_verify() {
        assert!(!verify_password("x", ""));
        assert!(!verify_password("x", "bcrypt:1:00:00"));
        assert!(!verify_password("x", "pbkdf2:abc:00:00"));
        assert!(!verify_password("x", "pbkdf2:1:zz:00"));
    }

    #[test]
    fn jwt_carries_user_id_and_role() {
        let user = User {
            id: 7,
            username: "u".into(),
            email: "u@example.com".into(),
            password_hash: String::new(),
            full_name: None,
            role: Role::Viewer,
            is_active: true,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let (token, exp) = issue_jwt("secret", &user, 30).unwrap();
        let claims = verify_jwt(&token, "secret").unwrap();
        assert_eq!(claims.sub, "7");
        assert_eq!(claims.role, Role::Viewer);
        assert_eq!(claims.exp, exp);
        assert!(verify_jwt(&token, "other-secret").is_err());
    }

    #[test]
    fn ownership_rules() {
        let admin = AuthUser {
            id: 1,
            username: "a".into(),
            role: Role::Admin,
        };
        let user = AuthUser {
            id: 2,
            username: "b".into(),
            role: Role::User,
        };
        assert!(admin.can_modify(Some(2)));
        assert!(admin.can_modify(None));
        assert!(user.can_modify(Some(2)));
        assert!(!user.can_modify(Some(1)));
        assert!(!user.can_modify(None));
    }
}
