//! Authentication
//!
//! Credential extraction from request headers, bearer-token issue and
//! verification (HS256), password hashing and the credential resolver that
//! turns presented credentials into an [`Identity`].
//!
//! Resolution order: an API key, when presented, decides the outcome on its
//! own and any bearer token is ignored. Otherwise the bearer token is
//! verified. With neither, the caller is anonymous.

use crate::error::GatewayError;
use crate::model::{CredentialSource, Identity, User};
use crate::pipeline::Stage;
use crate::store::{ApiKeyStore, StoreResult, UserStore};
use axum::http::{header, HeaderMap};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Header carrying an API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Length of generated API key values
pub const API_KEY_LENGTH: usize = 32;

/// Bearer token claims
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (username)
    pub sub: String,
    /// Expiration time
    pub exp: i64,
    /// Issued at
    pub iat: i64,
}

/// Issue a signed bearer token for `username`
pub fn issue_token(
    username: &str,
    secret: &str,
    expire_minutes: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = Claims {
        sub: username.to_string(),
        exp: (now + Duration::minutes(expire_minutes)).timestamp(),
        iat: now.timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Verify signature and expiry of a bearer token
pub fn verify_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    decode::<Claims>(token, &key, &validation).map(|data| data.claims)
}

pub fn hash_password(password: &str, cost: u32) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, cost)
}

/// Check a password against a stored hash; malformed hashes never match
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Generate a fresh random API key value
pub fn generate_api_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LENGTH)
        .map(char::from)
        .collect()
}

/// Credentials presented on a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub bearer: Option<String>,
    pub api_key: Option<String>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.bearer.is_none() && self.api_key.is_none()
    }
}

/// Extract a bearer token from an `Authorization` value; other schemes yield `None`
pub fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token)
    } else {
        None
    }
}

pub fn extract_credentials(headers: &HeaderMap) -> Credentials {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer_token)
        .map(str::to_string);

    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    Credentials { bearer, api_key }
}

/// Resolves presented credentials into an identity
#[derive(Clone)]
pub struct CredentialResolver {
    users: Arc<dyn UserStore>,
    keys: Arc<dyn ApiKeyStore>,
    secret: String,
}

impl CredentialResolver {
    pub fn new(users: Arc<dyn UserStore>, keys: Arc<dyn ApiKeyStore>, secret: String) -> Self {
        Self {
            users,
            keys,
            secret,
        }
    }

    /// Resolve credentials; rejections are 401s, store failures are errors
    pub async fn resolve(&self, credentials: &Credentials) -> StoreResult<Stage<Identity>> {
        if let Some(key) = &credentials.api_key {
            return self.resolve_api_key(key).await;
        }
        if let Some(token) = &credentials.bearer {
            return self.resolve_bearer(token).await;
        }
        Ok(Stage::Continue(Identity::Anonymous))
    }

    async fn resolve_api_key(&self, value: &str) -> StoreResult<Stage<Identity>> {
        let key = match self.keys.key_by_value(value).await? {
            Some(key) => key,
            None => return Ok(Stage::Reject(GatewayError::api_key("Invalid API key"))),
        };

        if !key.is_usable_at(Utc::now()) {
            let detail = if key.is_active {
                debug!(key_id = key.id, "Rejected expired API key");
                "API key has expired"
            } else {
                "Invalid API key"
            };
            return Ok(Stage::Reject(GatewayError::api_key(detail)));
        }

        match self.users.user_by_id(key.user_id).await? {
            Some(user) if user.is_active => Ok(Stage::Continue(Identity::Authenticated {
                user_id: user.id,
                role: user.role,
                source: CredentialSource::ApiKey {
                    key_id: key.id,
                    key: key.key,
                },
            })),
            Some(_) => Ok(Stage::Reject(GatewayError::api_key("Inactive user"))),
            None => Ok(Stage::Reject(GatewayError::api_key("Invalid API key"))),
        }
    }

    async fn resolve_bearer(&self, token: &str) -> StoreResult<Stage<Identity>> {
        let claims = match verify_token(token, &self.secret) {
            Ok(claims) => claims,
            Err(e) => {
                debug!("Token validation failed: {}", e);
                return Ok(Stage::Reject(GatewayError::bearer(
                    "Could not validate credentials",
                )));
            }
        };

        match self.users.user_by_username(&claims.sub).await? {
            Some(user) if user.is_active => Ok(Stage::Continue(Identity::Authenticated {
                user_id: user.id,
                role: user.role,
                source: CredentialSource::BearerToken,
            })),
            Some(_) => Ok(Stage::Reject(GatewayError::bearer("Inactive user"))),
            None => Ok(Stage::Reject(GatewayError::bearer(
                "Could not validate credentials",
            ))),
        }
    }

    /// Check a username/password pair; `None` on any mismatch
    pub async fn authenticate_password(
        &self,
        username: &str,
        password: &str,
    ) -> StoreResult<Option<User>> {
        let user = match self.users.user_by_username(username).await? {
            Some(user) => user,
            None => return Ok(None),
        };

        if !user.is_active || !verify_password(password, &user.password_hash) {
            return Ok(None);
        }
        Ok(Some(user))
    }
}
