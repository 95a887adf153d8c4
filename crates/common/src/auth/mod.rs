//! Authentication and authorization utilities
//!
//! Provides:
//! - API key validation against configured hashes
//! - JWT token generation and validation
//! - Actor context extraction for handlers

pub mod nonce;

use crate::config::AuthConfig;
use crate::errors::{AppError, Result};
use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

/// Prefix of generated API keys
pub const API_KEY_PREFIX: &str = "sb_";

/// Scope that implies every other scope
pub const ADMIN_SCOPE: &str = "admin";

/// Extracted authentication context available to handlers
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Stable identifier of the caller (JWT subject or API key fingerprint)
    pub actor_id: String,

    /// Scopes/permissions
    pub scopes: Vec<String>,

    /// Request ID for tracing
    pub request_id: String,
}

impl AuthContext {
    /// Check if the context has a specific scope
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == ADMIN_SCOPE)
    }

    /// Require a specific scope, returning error if not present
    pub fn require_scope(&self, scope: &str) -> Result<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(AppError::Forbidden {
                message: format!("Missing required scope: {}", scope),
            })
        }
    }
}

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (actor ID)
    pub sub: String,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// JWT token manager
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiration_secs: i64,
}

impl JwtManager {
    /// Create a new JWT manager with the given secret
    pub fn new(secret: &str, expiration_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiration_secs: expiration_secs as i64,
        }
    }

    /// Generate a new JWT token
    pub fn generate_token(&self, actor_id: &str, scopes: Vec<String>) -> Result<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.expiration_secs);

        let claims = JwtClaims {
            sub: actor_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            scopes,
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| AppError::Internal {
            message: format!("Failed to generate token: {}", e),
        })
    }

    /// Validate and decode a JWT token
    pub fn validate_token(&self, token: &str) -> Result<JwtClaims> {
        decode::<JwtClaims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AppError::ExpiredToken,
                _ => AppError::Unauthorized {
                    message: "Invalid token".to_string(),
                },
            })
    }
}

/// Hash an API key for storage
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Validate an API key against a stored hash
pub fn validate_api_key(api_key: &str, stored_hash: &str) -> bool {
    hash_api_key(api_key).eq_ignore_ascii_case(stored_hash)
}

/// Generate a new API key
pub fn generate_api_key() -> String {
    let random_bytes: [u8; 32] = rand::random();
    format!("{}{}", API_KEY_PREFIX, hex::encode(random_bytes))
}

/// Extract the credential from an Authorization header
pub fn extract_bearer(auth_header: &str) -> Option<&str> {
    auth_header.strip_prefix("Bearer ").map(str::trim)
}

/// Resolves credentials into actors
pub struct Authenticator {
    jwt: Option<JwtManager>,
    api_key_hashes: Vec<String>,
    request_id_header: String,
}

impl Authenticator {
    pub fn new(jwt: Option<JwtManager>, api_key_hashes: Vec<String>) -> Self {
        Self {
            jwt,
            api_key_hashes,
            request_id_header: "x-request-id".to_string(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        let jwt = config
            .jwt_secret
            .as_deref()
            .map(|secret| JwtManager::new(secret, config.jwt_expiration_secs));
        let mut authenticator = Self::new(jwt, config.api_key_hashes.clone());
        authenticator.request_id_header = config.request_id_header.to_ascii_lowercase();
        authenticator
    }

    /// Resolve a bearer credential into an actor id and scopes
    ///
    /// API keys act with full rights; JWTs carry their own scopes.
    pub fn authenticate(&self, credential: &str) -> Result<(String, Vec<String>)> {
        if credential.starts_with(API_KEY_PREFIX) {
            let hash = hash_api_key(credential);
            if self.api_key_hashes.iter().any(|h| h.eq_ignore_ascii_case(&hash)) {
                return Ok((format!("api-key:{}", &hash[..12]), vec![ADMIN_SCOPE.to_string()]));
            }
            return Err(AppError::InvalidApiKey);
        }

        let jwt = self.jwt.as_ref().ok_or_else(|| AppError::Unauthorized {
            message: "Token authentication is not configured".to_string(),
        })?;
        let claims = jwt.validate_token(credential)?;
        Ok((claims.sub, claims.scopes))
    }
}

/// Axum extractor for AuthContext
impl<S> FromRequestParts<S> for AuthContext
where
    Arc<Authenticator>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let authenticator = Arc::<Authenticator>::from_ref(state);

        // Extract request ID
        let request_id = parts
            .headers
            .get(authenticator.request_id_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized {
                message: "Missing Authorization header".to_string(),
            })?;

        let credential = extract_bearer(auth_header).ok_or_else(|| AppError::Unauthorized {
            message: "Expected a Bearer credential".to_string(),
        })?;

        let (actor_id, scopes) = authenticator.authenticate(credential)?;

        Ok(AuthContext {
            actor_id,
            scopes,
            request_id,
        })
    }
}
