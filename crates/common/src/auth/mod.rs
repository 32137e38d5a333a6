//! Authentication utilities
//!
//! Provides:
//! - Login request validation
//! - Argon2 password verification against configured accounts
//! - PHC hash generation for operators and tests

use crate::config::AuthConfig;
use crate::errors::{AppError, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use std::collections::HashMap;
use validator::Validate;

/// Verified identity returned by a successful login
pub type UserId = String;

/// Hash verified when the username is unknown so response timing does not
/// reveal which accounts exist.
const DUMMY_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$c29tZXNhbHRzb21lc2FsdA$Q5bGBwqIhWGkFJW3YxWN4RcHyJbWSHbK6cu6B7iIw3o";

/// Login credentials as received from the client
#[derive(Debug, Clone, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, max = 64))]
    pub username: String,

    #[validate(length(min = 1, max = 256))]
    pub password: String,
}

impl LoginRequest {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Validate field lengths, mapping failures to an auth error
    pub fn check(&self) -> Result<()> {
        self.validate().map_err(|e| {
            tracing::debug!(error = %e, "Login request failed validation");
            AppError::InvalidCredentials
        })
    }
}

/// Source of truth for user credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Returns the user id when the credentials match, `None` otherwise
    async fn verify(&self, username: &str, password: &str) -> Result<Option<UserId>>;
}

/// Credential store backed by argon2 hashes from configuration
pub struct ConfiguredCredentials {
    users: HashMap<String, String>,
}

impl ConfiguredCredentials {
    pub fn from_config(config: &AuthConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|u| (u.username.clone(), u.password_hash.clone()))
            .collect();
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl CredentialStore for ConfiguredCredentials {
    async fn verify(&self, username: &str, password: &str) -> Result<Option<UserId>> {
        let stored = self.users.get(username);
        let hash = stored.cloned().unwrap_or_else(|| DUMMY_HASH.to_string());
        let password = password.to_string();

        // Argon2 is deliberately slow; keep it off the async workers
        let matches = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| AppError::Internal {
                message: format!("password verification task failed: {}", e),
            })?;

        Ok(match (stored, matches) {
            (Some(_), true) => Some(username.to_string()),
            _ => None,
        })
    }
}

/// Verify a password against a PHC string; malformed hashes never match
pub fn verify_password(password: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Stored password hash is not a valid PHC string");
            false
        }
    }
}

/// Produce an argon2id PHC string for a password
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AppError::Internal {
            message: format!("Failed to hash password: {}", e),
        })
}
