// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session token issuing and verification (HS256 JWT).

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ipcsim_core::{Permission, PermissionTable};

/// Default token lifetime.
pub const TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    /// Role the token grants.
    pub role: String,
    /// Caller-chosen user id.
    pub user_id: String,
    /// Permission record of the role at issue time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permission>,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
}

/// Why authentication failed. Messages are sent to clients verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The requested role does not exist.
    #[error("Rol no válido")]
    UnknownRole,
    /// Signature, format or expiry check failed.
    #[error("Token inválido o expirado")]
    InvalidToken,
    /// The token was issued for another role.
    #[error("El rol no coincide con el token")]
    RoleMismatch,
    /// A token could not be signed.
    #[error("token encoding failed: {0}")]
    Encoding(String),
}

/// An authenticated session identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    /// Verified role.
    pub role: String,
    /// User id from the token.
    pub user_id: String,
    /// Current permission record of the role.
    pub permission: Permission,
}

/// Issues and verifies session tokens with a shared secret.
#[derive(Clone)]
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("secret", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl TokenAuthority {
    /// Create an authority for `secret`.
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            ttl: TOKEN_TTL,
        }
    }

    /// Override the token lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sign a token for `role`.
    pub fn issue(
        &self,
        role: &str,
        user_id: &str,
        permission: Option<&Permission>,
    ) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            role: role.to_string(),
            user_id: user_id.to_string(),
            permissions: permission.cloned(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
        };
        self.sign(&claims)
    }

    /// Sign arbitrary claims.
    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AuthError::Encoding(e.to_string()))
    }

    /// Verify signature and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token rejected");
                AuthError::InvalidToken
            })
    }

    /// Authenticate a client claiming `role` with `token`.
    pub fn authenticate(
        &self,
        role: &str,
        token: &str,
        table: &PermissionTable,
    ) -> Result<Identity, AuthError> {
        let permission = table.get(role).ok_or(AuthError::UnknownRole)?;
        let claims = self.verify(token)?;
        if claims.role != role {
            return Err(AuthError::RoleMismatch);
        }
        Ok(Identity {
            role: claims.role,
            user_id: claims.user_id,
            permission: permission.clone(),
        })
    }
}
