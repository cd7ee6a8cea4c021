//! HS256 access and refresh tokens.
//!
//! Both token classes share one claim envelope. `mfa` is a scalar scope copied forward on refresh;
//! only the 2FA unlock flow mints `mfa = 1`. `iat` is carried with sub-second precision so a token
//! minted right after a password change is not mistaken for a stale one.

use crate::domain::UserRole;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;
pub const REFRESH_TOKEN_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub role: String,
    #[serde(rename = "type")]
    pub token_type: String,
    #[serde(default)]
    pub mfa: u8,
    /// Seconds since the epoch, fractional.
    pub iat: f64,
    pub exp: i64,
}

impl Claims {
    #[must_use]
    pub fn role(&self) -> UserRole {
        UserRole::from_claim(&self.role)
    }

    #[must_use]
    pub fn mfa_unlocked(&self) -> bool {
        self.mfa == 1
    }

    /// A token is stale once the password changed after it was issued.
    #[must_use]
    pub fn issued_before(&self, changed_at: Option<DateTime<Utc>>) -> bool {
        changed_at.is_some_and(|changed| epoch_seconds(changed) > self.iat)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token")]
    Invalid,
    #[error("unexpected token type")]
    WrongType,
    #[error("sign token failed: {0}")]
    Sign(String),
}

/// Mints and verifies tokens with a shared HMAC secret.
pub struct TokenSigner {
    secret: SecretString,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            access_ttl: Duration::seconds(ACCESS_TOKEN_TTL_SECONDS),
            refresh_ttl: Duration::seconds(REFRESH_TOKEN_TTL_SECONDS),
        }
    }

    #[must_use]
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl.num_seconds()
    }

    /// # Errors
    /// Returns [`TokenError::Sign`] when encoding fails.
    pub fn issue(
        &self,
        user_id: i64,
        role: UserRole,
        kind: TokenKind,
        mfa: u8,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            user_id,
            role: role.as_str().to_string(),
            token_type: kind.as_str().to_string(),
            mfa: mfa.min(1),
            iat: epoch_seconds(now),
            exp: (now + ttl).timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.expose_secret().as_bytes()),
        )
        .map_err(|e| TokenError::Sign(e.to_string()))
    }

    /// Access and refresh tokens sharing the same scope.
    ///
    /// # Errors
    /// Returns [`TokenError::Sign`] when encoding fails.
    pub fn issue_pair(&self, user_id: i64, role: UserRole, mfa: u8) -> Result<TokenPair, TokenError> {
        let now = Utc::now();
        Ok(TokenPair {
            access_token: self.issue(user_id, role, TokenKind::Access, mfa, now)?,
            refresh_token: self.issue(user_id, role, TokenKind::Refresh, mfa, now)?,
            expires_in: self.access_ttl_seconds(),
        })
    }

    /// Verifies signature and expiry, then the `type` claim.
    ///
    /// # Errors
    /// Returns [`TokenError::Invalid`] for bad signatures, malformed or expired tokens and
    /// [`TokenError::WrongType`] when the token class does not match.
    pub fn parse(&self, raw: &str, expected: TokenKind) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = decode::<Claims>(
            raw.trim(),
            &DecodingKey::from_secret(self.secret.expose_secret().as_bytes()),
            &validation,
        )
        .map_err(|_| TokenError::Invalid)?;
        if data.claims.token_type != expected.as_str() {
            return Err(TokenError::WrongType);
        }
        Ok(data.claims)
    }
}

#[allow(clippy::cast_precision_loss)]
fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}
