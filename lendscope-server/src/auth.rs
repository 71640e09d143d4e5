//! Bearer-token authentication.
//!
//! Tokens are HS256 JWTs whose `sub` claim is the user id. The secret comes
//! from `JWT_SECRET_KEY`.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SECRET_ENV: &str = "JWT_SECRET_KEY";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("Token has no subject")]
    MissingSubject,

    #[error("JWT_SECRET_KEY is not set")]
    MissingSecret,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    iat: i64,
}

#[derive(Clone)]
pub struct Authenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn from_env() -> Result<Self, AuthError> {
        match std::env::var(SECRET_ENV) {
            Ok(secret) if !secret.is_empty() => Ok(Self::new(&secret)),
            _ => Err(AuthError::MissingSecret),
        }
    }

    /// User id from an `Authorization` header value. Accepts `Bearer <jwt>`
    /// or the bare token.
    pub fn subject(&self, header: Option<&str>) -> Result<String, AuthError> {
        let raw = header.map(str::trim).filter(|h| !h.is_empty()).ok_or(AuthError::MissingToken)?;
        let token = raw
            .strip_prefix("Bearer ")
            .or_else(|| raw.strip_prefix("bearer "))
            .unwrap_or(raw)
            .trim();

        let data = decode::<Claims>(token, &self.decoding, &self.validation)?;
        if data.claims.sub.trim().is_empty() {
            return Err(AuthError::MissingSubject);
        }
        Ok(data.claims.sub)
    }

    /// Sign a token for `user_id` valid for `ttl_minutes`.
    pub fn issue(&self, user_id: &str, ttl_minutes: i64) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now,
            exp: now + ttl_minutes * 60,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }
}
