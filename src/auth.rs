#![forbid(unsafe_code)]

//! Bearer-token authentication.
//!
//! The pipeline only needs "token in, user id out"; `Authenticator` is that
//! seam. `JwtAuthenticator` is the HS256 implementation the backend wires in.

use axum::http::{HeaderMap, header};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};

pub const TOKEN_ISSUER: &str = "tubely-access";

pub trait Authenticator: Send + Sync {
    /// Exchanges a bearer token for the id of the user it was issued to.
    fn validate(&self, token: &str) -> IngestResult<Uuid>;
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    iss: String,
    sub: String,
    iat: i64,
    exp: i64,
}

pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.validate_exp = true;
        validation.leeway = 0;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn validate(&self, token: &str) -> IngestResult<Uuid> {
        let data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation).map_err(
            |err| {
                tracing::debug!(error = %err, "JWT validation failed");
                match err.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                        IngestError::Unauthenticated("token has expired".into())
                    }
                    jsonwebtoken::errors::ErrorKind::InvalidIssuer => {
                        IngestError::Unauthenticated("invalid token issuer".into())
                    }
                    _ => IngestError::Unauthenticated(format!("invalid token: {err}")),
                }
            },
        )?;

        Uuid::parse_str(&data.claims.sub)
            .map_err(|err| IngestError::Unauthenticated(format!("invalid token subject: {err}")))
    }
}

/// Signs an access token for `user_id`, valid for `expires_in`.
pub fn issue_access_token(user_id: Uuid, secret: &str, expires_in: Duration) -> IngestResult<String> {
    let now = Utc::now();
    let claims = AccessClaims {
        iss: TOKEN_ISSUER.to_string(),
        sub: user_id.to_string(),
        iat: now.timestamp(),
        exp: (now + expires_in).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|err| IngestError::ServerError(format!("signing token: {err}")))
}

/// Pulls the token out of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> IngestResult<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| IngestError::Unauthenticated("authorization header missing".into()))?;
    let value = value
        .to_str()
        .map_err(|_| IngestError::Unauthenticated("authorization header is not ASCII".into()))?;
    let (scheme, token) = value
        .trim()
        .split_once(' ')
        .ok_or_else(|| IngestError::Unauthenticated("malformed authorization header".into()))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(IngestError::Unauthenticated(format!(
            "unsupported authorization scheme {scheme}"
        )));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(IngestError::Unauthenticated("empty bearer token".into()));
    }
    Ok(token)
}
