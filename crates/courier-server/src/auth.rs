//! Handshake authentication.
//!
//! The bearer credential is looked up in order: `Authorization: Bearer`
//! header, `token` query parameter, `token` cookie. It must be an HS256 JWT
//! signed with the configured secret whose `id` (or `sub`) claim names an
//! existing user.

use std::time::Duration;

use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use courier_core::{UserId, UserRecord, UserStore};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use tracing::debug;

use crate::errors::AuthError;

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    sub: Option<String>,
}

/// Verifies handshake credentials.
#[derive(Clone)]
pub struct Authenticator {
    key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    /// Verifier for tokens signed with `secret`.
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Resolve the subject of `token`.
    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|error| {
            debug!(%error, "token rejected");
            AuthError::InvalidToken
        })?;
        data.claims
            .id
            .or(data.claims.sub)
            .filter(|id| !id.is_empty())
            .map(UserId::from)
            .ok_or(AuthError::InvalidToken)
    }

    /// Authenticate a handshake: extract, verify, and load the user.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
        users: &dyn UserStore,
        timeout: Duration,
    ) -> Result<UserRecord, AuthError> {
        let token = extract_token(headers, query_token).ok_or(AuthError::NoToken)?;
        let user_id = self.verify(&token)?;
        match tokio::time::timeout(timeout, users.find_by_id(&user_id)).await {
            Ok(Ok(Some(user))) => Ok(user),
            Ok(Ok(None)) => Err(AuthError::UserNotFound),
            Ok(Err(error)) => Err(AuthError::Unavailable(error.to_string())),
            Err(_) => Err(AuthError::Unavailable("user lookup timed out".into())),
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

/// First credential found in header, query or cookie.
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        });
    let from_cookie = || {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == "token").then_some(value)
            })
    };
    from_header
        .or(query_token)
        .or_else(from_cookie)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
}
