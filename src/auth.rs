//! Bearer-token identity extraction.
//!
//! Token issuance lives outside this service; we only map a presented credential to a
//! verified user id and trust that id from then on.

use actix_web::dev::Payload;
use actix_web::http::header::AUTHORIZATION;
use actix_web::http::StatusCode;
use actix_web::{web, FromRequest, HttpRequest, HttpResponse, ResponseError};
use futures_util::future::{ready, Ready};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;

use crate::error::ConfigError;
use crate::models::UserId;

pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<UserId>;
}

/// Fixed token table, parsed from `token=user_id` pairs.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenVerifier {
    pub fn parse(table: &str) -> Result<Self, ConfigError> {
        let mut tokens = HashMap::new();
        for entry in table.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (token, user) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedToken(entry.to_string()))?;
            let user = user
                .trim()
                .parse::<i64>()
                .map_err(|_| ConfigError::MalformedToken(entry.to_string()))?;
            let token = token.trim();
            if token.is_empty() {
                return Err(ConfigError::MalformedToken(entry.to_string()));
            }
            tokens.insert(token.to_string(), UserId(user));
        }
        Ok(Self { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Option<UserId> {
        self.tokens.get(token).copied()
    }
}

#[derive(Debug)]
pub struct Unauthorized;

impl fmt::Display for Unauthorized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Could not validate credentials")
    }
}

impl ResponseError for Unauthorized {
    fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::Unauthorized()
            .insert_header(("WWW-Authenticate", "Bearer"))
            .json(json!({ "detail": self.to_string() }))
    }
}

/// Extractor resolving `Authorization: Bearer <token>` through the registered
/// [`IdentityVerifier`].
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser(pub UserId);

impl FromRequest for AuthenticatedUser {
    type Error = Unauthorized;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(authenticate(req))
    }
}

fn authenticate(req: &HttpRequest) -> Result<AuthenticatedUser, Unauthorized> {
    let verifier = req
        .app_data::<web::Data<dyn IdentityVerifier>>()
        .ok_or(Unauthorized)?;
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(Unauthorized)?;

    match verifier.verify(token) {
        Some(user) => Ok(AuthenticatedUser(user)),
        None => {
            tracing::warn!("rejected unknown bearer token");
            Err(Unauthorized)
        }
    }
}
