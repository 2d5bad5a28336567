//! Authentication middleware
//!
//! Operator requests carry a JWT minted by the platform's identity service;
//! agent requests carry the Bearer token issued at registration. Heartbeats
//! are deliberately outside agent auth: unknown senders are logged and
//! dropped by the handler instead of erroring loudly.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::header::AUTHORIZATION,
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Device;
use crate::{AppError, AppState};

/// Operator JWT claims
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub org: String,
    pub role: String,
    pub exp: i64,
}

/// Operator context extracted from JWT
#[derive(Debug, Clone)]
pub struct OperatorContext {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub role: String,
}

/// Agent context extracted from the registration token
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub device_id: Uuid,
    pub org_id: Uuid,
}

/// Middleware: Require operator JWT authentication
pub async fn require_operator_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(&req)?;

    let token_data = decode::<Claims>(
        &token,
        &DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::TokenInvalid)?;

    let claims = token_data.claims;
    let operator_ctx = OperatorContext {
        user_id: Uuid::parse_str(&claims.sub).map_err(|_| AppError::TokenInvalid)?,
        org_id: Uuid::parse_str(&claims.org).map_err(|_| AppError::TokenInvalid)?,
        role: claims.role,
    };

    req.extensions_mut().insert(operator_ctx);

    Ok(next.run(req).await)
}

/// Middleware: Require agent token authentication
pub async fn require_agent_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(&req)?;
    let token_hash = hash_token(&token);

    let device = Device::find_by_token_hash(&state.pool, &token_hash)
        .await
        .map_err(|_| AppError::InternalError("Database error".to_string()))?
        .ok_or(AppError::Unauthorized)?;

    let agent_ctx = AgentContext {
        device_id: device.id,
        org_id: device.org_id,
    };

    req.extensions_mut().insert(agent_ctx);

    Ok(next.run(req).await)
}

/// Extract Bearer token from the Authorization header
fn extract_bearer_token(req: &Request) -> Result<String, AppError> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.to_string())
        .ok_or(AppError::Unauthorized)
}

/// SHA-256 hash of an agent token as stored in the database
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for OperatorContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<OperatorContext>()
            .cloned()
            .ok_or(AppError::Unauthorized)
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AgentContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AgentContext>()
            .cloned()
            .ok_or(AppError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_token_is_stable_hex() {
        let a = hash_token("some-agent-token");
        let b = hash_token("some-agent-token");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_different_tokens_hash_differently() {
        assert_ne!(hash_token("token-a"), hash_token("token-b"));
    }
}
