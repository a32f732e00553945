//! Bearer Token Authentication
//!
//! Every `/v1` endpoint requires `Authorization: Bearer <token>`. Tokens are
//! resolved to an [`Identity`] by an [`IdentityProvider`]; the resolved
//! identity is stored in the request extensions for handlers to pick up.

use axum::{
    Extension, Json,
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use gantry_core::domain::identity::Identity;
use std::collections::HashMap;
use tracing::warn;

use super::AppState;
use crate::api::error::{ApiError, ApiResult};

/// Resolves bearer tokens to callers
pub trait IdentityProvider: Send + Sync {
    fn resolve(&self, token: &str) -> Option<Identity>;
}

/// Fixed token table loaded from configuration
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Identity>,
}

impl StaticTokens {
    /// Parses `token=id:name` entries
    pub fn parse(entries: &[String]) -> anyhow::Result<Self> {
        let mut tokens = HashMap::new();

        for entry in entries {
            let (token, who) = entry
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("API token entry must look like token=id:name"))?;
            let (id, name) = who
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("API token identity must look like id:name"))?;

            let (token, id, name) = (token.trim(), id.trim(), name.trim());
            if token.is_empty() || id.is_empty() {
                anyhow::bail!("API token and identity id cannot be empty");
            }

            let identity = Identity {
                id: id.to_string(),
                name: name.to_string(),
            };
            if tokens.insert(token.to_string(), identity).is_some() {
                anyhow::bail!("API token for {} is listed twice", id);
            }
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

impl IdentityProvider for StaticTokens {
    fn resolve(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Rejects requests without a known bearer token
pub async fn require_bearer(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> ApiResult<Response> {
    let identity = match bearer_token(req.headers()) {
        Some(token) => state.identities.resolve(token),
        None => None,
    };

    let Some(identity) = identity else {
        warn!("Rejected unauthenticated {} {}", req.method(), req.uri().path());
        return Err(ApiError::Unauthorized);
    };

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

/// GET /v1/whoami
/// The authenticated caller
pub async fn whoami(Extension(identity): Extension<Identity>) -> Json<Identity> {
    Json(identity)
}
