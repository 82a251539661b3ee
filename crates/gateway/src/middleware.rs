//! Admission middleware: principal extraction and tier rate limiting.
//!
//! Tokens arrive as `Authorization: Bearer <jwt>` or `X-API-Key: nova_<jwt>`.
//! The payload segment is decoded for claims; signature verification is
//! delegated to the identity boundary in front of this service.

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine;
use serde::Deserialize;

use nova_auth::{Permission, Principal, Role};
use nova_ratelimit::{Tier, TierDecision};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct JwtClaims {
    sub: String,
    #[serde(default)]
    tier: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    permissions: Vec<String>,
}

fn parse_tier(raw: Option<&str>) -> Tier {
    match raw {
        Some("enterprise") => Tier::Enterprise,
        Some("pro") => Tier::Pro,
        _ => Tier::Free,
    }
}

fn parse_roles(raw: &[String]) -> Vec<Role> {
    let mut roles = vec![Role::User];
    for role in raw {
        match role.as_str() {
            "admin" => roles.push(Role::Admin),
            "premium" => roles.push(Role::Premium),
            _ => {}
        }
    }
    roles
}

/// Decode the payload segment of a JWT into a principal.
fn principal_from_jwt(token: &str) -> Option<Principal> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return None;
    }
    let payload = BASE64_URL.decode(segments[1]).ok()?;
    let claims: JwtClaims = serde_json::from_slice(&payload).ok()?;
    Some(Principal {
        id: Some(claims.sub),
        roles: parse_roles(&claims.roles),
        permissions: claims.permissions.into_iter().map(Permission).collect(),
        tier: parse_tier(claims.tier.as_deref()),
    })
}

fn extract_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(header::AUTHORIZATION).and_then(|h| h.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    if let Some(value) = request.headers().get("x-api-key").and_then(|h| h.to_str().ok()) {
        if let Some(token) = value.strip_prefix("nova_") {
            return Some(token.to_string());
        }
    }
    None
}

/// Attach a `Principal` to the request, or reject with 401.
pub async fn auth_guard(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let principal = match extract_token(&request).and_then(|t| principal_from_jwt(&t)) {
        Some(principal) => principal,
        None if !state.require_auth => Principal::anonymous(),
        None => {
            tracing::debug!(target: "gateway", "request rejected: no usable credentials");
            return ApiError::unauthenticated().into_response();
        }
    };
    request.extensions_mut().insert(principal);
    next.run(request).await
}

/// Global per-user tier limiting with the standard rate headers. Runs after
/// `auth_guard` so the principal is available.
pub async fn tier_rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(principal) = request.extensions().get::<Principal>().cloned() else {
        return ApiError::internal().into_response();
    };
    let Some(user_id) = principal.id.clone() else {
        // Anonymous traffic is already bounded by the per-provider limits.
        return next.run(request).await;
    };

    match state.tier_limiter.check(&user_id, principal.tier) {
        TierDecision::Allowed(decision) => {
            let mut response = next.run(request).await;
            set_rate_headers(&mut response, decision.limit, decision.limit.saturating_sub(decision.current), decision.reset_in_ms);
            response
        }
        TierDecision::Limited(decision) => {
            let window = state.tier_limiter.limits().clone();
            let config = match principal.tier {
                Tier::Free => window.free,
                Tier::Pro => window.pro,
                Tier::Enterprise => window.enterprise,
            };
            let retry_after_secs = decision.retry_after_ms.unwrap_or(0).div_ceil(1_000);
            let mut response = ApiError::new(
                axum::http::StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "rate limit exceeded",
            )
            .with_details(serde_json::json!({
                "retryAfter": retry_after_secs,
                "limit": config.max_requests,
                "window": config.window_millis / 1_000,
            }))
            .into_response();
            set_rate_headers(&mut response, decision.limit, 0, decision.reset_in_ms);
            response
        }
        TierDecision::Blocked(block) => {
            tracing::warn!(target: "gateway", user_id = %user_id, "blocked user rejected");
            ApiError::new(axum::http::StatusCode::FORBIDDEN, "USER_BLOCKED", block.reason).into_response()
        }
    }
}

fn set_rate_headers(response: &mut Response, limit: u32, remaining: u32, reset_ms: u64) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&reset_ms.div_ceil(1_000).to_string()) {
        headers.insert("X-RateLimit-Reset", v);
    }
}
