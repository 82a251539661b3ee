//! Router assembly: health surface, status, and the lens turn route.

use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use nova_auth::Principal;
use nova_gate::TurnRequest;
use nova_telemetry::HealthStatus;

use crate::error::ApiError;
use crate::middleware::{auth_guard, tier_rate_limit};
use crate::state::AppState;

const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn build_router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/v1/lens/turn", post(lens_turn))
        .layer(middleware::from_fn_with_state(state.clone(), tier_rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), auth_guard));

    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/status", get(status))
        .merge(gated)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ----------------------------
// Health surface
// ----------------------------

async fn health(State(state): State<AppState>) -> Response {
    let report = state.health.run_all().await;
    let code = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(report)).into_response()
}

/// Liveness is unconditional: the process answering is the signal.
async fn health_live() -> Response {
    (StatusCode::OK, Json(serde_json::json!({ "status": "alive" }))).into_response()
}

async fn health_ready(State(state): State<AppState>) -> Response {
    if state.health.ready().await {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ready" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready" })),
        )
            .into_response()
    }
}

async fn status(State(state): State<AppState>) -> Response {
    let report = state.health.run_all().await;
    let body = serde_json::json!({
        "service": "nova-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": report.status,
        "checks": report.checks,
        "checkedAt": report.checked_at,
    });
    let code = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(body)).into_response()
}

// ----------------------------
// Lens turn
// ----------------------------

#[derive(Debug, Deserialize)]
pub struct TurnBody {
    #[serde(default, rename = "conversationId")]
    pub conversation_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct TurnReply {
    pub reply: String,
    pub outcome: nova_telemetry::LensOutcome,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "truthMode")]
    pub truth_mode: String,
    #[serde(rename = "numericTokenCount")]
    pub numeric_token_count: u32,
}

async fn lens_turn(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<TurnBody>,
) -> Response {
    if body.message.trim().is_empty() {
        return ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "message must not be empty")
            .with_details(serde_json::json!({ "fields": { "message": "required" } }))
            .into_response();
    }

    let request = TurnRequest {
        principal,
        conversation_id: body.conversation_id.unwrap_or_else(|| "adhoc".to_string()),
        message: body.message,
    };
    let outcome = state.gate.handle_turn(request).await;

    Json(TurnReply {
        reply: outcome.reply,
        outcome: outcome.outcome,
        request_id: outcome.trace.correlation.request_id.clone(),
        truth_mode: outcome.trace.truth_mode.clone(),
        numeric_token_count: outcome.trace.numeric_token_count,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
    use base64::Engine;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    use nova_audit_log::AuditStore;
    use nova_auth::{Authorizer, OwnershipRegistry};
    use nova_common::{ManualClock, SystemClock};
    use nova_entities::{EntityValidator, ValidatorConfig};
    use nova_gate::{GateConfig, LensGate};
    use nova_lens::LensClassifier;
    use nova_llm::{ChatMessage, LlmAdapter, LlmClientConfig, LlmReply, LlmSecurityClient};
    use nova_providers::{FetchCore, FetchCoreConfig, ProviderRegistry};
    use nova_ratelimit::{LayeredLimiter, RateLimitConfig, TierLimiter, TierLimits};
    use nova_redaction::PromptSanitizer;
    use nova_store::MemoryStore;
    use nova_telemetry::{DependencyCheck, HealthCheckResult, HealthRegistry};

    struct FriendlyAdapter;

    #[async_trait]
    impl LlmAdapter for FriendlyAdapter {
        fn name(&self) -> &str {
            "friendly"
        }
        async fn dispatch(&self, _m: &[ChatMessage], _max: u64) -> Result<LlmReply, String> {
            Ok(LlmReply {
                content: "Happy to help!".into(),
                finish_reason: Some("stop".into()),
                usage: Default::default(),
                provider_request_id: None,
            })
        }
    }

    struct FixedCheck(nova_telemetry::HealthStatus);

    #[async_trait]
    impl DependencyCheck for FixedCheck {
        async fn check(&self) -> HealthCheckResult {
            HealthCheckResult {
                status: self.0,
                details: None,
                error: None,
                checked_at: nova_common::epoch_millis(),
            }
        }
    }

    fn test_state(critical_status: nova_telemetry::HealthStatus, tier_limits: TierLimits) -> AppState {
        let clock = Arc::new(SystemClock);
        let store = Arc::new(MemoryStore::default());
        let limiter = Arc::new(LayeredLimiter::new(
            RateLimitConfig::new(1_000, 60_000),
            RateLimitConfig::new(1_000, 60_000),
            clock.clone(),
        ));
        let fetch_core = Arc::new(FetchCore::new(store.clone(), limiter, FetchCoreConfig::default()));
        let registry = Arc::new(ProviderRegistry::new());
        let validator = Arc::new(EntityValidator::new(
            fetch_core.clone(),
            registry.clone(),
            ValidatorConfig::default(),
        ));
        let audit = AuditStore::new(store.clone());
        let authorizer = Arc::new(Authorizer::new(audit.clone(), OwnershipRegistry::new()));
        let llm = Arc::new(LlmSecurityClient::new(
            Arc::new(FriendlyAdapter),
            PromptSanitizer::default(),
            LlmClientConfig::default(),
        ));
        let gate = Arc::new(LensGate::new(
            registry,
            fetch_core,
            validator,
            Arc::new(LensClassifier::new()),
            llm,
            audit.clone(),
            authorizer,
            GateConfig::default(),
        ));

        let mut health = HealthRegistry::new();
        health.register("store", true, Arc::new(FixedCheck(critical_status)));

        let tier_clock = Arc::new(ManualClock::new(1_000_000));
        AppState {
            gate,
            tier_limiter: Arc::new(TierLimiter::new(tier_limits, tier_clock)),
            health: Arc::new(health),
            audit,
            require_auth: true,
        }
    }

    fn bearer_jwt(sub: &str, tier: &str) -> String {
        let header = BASE64_URL.encode(b"{\"alg\":\"HS256\"}");
        let payload = BASE64_URL.encode(serde_json::json!({ "sub": sub, "tier": tier }).to_string().as_bytes());
        format!("Bearer {header}.{payload}.sig")
    }

    fn turn_request(auth: Option<&str>, message: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/lens/turn")
            .header("content-type", "application/json");
        if let Some(a) = auth {
            builder = builder.header("authorization", a);
        }
        builder
            .body(Body::from(serde_json::json!({ "message": message }).to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn live_is_unconditionally_200() {
        let app = build_router(test_state(nova_telemetry::HealthStatus::Unhealthy, TierLimits::default()));
        let response = app
            .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_depends_on_critical_checks() {
        let healthy = build_router(test_state(nova_telemetry::HealthStatus::Healthy, TierLimits::default()));
        let response = healthy
            .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let broken = build_router(test_state(nova_telemetry::HealthStatus::Unhealthy, TierLimits::default()));
        let response = broken
            .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_maps_unhealthy_to_503() {
        let app = build_router(test_state(nova_telemetry::HealthStatus::Unhealthy, TierLimits::default()));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn turn_without_credentials_is_401_enveloped() {
        let app = build_router(test_state(nova_telemetry::HealthStatus::Healthy, TierLimits::default()));
        let response = app.oneshot(turn_request(None, "Hello!")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "NOT_AUTHENTICATED");
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn authorized_turn_succeeds_with_rate_headers() {
        let app = build_router(test_state(nova_telemetry::HealthStatus::Healthy, TierLimits::default()));
        let response = app
            .oneshot(turn_request(Some(&bearer_jwt("alice", "pro")), "Hello!"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("X-RateLimit-Limit"));
        assert!(response.headers().contains_key("X-RateLimit-Remaining"));
        assert!(response.headers().contains_key("X-RateLimit-Reset"));

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["outcome"], "passthrough");
        assert!(body["requestId"].is_string());
    }

    #[tokio::test]
    async fn exceeding_tier_limit_returns_429_envelope() {
        let tight = TierLimits { free: RateLimitConfig::new(1, 60_000), ..Default::default() };
        let app = build_router(test_state(nova_telemetry::HealthStatus::Healthy, tight));

        let first = app
            .clone()
            .oneshot(turn_request(Some(&bearer_jwt("bob", "free")), "Hello!"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(turn_request(Some(&bearer_jwt("bob", "free")), "Hello!"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let bytes = second.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "RATE_LIMITED");
        assert!(body["details"]["retryAfter"].is_number());
        assert!(body["details"]["limit"].is_number());
        assert!(body["details"]["window"].is_number());
    }

    #[tokio::test]
    async fn empty_message_is_400_validation_error() {
        let app = build_router(test_state(nova_telemetry::HealthStatus::Healthy, TierLimits::default()));
        let response = app
            .oneshot(turn_request(Some(&bearer_jwt("alice", "pro")), "   "))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }
}
