//! nova_telemetry
//!
//! Observability plumbing for the lens gate:
//! - per-request correlation context, propagated to every component
//! - structured operational events through `tracing`
//! - per-turn `LensTrace` summary
//! - dependency health registry backing /health, /health/live, /health/ready
//!
//! Subscriber initialization is dual-mode: compact for development, flat
//! JSON for production ingestion.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use nova_common::epoch_millis;

// ----------------------------
// Correlation
// ----------------------------

/// Created once per request, immutable, carried through every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub request_id: String,
    pub conversation_id: String,
    /// Hash of the user id, never the raw id.
    pub user_id_hash: String,
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub timestamp: u64,
    pub environment: String,
    pub service_version: String,
}

impl CorrelationContext {
    pub fn new(conversation_id: &str, user_id_hash: &str, environment: &str, service_version: &str) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            user_id_hash: user_id_hash.to_string(),
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: short_span_id(),
            parent_span_id: None,
            timestamp: epoch_millis(),
            environment: environment.to_string(),
            service_version: service_version.to_string(),
        }
    }

    /// Derive a child context for a subtask; same trace, new span.
    pub fn child(&self) -> Self {
        let mut next = self.clone();
        next.parent_span_id = Some(self.span_id.clone());
        next.span_id = short_span_id();
        next
    }
}

fn short_span_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

// ----------------------------
// Operational events
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LensOperationalEvent {
    pub event_type: String,
    pub severity: EventSeverity,
    pub correlation: CorrelationContext,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Emit through `tracing` with stable structured fields.
pub fn emit(event: &LensOperationalEvent) {
    let data = event.data.to_string();
    match event.severity {
        EventSeverity::Debug => tracing::debug!(
            target: "lens",
            event_type = %event.event_type,
            request_id = %event.correlation.request_id,
            trace_id = %event.correlation.trace_id,
            duration_ms = event.duration_ms,
            data = %data,
            "{}",
            event.message
        ),
        EventSeverity::Info => tracing::info!(
            target: "lens",
            event_type = %event.event_type,
            request_id = %event.correlation.request_id,
            trace_id = %event.correlation.trace_id,
            duration_ms = event.duration_ms,
            data = %data,
            "{}",
            event.message
        ),
        EventSeverity::Warning => tracing::warn!(
            target: "lens",
            event_type = %event.event_type,
            request_id = %event.correlation.request_id,
            trace_id = %event.correlation.trace_id,
            duration_ms = event.duration_ms,
            error = event.error.as_deref(),
            data = %data,
            "{}",
            event.message
        ),
        EventSeverity::Error | EventSeverity::Critical => tracing::error!(
            target: "lens",
            event_type = %event.event_type,
            request_id = %event.correlation.request_id,
            trace_id = %event.correlation.trace_id,
            duration_ms = event.duration_ms,
            error = event.error.as_deref(),
            data = %data,
            "{}",
            event.message
        ),
    }
}

// ----------------------------
// Lens trace
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LensOutcome {
    Success,
    PartialSuccess,
    Degraded,
    Blocked,
    Passthrough,
    Error,
}

/// Per-request summary assembled by the gate and logged at completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LensTrace {
    pub correlation: CorrelationContext,
    pub outcome: LensOutcome,
    pub truth_mode: String,
    pub primary_category: Option<String>,
    pub entities_extracted: u32,
    pub entities_resolved: u32,
    pub providers_called: Vec<String>,
    pub providers_succeeded: Vec<String>,
    pub providers_failed: Vec<String>,
    pub used_fallback: bool,
    pub used_stale_data: bool,
    pub numeric_token_count: u32,
    pub has_errors: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    pub classification_ms: u64,
    pub fetch_ms: u64,
    pub llm_ms: u64,
    pub total_ms: u64,
}

// ----------------------------
// Health registry
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: u64,
}

#[async_trait]
pub trait DependencyCheck: Send + Sync {
    async fn check(&self) -> HealthCheckResult;
}

struct RegisteredCheck {
    name: String,
    critical: bool,
    check: Arc<dyn DependencyCheck>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: HashMap<String, HealthCheckResult>,
    pub checked_at: u64,
}

/// Registered dependency checks, run in parallel with individual failures trapped.
#[derive(Default)]
pub struct HealthRegistry {
    checks: Vec<RegisteredCheck>,
    check_timeout: Option<Duration>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self { checks: Vec::new(), check_timeout: Some(Duration::from_secs(5)) }
    }

    pub fn register(&mut self, name: impl Into<String>, critical: bool, check: Arc<dyn DependencyCheck>) {
        self.checks.push(RegisteredCheck { name: name.into(), critical, check });
    }

    /// Run every check concurrently. A panicking or timed-out check reports
    /// unhealthy rather than failing the whole report.
    pub async fn run_all(&self) -> HealthReport {
        let timeout = self.check_timeout;
        let futures_list = self.checks.iter().map(|c| {
            let check = c.check.clone();
            let name = c.name.clone();
            async move {
                let run = async move {
                    match timeout {
                        Some(t) => tokio::time::timeout(t, check.check()).await.unwrap_or_else(|_| HealthCheckResult {
                            status: HealthStatus::Unhealthy,
                            details: None,
                            error: Some("health check timed out".to_string()),
                            checked_at: epoch_millis(),
                        }),
                        None => check.check().await,
                    }
                };
                let result = match tokio::spawn(run).await {
                    Ok(r) => r,
                    Err(join_err) => HealthCheckResult {
                        status: HealthStatus::Unhealthy,
                        details: None,
                        error: Some(format!("health check panicked: {join_err}")),
                        checked_at: epoch_millis(),
                    },
                };
                (name, result)
            }
        });
        let results: HashMap<String, HealthCheckResult> =
            futures::future::join_all(futures_list).await.into_iter().collect();

        let status = aggregate_status(results.values().map(|r| r.status));
        HealthReport { status, checks: results, checked_at: epoch_millis() }
    }

    /// Readiness depends only on critical checks; degraded still counts ready.
    pub async fn ready(&self) -> bool {
        let report = self.run_all().await;
        self.checks
            .iter()
            .filter(|c| c.critical)
            .all(|c| match report.checks.get(&c.name) {
                Some(r) => matches!(r.status, HealthStatus::Healthy | HealthStatus::Degraded),
                None => false,
            })
    }
}

fn aggregate_status(statuses: impl Iterator<Item = HealthStatus>) -> HealthStatus {
    let mut agg = HealthStatus::Healthy;
    for s in statuses {
        agg = match (agg, s) {
            (_, HealthStatus::Unhealthy) | (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
            (_, HealthStatus::Degraded) | (HealthStatus::Degraded, _) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        };
    }
    agg
}

// ----------------------------
// Subscriber init
// ----------------------------

/// Install the global subscriber. Compact output for development, flat JSON
/// for production. Call once per process, before any spans are created.
pub fn init_tracing(service: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if cfg!(debug_assertions) { "debug" } else { "info" };
        format!("{service}={level},tower_http=warn,hyper=warn").into()
    });

    if cfg!(debug_assertions) {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_target(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().flatten_event(true))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCheck(HealthStatus);

    #[async_trait]
    impl DependencyCheck for FixedCheck {
        async fn check(&self) -> HealthCheckResult {
            HealthCheckResult { status: self.0, details: None, error: None, checked_at: epoch_millis() }
        }
    }

    struct PanickingCheck;

    #[async_trait]
    impl DependencyCheck for PanickingCheck {
        async fn check(&self) -> HealthCheckResult {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn child_context_links_spans() {
        let ctx = CorrelationContext::new("conv", "hash", "test", "0.1.0");
        let child = ctx.child();
        assert_eq!(child.trace_id, ctx.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(ctx.span_id.as_str()));
        assert_ne!(child.span_id, ctx.span_id);
    }

    #[tokio::test]
    async fn ready_ignores_non_critical_failures() {
        let mut reg = HealthRegistry::new();
        reg.register("store", true, Arc::new(FixedCheck(HealthStatus::Healthy)));
        reg.register("llm", false, Arc::new(FixedCheck(HealthStatus::Unhealthy)));
        assert!(reg.ready().await);

        let report = reg.run_all().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn ready_fails_on_critical_unhealthy() {
        let mut reg = HealthRegistry::new();
        reg.register("store", true, Arc::new(FixedCheck(HealthStatus::Unhealthy)));
        assert!(!reg.ready().await);
    }

    #[tokio::test]
    async fn degraded_critical_still_ready() {
        let mut reg = HealthRegistry::new();
        reg.register("store", true, Arc::new(FixedCheck(HealthStatus::Degraded)));
        assert!(reg.ready().await);
    }

    #[tokio::test]
    async fn panicking_check_is_trapped() {
        let mut reg = HealthRegistry::new();
        reg.register("flaky", false, Arc::new(PanickingCheck));
        reg.register("ok", true, Arc::new(FixedCheck(HealthStatus::Healthy)));
        let report = reg.run_all().await;
        assert_eq!(report.checks["flaky"].status, HealthStatus::Unhealthy);
        assert!(report.checks["flaky"].error.as_deref().unwrap_or("").contains("panicked"));
        assert!(reg.ready().await);
    }
}
