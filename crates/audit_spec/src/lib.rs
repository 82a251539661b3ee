//! nova_audit_spec
//!
//! Strongly-typed audit entries for the lens gate.
//! - closed category / action / severity sets
//! - the hash payload with its stable field ordering
//! - query + integrity report shapes
//!
//! NOTE: the hash payload field order is part of the on-disk contract.
//! Changing it invalidates every previously written chain.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nova_common::sha256_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Auth,
    Authorization,
    Security,
    LiveData,
    Llm,
    DataAccess,
    Admin,
    Retention,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Auth => "auth",
            AuditCategory::Authorization => "authorization",
            AuditCategory::Security => "security",
            AuditCategory::LiveData => "live_data",
            AuditCategory::Llm => "llm",
            AuditCategory::DataAccess => "data_access",
            AuditCategory::Admin => "admin",
            AuditCategory::Retention => "retention",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "auth.login")]
    AuthLogin,
    #[serde(rename = "auth.invalid_token")]
    AuthInvalidToken,
    #[serde(rename = "authorization.denied")]
    AuthorizationDenied,
    #[serde(rename = "security.blocked")]
    SecurityBlocked,
    #[serde(rename = "security.rate_limited")]
    SecurityRateLimited,
    #[serde(rename = "security.user_blocked")]
    SecurityUserBlocked,
    #[serde(rename = "lens.turn")]
    LensTurn,
    #[serde(rename = "lens.provider_fetch")]
    ProviderFetch,
    #[serde(rename = "llm.call")]
    LlmCall,
    #[serde(rename = "llm.hallucination_detected")]
    HallucinationDetected,
    #[serde(rename = "llm.leak_violation")]
    LeakViolation,
    #[serde(rename = "retention.delete")]
    RetentionDelete,
    #[serde(rename = "retention.user_erasure")]
    UserErasure,
    #[serde(rename = "audit.integrity_check")]
    IntegrityCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Optional request metadata captured at the boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// What callers hand to the log. The store assigns id, hashes, and position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub category: AuditCategory,
    pub action: AuditAction,
    pub severity: AuditSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestMeta>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A chained entry as persisted. Read-only once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: u64,
    pub category: AuditCategory,
    pub action: AuditAction,
    pub severity: AuditSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestMeta>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Hash of the previous entry. None only for the chain root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

pub fn new_entry_id() -> String {
    Uuid::new_v4().to_string()
}

// Stable hash payload. Declaration order here IS the wire ordering:
// id, timestamp, category, action, severity, userId, targetUserId,
// entityType, entityId, description, details, success, previousHash.
#[derive(Serialize)]
struct HashPayload<'a> {
    id: &'a str,
    timestamp: u64,
    category: AuditCategory,
    action: AuditAction,
    severity: AuditSeverity,
    user_id: &'a Option<String>,
    target_user_id: &'a Option<String>,
    entity_type: &'a Option<String>,
    entity_id: &'a Option<String>,
    description: &'a str,
    details: &'a Option<serde_json::Value>,
    success: bool,
    previous_hash: &'a Option<String>,
}

/// Hex-encoded SHA-256 over the stable hash payload.
pub fn compute_entry_hash(
    id: &str,
    timestamp: u64,
    entry: &NewAuditEntry,
    previous_hash: &Option<String>,
) -> String {
    let payload = HashPayload {
        id,
        timestamp,
        category: entry.category,
        action: entry.action,
        severity: entry.severity,
        user_id: &entry.user_id,
        target_user_id: &entry.target_user_id,
        entity_type: &entry.entity_type,
        entity_id: &entry.entity_id,
        description: &entry.description,
        details: &entry.details,
        success: entry.success,
        previous_hash,
    };
    // serde_json preserves declaration order, which is the contract here.
    let bytes = serde_json::to_vec(&payload).unwrap_or_default();
    sha256_hex(&bytes)
}

/// Recompute the hash of a persisted entry for integrity verification.
pub fn recompute_entry_hash(entry: &AuditEntry) -> String {
    let as_new = NewAuditEntry {
        category: entry.category,
        action: entry.action,
        severity: entry.severity,
        user_id: entry.user_id.clone(),
        target_user_id: entry.target_user_id.clone(),
        entity_type: entry.entity_type.clone(),
        entity_id: entry.entity_id.clone(),
        description: entry.description.clone(),
        details: entry.details.clone(),
        request: entry.request.clone(),
        success: entry.success,
        error_message: entry.error_message.clone(),
    };
    compute_entry_hash(&entry.id, entry.timestamp, &as_new, &entry.previous_hash)
}

// ----------------------------
// Queries
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub category: Option<AuditCategory>,
    pub action: Option<AuditAction>,
    pub severity: Option<AuditSeverity>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub from_ts: Option<u64>,
    pub to_ts: Option<u64>,
    pub success_only: bool,
    pub failed_only: bool,
    pub search_text: Option<String>,
    pub limit: usize,
    pub offset: usize,
    pub sort_order: SortOrder,
}

impl AuditQuery {
    pub fn latest(limit: usize) -> Self {
        Self { limit, ..Default::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub entries_checked: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
