//! nova_auth
//!
//! Authorization: every live-data call is bound to an authenticated
//! principal. Role, permission, and ownership checks; admins may bypass
//! ownership where the call site allows it; every denial lands in the
//! audit log with a stable reason.
//!
//! Fail closed: any uncertainty (missing resource, lookup error) denies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use nova_audit_log::AuditStore;
use nova_audit_spec::{AuditAction, AuditCategory, AuditSeverity, NewAuditEntry};
use nova_ratelimit::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Anonymous,
    User,
    Premium,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(pub String);

impl Permission {
    pub fn new(p: impl Into<String>) -> Self {
        Self(p.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// None for anonymous traffic.
    pub id: Option<String>,
    pub roles: Vec<Role>,
    pub permissions: Vec<Permission>,
    pub tier: Tier,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self { id: None, roles: vec![Role::Anonymous], permissions: vec![], tier: Tier::Free }
    }

    pub fn user(id: impl Into<String>, tier: Tier) -> Self {
        Self { id: Some(id.into()), roles: vec![Role::User], permissions: vec![], tier }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            roles: vec![Role::User, Role::Admin],
            permissions: vec![],
            tier: Tier::Enterprise,
        }
    }

    pub fn with_permissions(mut self, permissions: Vec<Permission>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.id.is_some()
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn has_permission(&self, permission: &Permission) -> bool {
        self.permissions.contains(permission)
    }
}

// ----------------------------
// Errors
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenialReason {
    #[serde(rename = "NOT_AUTHENTICATED")]
    NotAuthenticated,
    #[serde(rename = "NOT_OWNER")]
    NotOwner,
    #[serde(rename = "MISSING_PERMISSION")]
    MissingPermission,
    #[serde(rename = "MISSING_ROLE")]
    MissingRole,
    #[serde(rename = "RESOURCE_NOT_FOUND")]
    ResourceNotFound,
    #[serde(rename = "BLOCKED")]
    Blocked,
}

#[derive(Debug, Error)]
#[error("authorization denied: {reason:?}")]
pub struct AuthError {
    pub reason: DenialReason,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    /// When set, the denial is surfaced as 404 to avoid disclosing existence.
    pub hide_as_not_found: bool,
}

impl AuthError {
    fn new(reason: DenialReason) -> Self {
        Self { reason, resource_type: None, resource_id: None, hide_as_not_found: false }
    }

    pub fn status(&self) -> u16 {
        if self.hide_as_not_found {
            return 404;
        }
        match self.reason {
            DenialReason::NotAuthenticated => 401,
            DenialReason::ResourceNotFound => 404,
            DenialReason::NotOwner
            | DenialReason::MissingPermission
            | DenialReason::MissingRole
            | DenialReason::Blocked => 403,
        }
    }

    pub fn code(&self) -> &'static str {
        match self.reason {
            DenialReason::NotAuthenticated => "NOT_AUTHENTICATED",
            DenialReason::NotOwner => "NOT_OWNER",
            DenialReason::MissingPermission => "MISSING_PERMISSION",
            DenialReason::MissingRole => "MISSING_ROLE",
            DenialReason::ResourceNotFound => "NOT_FOUND",
            DenialReason::Blocked => "USER_BLOCKED",
        }
    }
}

// ----------------------------
// Ownership registry
// ----------------------------

/// Per-resource-type ownership lookup. `Ok(None)` means the resource does
/// not exist; errors deny (fail closed).
#[async_trait]
pub trait OwnershipLookup: Send + Sync {
    async fn owned_by(&self, user_id: &str, resource_id: &str) -> Result<Option<bool>, String>;
}

#[derive(Default)]
pub struct OwnershipRegistry {
    lookups: HashMap<String, Arc<dyn OwnershipLookup>>,
}

impl OwnershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource_type: impl Into<String>, lookup: Arc<dyn OwnershipLookup>) {
        self.lookups.insert(resource_type.into(), lookup);
    }

    fn lookup_for(&self, resource_type: &str) -> Option<&Arc<dyn OwnershipLookup>> {
        self.lookups.get(resource_type)
    }
}

// ----------------------------
// Authorizer
// ----------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct OwnershipOptions {
    pub allow_admin: bool,
    pub hide_as_not_found: bool,
}

impl OwnershipOptions {
    pub fn admin_bypass() -> Self {
        Self { allow_admin: true, hide_as_not_found: false }
    }
}

pub struct Authorizer {
    audit: AuditStore,
    ownership: OwnershipRegistry,
}

impl Authorizer {
    pub fn new(audit: AuditStore, ownership: OwnershipRegistry) -> Self {
        Self { audit, ownership }
    }

    pub async fn require_authenticated(&self, principal: &Principal) -> Result<(), AuthError> {
        if principal.is_authenticated() {
            return Ok(());
        }
        Err(self.deny(principal, DenialReason::NotAuthenticated, None, None).await)
    }

    pub async fn require_role(&self, principal: &Principal, role: Role) -> Result<(), AuthError> {
        if principal.has_role(role) {
            return Ok(());
        }
        Err(self.deny(principal, DenialReason::MissingRole, None, None).await)
    }

    pub async fn require_any_role(&self, principal: &Principal, roles: &[Role]) -> Result<(), AuthError> {
        if roles.iter().any(|r| principal.has_role(*r)) {
            return Ok(());
        }
        Err(self.deny(principal, DenialReason::MissingRole, None, None).await)
    }

    pub async fn require_permission(&self, principal: &Principal, permission: &Permission) -> Result<(), AuthError> {
        if principal.has_permission(permission) {
            return Ok(());
        }
        Err(self.deny(principal, DenialReason::MissingPermission, None, None).await)
    }

    pub async fn require_any_permission(
        &self,
        principal: &Principal,
        permissions: &[Permission],
    ) -> Result<(), AuthError> {
        if permissions.iter().any(|p| principal.has_permission(p)) {
            return Ok(());
        }
        Err(self.deny(principal, DenialReason::MissingPermission, None, None).await)
    }

    pub async fn require_all_permissions(
        &self,
        principal: &Principal,
        permissions: &[Permission],
    ) -> Result<(), AuthError> {
        if permissions.iter().all(|p| principal.has_permission(p)) {
            return Ok(());
        }
        Err(self.deny(principal, DenialReason::MissingPermission, None, None).await)
    }

    /// Resource-type + action checks flatten to `{resource}:{action}`.
    pub async fn require_action(
        &self,
        principal: &Principal,
        resource_type: &str,
        action: &str,
    ) -> Result<(), AuthError> {
        let needed = Permission::new(format!("{resource_type}:{action}"));
        if principal.has_permission(&needed) || principal.has_role(Role::Admin) {
            return Ok(());
        }
        Err(self.deny(principal, DenialReason::MissingPermission, Some(resource_type), None).await)
    }

    pub async fn require_ownership(
        &self,
        principal: &Principal,
        resource_type: &str,
        resource_id: &str,
        options: OwnershipOptions,
    ) -> Result<(), AuthError> {
        let Some(user_id) = &principal.id else {
            return Err(self
                .deny(principal, DenialReason::NotAuthenticated, Some(resource_type), Some(resource_id))
                .await);
        };
        if options.allow_admin && principal.has_role(Role::Admin) {
            return Ok(());
        }

        let Some(lookup) = self.ownership.lookup_for(resource_type) else {
            // Unregistered resource type: nothing can be owned, deny.
            return Err(self
                .deny(principal, DenialReason::ResourceNotFound, Some(resource_type), Some(resource_id))
                .await);
        };

        match lookup.owned_by(user_id, resource_id).await {
            Ok(Some(true)) => Ok(()),
            Ok(Some(false)) => {
                let mut err = self
                    .deny(principal, DenialReason::NotOwner, Some(resource_type), Some(resource_id))
                    .await;
                err.hide_as_not_found = options.hide_as_not_found;
                Err(err)
            }
            Ok(None) => Err(self
                .deny(principal, DenialReason::ResourceNotFound, Some(resource_type), Some(resource_id))
                .await),
            Err(lookup_error) => {
                tracing::error!(target: "auth", resource_type, "ownership lookup failed: {lookup_error}");
                Err(self
                    .deny(principal, DenialReason::NotOwner, Some(resource_type), Some(resource_id))
                    .await)
            }
        }
    }

    /// Record a blocked-user denial (rate-limit escalation path).
    pub async fn deny_blocked(&self, principal: &Principal) -> AuthError {
        self.deny(principal, DenialReason::Blocked, None, None).await
    }

    async fn deny(
        &self,
        principal: &Principal,
        reason: DenialReason,
        resource_type: Option<&str>,
        resource_id: Option<&str>,
    ) -> AuthError {
        let entry = NewAuditEntry {
            category: AuditCategory::Authorization,
            action: AuditAction::AuthorizationDenied,
            severity: AuditSeverity::Warning,
            user_id: principal.id.clone(),
            target_user_id: None,
            entity_type: resource_type.map(String::from),
            entity_id: resource_id.map(String::from),
            description: format!("authorization denied: {reason:?}"),
            details: Some(serde_json::json!({ "reason": reason })),
            request: None,
            success: false,
            error_message: None,
        };
        if let Err(err) = self.audit.append(entry).await {
            tracing::error!(target: "auth", "failed to audit denial: {err}");
        }

        let mut auth_error = AuthError::new(reason);
        auth_error.resource_type = resource_type.map(String::from);
        auth_error.resource_id = resource_id.map(String::from);
        auth_error
    }
}
