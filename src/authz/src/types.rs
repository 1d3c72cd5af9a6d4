//! Core authorization types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Subject identifier (user, service account)
pub type SubjectId = String;

/// Role identifier
pub type RoleId = String;

/// Authorization context qualifier kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    /// Organization-wide roles
    #[serde(alias = "org")]
    Organization,
    /// Roles bound to one project
    Project,
    /// System-wide roles
    System,
}

impl ScopeType {
    /// All scope types, in the order the hierarchy cache walks them
    pub const ALL: [ScopeType; 3] = [ScopeType::Organization, ScopeType::Project, ScopeType::System];

    /// Short key segment for this scope type
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeType::Organization => "org",
            ScopeType::Project => "project",
            ScopeType::System => "system",
        }
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete scope: type plus optional instance id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    #[serde(rename = "type")]
    pub scope_type: ScopeType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Scope {
    pub fn organization(id: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Organization,
            id: Some(id.into()),
        }
    }

    pub fn project(id: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Project,
            id: Some(id.into()),
        }
    }

    pub fn system() -> Self {
        Self {
            scope_type: ScopeType::System,
            id: None,
        }
    }

    /// Key segment: `org=acme`, `project=p1`, `system`
    pub fn key_segment(&self) -> String {
        match &self.id {
            Some(id) => format!("{}={}", self.scope_type.as_str(), id),
            None => self.scope_type.as_str().to_string(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key_segment())
    }
}

/// Atomic unit of authorization intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionCheck {
    /// Resource being accessed (e.g. "invoice", "report:q3")
    pub resource: String,

    /// Action on the resource (e.g. "read", "approve")
    pub action: String,

    /// Optional evaluation context forwarded to the backing store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<HashMap<String, serde_json::Value>>,
}

impl PermissionCheck {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
            context: None,
        }
    }

    /// Attach a context value
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    /// `resource:action` pair used for checksums
    pub fn pair(&self) -> String {
        format!("{}:{}", self.resource, self.action)
    }
}

/// Decision for one `PermissionCheck`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResult {
    pub resource: String,
    pub action: String,
    pub allowed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PermissionResult {
    pub fn allow(check: &PermissionCheck) -> Self {
        Self {
            resource: check.resource.clone(),
            action: check.action.clone(),
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(check: &PermissionCheck, reason: impl Into<String>) -> Self {
        Self {
            resource: check.resource.clone(),
            action: check.action.clone(),
            allowed: false,
            reason: Some(reason.into()),
        }
    }

    /// Whether this result answers the given check
    pub fn answers(&self, check: &PermissionCheck) -> bool {
        self.resource == check.resource && self.action == check.action
    }
}

/// Outcome of `PermissionService::validate_batch`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchValidation {
    pub results: Vec<PermissionResult>,
    pub cache_hit: bool,
    pub response_time: Duration,
}

impl BatchValidation {
    /// True when every check was allowed (false for an empty set)
    pub fn all_allowed(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|r| r.allowed)
    }
}

/// Role row returned by the backing store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRecord {
    /// Role identifier
    pub id: RoleId,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    pub scope_type: ScopeType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
}

impl RoleRecord {
    pub fn new(id: impl Into<String>, scope_type: ScopeType, scope_id: Option<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            scope_type,
            scope_id,
        }
    }
}

/// Cached role list for one (subject, scope type, scope id) triple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleHierarchy {
    pub subject_id: SubjectId,
    pub scope: ScopeType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,

    pub roles: Vec<RoleId>,

    /// Populated lazily by `RoleHierarchyCache::permissions_for`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,

    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RoleHierarchy {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Kind of role mutation carried by a batch request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOperation {
    #[default]
    Assign,
    Revoke,
}

impl BatchOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchOperation::Assign => "assign",
            BatchOperation::Revoke => "revoke",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            BatchOperation::Assign => BatchOperation::Revoke,
            BatchOperation::Revoke => BatchOperation::Assign,
        }
    }
}

/// One role assignment (or revocation) waiting to be flushed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAuthorizationRequest {
    pub subject_id: SubjectId,
    pub role_id: RoleId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_type: Option<ScopeType>,

    #[serde(default)]
    pub operation: BatchOperation,
}

impl BatchAuthorizationRequest {
    pub fn assign(subject_id: impl Into<String>, role_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            role_id: role_id.into(),
            scope_id: None,
            scope_type: None,
            operation: BatchOperation::Assign,
        }
    }

    pub fn revoke(subject_id: impl Into<String>, role_id: impl Into<String>) -> Self {
        Self {
            operation: BatchOperation::Revoke,
            ..Self::assign(subject_id, role_id)
        }
    }

    /// Bind the request to a scope
    pub fn in_scope(mut self, scope: &Scope) -> Self {
        self.scope_type = Some(scope.scope_type);
        self.scope_id = scope.id.clone();
        self
    }

    /// Scope segment used in dedup and cache keys
    pub fn scope_segment(&self) -> String {
        match (&self.scope_type, &self.scope_id) {
            (Some(t), Some(id)) => format!("{}={}", t.as_str(), id),
            (Some(t), None) => t.as_str().to_string(),
            (None, Some(id)) => format!("scope={}", id),
            (None, None) => "global".to_string(),
        }
    }

    /// Dedup key: `(subject, role, scope)`; the operation is deliberately excluded
    pub fn dedup_key(&self) -> String {
        format!("{}|{}|{}", self.subject_id, self.role_id, self.scope_segment())
    }
}

/// Failure record for one request in a flush
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchError {
    pub request: BatchAuthorizationRequest,
    pub error: String,
    pub attempts: u32,
}

/// Outcome of one batch flush
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<BatchError>,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

impl BatchResult {
    pub fn empty() -> Self {
        Self {
            successful: 0,
            failed: 0,
            skipped: 0,
            errors: Vec::new(),
            duration: Duration::ZERO,
            timestamp: Utc::now(),
        }
    }

    /// Number of requests this flush accounted for
    pub fn processed(&self) -> usize {
        self.successful + self.failed + self.skipped
    }
}

/// Raw event delivered by the change feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub subject_id: SubjectId,

    #[serde(default)]
    pub resource: Option<String>,

    #[serde(default)]
    pub action: Option<String>,

    #[serde(default)]
    pub allowed: Option<bool>,

    /// Restricts invalidation to one scope when present
    #[serde(default)]
    pub scope: Option<Scope>,

    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            resource: None,
            action: None,
            allowed: None,
            scope: None,
            occurred_at: None,
        }
    }

    pub fn grant(subject_id: impl Into<String>, resource: impl Into<String>, action: impl Into<String>, allowed: bool) -> Self {
        Self {
            resource: Some(resource.into()),
            action: Some(action.into()),
            allowed: Some(allowed),
            ..Self::new(subject_id)
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }
}

/// Normalized change record handed to listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionChange {
    pub subject_id: SubjectId,
    pub resource: String,
    pub action: String,
    pub allowed: bool,
    pub timestamp: DateTime<Utc>,
}

impl From<&ChangeEvent> for PermissionChange {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            subject_id: event.subject_id.clone(),
            resource: event.resource.clone().unwrap_or_else(|| "*".to_string()),
            action: event.action.clone().unwrap_or_else(|| "*".to_string()),
            allowed: event.allowed.unwrap_or(false),
            timestamp: event.occurred_at.unwrap_or_else(Utc::now),
        }
    }
}
