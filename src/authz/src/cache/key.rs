//! Cache key grammar and invalidation requests
//!
//! Keys are colon-separated segments, `prefix:subject:scope:...`:
//!
//! ```text
//! perm:<subject>:<scope|global>:batch:<checksum>   validated check-sets
//! perm:<subject>:<scope|global>:all                preloaded permission list
//! role:<subject>:<scope-type>:<scope-id|all>       optimizer role lists
//! hier:<subject>:<scope-type>:<scope-id|all>       assembled hierarchies
//! batch:<op>:<subject>:<scope>:<role>              batch write outcomes
//! ```
//!
//! Keys are pure functions of their inputs, so identical requests always
//! land on the same key.

use blake3::Hasher;
use regex::Regex;

use crate::error::{AuthzError, Result};
use crate::types::{BatchAuthorizationRequest, BatchOperation, PermissionCheck, Scope, ScopeType};

pub const PERMISSION_PREFIX: &str = "perm";
pub const ROLE_PREFIX: &str = "role";
pub const HIERARCHY_PREFIX: &str = "hier";
pub const BATCH_PREFIX: &str = "batch";

const GLOBAL_SCOPE: &str = "global";
const ALL_INSTANCES: &str = "all";

/// Checksum of a check-set: BLAKE3 over the sorted `resource:action` pairs
///
/// Order of the input does not matter; duplicates do.
pub fn checksum(checks: &[PermissionCheck]) -> String {
    let mut pairs: Vec<String> = checks.iter().map(PermissionCheck::pair).collect();
    pairs.sort();

    let mut hasher = Hasher::new();
    for pair in &pairs {
        // Length prefix keeps ["a:b", "c"] and ["a", "b:c"] apart
        hasher.update(&(pair.len() as u64).to_le_bytes());
        hasher.update(pair.as_bytes());
    }

    hasher.finalize().to_hex()[..32].to_string()
}

fn scope_segment(scope: Option<&Scope>) -> String {
    scope.map(Scope::key_segment).unwrap_or_else(|| GLOBAL_SCOPE.to_string())
}

/// Key for a validated check-set
pub fn permission_batch_key(subject_id: &str, scope: Option<&Scope>, checks: &[PermissionCheck]) -> String {
    format!(
        "{}:{}:{}:batch:{}",
        PERMISSION_PREFIX,
        subject_id,
        scope_segment(scope),
        checksum(checks)
    )
}

/// Key for a subject's preloaded permission list
pub fn permission_list_key(subject_id: &str, scope: Option<&Scope>) -> String {
    format!("{}:{}:{}:{}", PERMISSION_PREFIX, subject_id, scope_segment(scope), ALL_INSTANCES)
}

/// Everything cached for a subject within one scope (`global` when unscoped)
pub fn permission_scope_prefix(subject_id: &str, scope: Option<&Scope>) -> String {
    format!("{}:{}:{}:", PERMISSION_PREFIX, subject_id, scope_segment(scope))
}

/// Everything cached for a subject's permissions, all scopes
pub fn permission_subject_prefix(subject_id: &str) -> String {
    format!("{}:{}:", PERMISSION_PREFIX, subject_id)
}

/// Optimizer-level key for one scope instance, or the aggregate when `scope_id` is `None`
pub fn role_key(subject_id: &str, scope_type: ScopeType, scope_id: Option<&str>) -> String {
    format!(
        "{}:{}:{}:{}",
        ROLE_PREFIX,
        subject_id,
        scope_type.as_str(),
        scope_id.unwrap_or(ALL_INSTANCES)
    )
}

/// Optimizer-level keys of one scope type
pub fn role_type_prefix(subject_id: &str, scope_type: ScopeType) -> String {
    format!("{}:{}:{}:", ROLE_PREFIX, subject_id, scope_type.as_str())
}

pub fn role_subject_prefix(subject_id: &str) -> String {
    format!("{}:{}:", ROLE_PREFIX, subject_id)
}

/// Key of an assembled `RoleHierarchy`
pub fn hierarchy_key(subject_id: &str, scope_type: ScopeType, scope_id: Option<&str>) -> String {
    format!(
        "{}:{}:{}:{}",
        HIERARCHY_PREFIX,
        subject_id,
        scope_type.as_str(),
        scope_id.unwrap_or(ALL_INSTANCES)
    )
}

pub fn hierarchy_type_prefix(subject_id: &str, scope_type: ScopeType) -> String {
    format!("{}:{}:{}:", HIERARCHY_PREFIX, subject_id, scope_type.as_str())
}

pub fn hierarchy_subject_prefix(subject_id: &str) -> String {
    format!("{}:{}:", HIERARCHY_PREFIX, subject_id)
}

/// Key recording that a batch write already went through
pub fn batch_outcome_key(request: &BatchAuthorizationRequest, operation: BatchOperation) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        BATCH_PREFIX,
        operation.as_str(),
        request.subject_id,
        request.scope_segment(),
        request.role_id
    )
}

/// Every recorded batch outcome of one operation for a subject
pub fn batch_subject_prefix(subject_id: &str, operation: BatchOperation) -> String {
    format!("{}:{}:{}:", BATCH_PREFIX, operation.as_str(), subject_id)
}

/// Structured invalidation request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Invalidation {
    /// One key, both tiers
    Exact(String),
    /// Every key starting with this literal text
    Prefix(String),
    /// Every key matching a regular expression (anchored on both ends)
    Regex(String),
}

impl Invalidation {
    pub fn exact(key: impl Into<String>) -> Self {
        Self::Exact(key.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self::Regex(pattern.into())
    }

    /// Interpret a legacy string pattern
    ///
    /// A trailing `.*` or `*` marks a prefix pattern; the rest is literal.
    /// Anything else is an exact key.
    pub fn parse(pattern: &str) -> Self {
        if let Some(literal) = pattern.strip_suffix(".*") {
            Self::Prefix(literal.to_string())
        } else if let Some(literal) = pattern.strip_suffix('*') {
            Self::Prefix(literal.to_string())
        } else {
            Self::Exact(pattern.to_string())
        }
    }

    /// Compile the local-tier matcher
    ///
    /// Literal text is regex-escaped before the wildcard is appended, so dots,
    /// spaces and brackets in subject ids stay literal.
    pub fn compile(&self) -> Result<Regex> {
        let source = match self {
            Self::Exact(key) => format!("^{}$", regex::escape(key)),
            Self::Prefix(literal) => format!("^{}.*$", regex::escape(literal)),
            Self::Regex(pattern) => anchor(pattern),
        };

        Regex::new(&source).map_err(|e| AuthzError::InvalidPattern(format!("{}: {}", source, e)))
    }

    /// Native glob for the remote tier's bulk delete
    ///
    /// `None` for exact keys (deleted directly) and for regexes that have no
    /// glob equivalent; the coordinator then scans and filters instead.
    pub fn remote_glob(&self) -> Option<String> {
        match self {
            Self::Exact(_) => None,
            Self::Prefix(literal) => Some(format!("{}*", escape_glob(literal))),
            Self::Regex(pattern) => regex_prefix_literal(pattern).map(|lit| format!("{}*", escape_glob(&lit))),
        }
    }
}

impl From<&str> for Invalidation {
    fn from(pattern: &str) -> Self {
        Self::parse(pattern)
    }
}

fn anchor(pattern: &str) -> String {
    let body = pattern.strip_prefix('^').unwrap_or(pattern);
    let body = body.strip_suffix('$').unwrap_or(body);
    format!("^(?:{})$", body)
}

/// Escape glob metacharacters (`* ? [ ] \`)
pub fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Translate a glob (`*`, `?`, `[...]`, `\x`) into an anchored regex
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut source = String::from("^");
    let mut chars = glob.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => source.push_str(&regex::escape(&escaped.to_string())),
                None => source.push_str(r"\\"),
            },
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            '[' => {
                source.push('[');
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if inner == '\\' || inner == '[' {
                        source.push('\\');
                    }
                    source.push(inner);
                }
                source.push(']');
            }
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');

    Regex::new(&source).map_err(|e| AuthzError::InvalidPattern(format!("{}: {}", glob, e)))
}

/// Recover `literal` from `^?<escaped literal>.*$?`
fn regex_prefix_literal(pattern: &str) -> Option<String> {
    let body = pattern.strip_prefix('^').unwrap_or(pattern);
    let body = body.strip_suffix('$').unwrap_or(body);
    let escaped = body.strip_suffix(".*")?;

    let mut literal = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => literal.push(chars.next()?),
            '.' | '^' | '$' | '|' | '?' | '*' | '+' | '(' | ')' | '[' | ']' | '{' | '}' => return None,
            other => literal.push(other),
        }
    }
    Some(literal)
}
