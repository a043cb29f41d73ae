use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use thiserror::Error;

static CQ_AT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[CQ:at,qq=(\d+)\]").expect("valid regex"));
static AT_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[At:(\d+)\]").expect("valid regex"));
static PAREN_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\((\d+)\)").expect("valid regex"));

/// Access-control failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessError {
    /// Caller may not perform the operation.
    #[error("operator '{0}' is not permitted to do this")]
    Denied(String),
    /// Input does not carry a numeric operator id.
    #[error("'{0}' is not a valid operator id or mention")]
    InvalidOperator(String),
    /// Backing store failed.
    #[error("operator store: {0}")]
    Storage(String),
}

/// Whether a grant or revoke changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    /// The registry was updated.
    Changed,
    /// The operator was already in the requested state.
    Unchanged,
}

/// Source of truth for who may drive the fleet.
pub trait OperatorRegistry: Send + Sync {
    /// Admins are always authorized.
    fn is_authorized(&self, operator: &str) -> bool;
    /// True for configured admins.
    fn is_admin(&self, operator: &str) -> bool;
    /// Authorizes an operator.
    fn add(&self, operator: &str) -> Result<GrantOutcome, AccessError>;
    /// Withdraws an operator.
    fn remove(&self, operator: &str) -> Result<GrantOutcome, AccessError>;
    /// Authorized operators, sorted.
    fn list(&self) -> Vec<String>;
}

/// Pulls the operator id out of a chat mention or plain text.
///
/// Recognizes `[CQ:at,qq=ID]`, `[At:ID]` and `Name(ID)`; anything else is
/// returned trimmed.
#[must_use]
pub fn extract_operator_id(raw: &str) -> String {
    let raw = raw.trim();
    [&*CQ_AT, &*AT_TAG, &*PAREN_ID]
        .into_iter()
        .find_map(|pattern| pattern.captures(raw))
        .and_then(|caps| caps.get(1))
        .map_or_else(|| raw.to_string(), |id| id.as_str().to_string())
}

/// Like [`extract_operator_id`] but only accepts numeric ids.
pub fn normalize_operator_id(raw: &str) -> Result<String, AccessError> {
    let id = extract_operator_id(raw);
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        Ok(id)
    } else {
        Err(AccessError::InvalidOperator(id))
    }
}

/// Fails unless `operator` may drive the fleet.
pub fn ensure_authorized(registry: &dyn OperatorRegistry, operator: &str) -> Result<(), AccessError> {
    if registry.is_authorized(operator) {
        Ok(())
    } else {
        Err(AccessError::Denied(operator.to_string()))
    }
}

/// Admin-only: authorizes the operator named by `target`.
pub fn grant(
    registry: &dyn OperatorRegistry,
    actor: &str,
    target: &str,
) -> Result<(String, GrantOutcome), AccessError> {
    if !registry.is_admin(actor) {
        return Err(AccessError::Denied(actor.to_string()));
    }
    let id = normalize_operator_id(target)?;
    let outcome = registry.add(&id)?;
    Ok((id, outcome))
}

/// Admin-only: withdraws the operator named by `target`.
pub fn revoke(
    registry: &dyn OperatorRegistry,
    actor: &str,
    target: &str,
) -> Result<(String, GrantOutcome), AccessError> {
    if !registry.is_admin(actor) {
        return Err(AccessError::Denied(actor.to_string()));
    }
    let id = normalize_operator_id(target)?;
    let outcome = registry.remove(&id)?;
    Ok((id, outcome))
}

/// In-memory registry.
#[derive(Debug, Default)]
pub struct MemoryOperatorRegistry {
    admins: BTreeSet<String>,
    operators: RwLock<BTreeSet<String>>,
}

impl MemoryOperatorRegistry {
    /// Registry with the given admins and no other operators.
    #[must_use]
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
            operators: RwLock::new(BTreeSet::new()),
        }
    }

    /// Seeds authorized operators.
    #[must_use]
    pub fn with_operators<I, S>(self, operators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operators
            .write()
            .extend(operators.into_iter().map(Into::into));
        self
    }
}

impl OperatorRegistry for MemoryOperatorRegistry {
    fn is_authorized(&self, operator: &str) -> bool {
        self.is_admin(operator) || self.operators.read().contains(operator)
    }

    fn is_admin(&self, operator: &str) -> bool {
        self.admins.contains(operator)
    }

    fn add(&self, operator: &str) -> Result<GrantOutcome, AccessError> {
        Ok(if self.operators.write().insert(operator.to_string()) {
            GrantOutcome::Changed
        } else {
            GrantOutcome::Unchanged
        })
    }

    fn remove(&self, operator: &str) -> Result<GrantOutcome, AccessError> {
        Ok(if self.operators.write().remove(operator) {
            GrantOutcome::Changed
        } else {
            GrantOutcome::Unchanged
        })
    }

    fn list(&self) -> Vec<String> {
        self.operators.read().iter().cloned().collect()
    }
}
