//! Fault injection rules

use serde::Serialize;
use stackflow_engine::{ProviderError, ResourceType};

/// Kind of provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Create,
    Read,
    Update,
    Delete,
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallKind::Create => write!(f, "create"),
            CallKind::Read => write!(f, "read"),
            CallKind::Update => write!(f, "update"),
            CallKind::Delete => write!(f, "delete"),
        }
    }
}

/// Makes matching calls fail with a chosen error.
///
/// A call matches when its kind is equal and, if set, its resource type and
/// target (the `name` property for creates, the remote id otherwise) match.
#[derive(Debug, Clone)]
pub struct FaultRule {
    kind: CallKind,
    resource_type: Option<ResourceType>,
    target: Option<String>,
    error: ProviderError,
    remaining: Option<u32>,
}

impl FaultRule {
    /// Fail every call of `kind` with a permanent error
    pub fn on(kind: CallKind) -> Self {
        Self {
            kind,
            resource_type: None,
            target: None,
            error: ProviderError::permanent(format!("injected {} failure", kind)),
            remaining: None,
        }
    }

    pub fn for_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = Some(resource_type);
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_error(mut self, error: ProviderError) -> Self {
        self.error = error;
        self
    }

    /// Only fail the first `count` matching calls
    pub fn times(mut self, count: u32) -> Self {
        self.remaining = Some(count);
        self
    }

    pub(crate) fn matches(
        &self,
        kind: CallKind,
        resource_type: ResourceType,
        target: &str,
    ) -> bool {
        self.kind == kind
            && self.resource_type.is_none_or(|t| t == resource_type)
            && self.target.as_deref().is_none_or(|t| t == target)
            && self.remaining != Some(0)
    }

    /// Consume one use of the rule and return its error
    pub(crate) fn fire(&mut self) -> ProviderError {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        self.error.clone()
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}
