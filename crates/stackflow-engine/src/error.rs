//! Engine error types

use crate::action::ApplyReport;
use crate::resource::{NodeState, Reference, ResourceType};
use thiserror::Error;

/// Declaration set rejected before any remote side effect
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Duplicate resource id: {0}")]
    DuplicateId(String),

    #[error("Resource {node} references unknown resource in {reference}")]
    DanglingReference { node: String, reference: Reference },

    #[error("Resource {node} depends on unknown resource {dependency}")]
    UnknownDependency { node: String, dependency: String },

    #[error("Output {output} references unknown resource in {reference}")]
    DanglingOutput {
        output: String,
        reference: Reference,
    },

    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },
}

impl ValidationError {
    /// Node ids on the detected cycle, if this is a cycle error
    pub fn cycle_nodes(&self) -> Option<&[String]> {
        match self {
            ValidationError::Cycle { cycle } => Some(cycle),
            _ => None,
        }
    }
}

/// An attribute was read before its producing resource was created
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotReadyError {
    #[error("Attribute {node}.{attribute} is not available: {node} has not been created")]
    NodeNotCreated { node: String, attribute: String },

    #[error("Resource {node} has been created but exposes no attribute {attribute}")]
    MissingAttribute { node: String, attribute: String },
}

impl NotReadyError {
    pub fn node(&self) -> &str {
        match self {
            NotReadyError::NodeNotCreated { node, .. }
            | NotReadyError::MissingAttribute { node, .. } => node,
        }
    }
}

/// Failure reported by a provider adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Retryable failure (timeouts, throttling)
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// Non-retryable failure (invalid configuration, quota exceeded)
    #[error("Permanent provider error: {0}")]
    Permanent(String),

    /// The remote object no longer exists
    #[error("Remote resource not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        ProviderError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ProviderError::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// One or more resources ended the pass in a failed state
#[derive(Error, Debug, Clone)]
#[error(
    "Apply finished with {} failed and {} blocked resources (failed: [{}], blocked: [{}])",
    .failed.len(),
    .blocked.len(),
    .failed.join(", "),
    .blocked.join(", ")
)]
pub struct PartialApplyError {
    pub failed: Vec<String>,
    pub blocked: Vec<String>,
    pub report: Box<ApplyReport>,
}

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Reference not ready: {0}")]
    NotReady(#[from] NotReadyError),

    #[error("{0}")]
    PartialApply(#[from] PartialApplyError),

    #[error("No provider adapter registered for resource type {0}")]
    NoAdapter(ResourceType),

    #[error("Unknown resource: {0}")]
    UnknownNode(String),

    #[error("Invalid state transition for {node}: {from} -> {to}")]
    InvalidTransition {
        node: String,
        from: NodeState,
        to: NodeState,
    },

    #[error("Attributes for {0} were already published in this run")]
    AlreadyPublished(String),

    #[error(
        "Cancelled after {completed} of {total} batches; not started: [{}]",
        .pending.join(", ")
    )]
    Cancelled {
        completed: usize,
        total: usize,
        pending: Vec<String>,
    },

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
