//! Planned actions and per-node apply results

use crate::resource::ResourceType;
use serde::{Deserialize, Serialize};

/// Represents a planned action for a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Resource id
    pub node_id: String,

    /// Type of action to perform
    pub action_type: ActionType,

    /// Resource type
    pub resource_type: ResourceType,

    /// Description of the action
    pub description: String,

    /// Property keys whose resolved value differs from the last apply
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<String>,
}

/// Type of action to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource
    Create,
    /// Update an existing resource
    Update,
    /// Delete a resource
    Delete,
    /// No changes needed
    NoOp,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Update => write!(f, "update"),
            ActionType::Delete => write!(f, "delete"),
            ActionType::NoOp => write!(f, "no-op"),
        }
    }
}

/// Plan containing all actions a run would perform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePlan {
    /// List of actions, dependencies first
    pub actions: Vec<Action>,

    /// Whether the plan has any changes
    pub has_changes: bool,
}

impl ChangePlan {
    pub fn new(actions: Vec<Action>) -> Self {
        let has_changes = actions.iter().any(|a| a.action_type != ActionType::NoOp);
        Self {
            actions,
            has_changes,
        }
    }

    /// Get actions by type
    pub fn actions_by_type(&self, action_type: ActionType) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .collect()
    }

    /// Action planned for `node_id`
    pub fn action_for(&self, node_id: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.node_id == node_id)
    }

    /// Summary of the plan
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.actions_by_type(ActionType::Create).len(),
            update: self.actions_by_type(ActionType::Update).len(),
            delete: self.actions_by_type(ActionType::Delete).len(),
            no_change: self.actions_by_type(ActionType::NoOp).len(),
        }
    }
}

/// Summary of planned actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub no_change: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.no_change
        )
    }
}

/// What happened to a single node during a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    Created,
    Updated,
    /// Created again, after the remote object disappeared or changed type
    Recreated,
    Unchanged,
    Deleted,
    Failed { error: String },
    Blocked { reason: String },
}

impl NodeOutcome {
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            NodeOutcome::Created
                | NodeOutcome::Updated
                | NodeOutcome::Recreated
                | NodeOutcome::Deleted
        )
    }
}

/// Result of a single node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    pub resource_type: ResourceType,
    pub batch: usize,
    pub outcome: NodeOutcome,
}

/// Result of an apply or teardown pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Per-node results in completion order
    pub results: Vec<NodeResult>,

    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl ApplyReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        node_id: impl Into<String>,
        resource_type: ResourceType,
        batch: usize,
        outcome: NodeOutcome,
    ) {
        self.results.push(NodeResult {
            node_id: node_id.into(),
            resource_type,
            batch,
            outcome,
        });
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeResult> {
        self.results.iter().find(|r| r.node_id == node_id)
    }

    pub fn outcome(&self, node_id: &str) -> Option<&NodeOutcome> {
        self.get(node_id).map(|r| &r.outcome)
    }

    pub fn failed(&self) -> Vec<String> {
        self.ids_where(|o| matches!(o, NodeOutcome::Failed { .. }))
    }

    pub fn blocked(&self) -> Vec<String> {
        self.ids_where(|o| matches!(o, NodeOutcome::Blocked { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.failed().is_empty() && self.blocked().is_empty()
    }

    pub fn total_changes(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome.is_change())
            .count()
    }

    fn ids_where(&self, predicate: impl Fn(&NodeOutcome) -> bool) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| predicate(&r.outcome))
            .map(|r| r.node_id.clone())
            .collect()
    }
}
