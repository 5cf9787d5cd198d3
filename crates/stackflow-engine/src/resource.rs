//! Resource declarations and property values
//!
//! A declaration is plain data: an id, a resource type, a set of
//! properties and optional ordering-only dependencies. Property values may
//! point at attributes of other resources through [`Reference`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Attributes reported by a provider for a materialized resource
pub type Attributes = BTreeMap<String, Value>;

/// Properties with every reference substituted by a concrete value
pub type ResolvedProps = BTreeMap<String, Value>;

/// Kind of infrastructure resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Network,
    Subnet,
    SecurityGroup,
    Instance,
    LoadBalancer,
    TargetGroup,
    Listener,
}

impl ResourceType {
    pub const ALL: [ResourceType; 7] = [
        ResourceType::Network,
        ResourceType::Subnet,
        ResourceType::SecurityGroup,
        ResourceType::Instance,
        ResourceType::LoadBalancer,
        ResourceType::TargetGroup,
        ResourceType::Listener,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Network => "network",
            ResourceType::Subnet => "subnet",
            ResourceType::SecurityGroup => "security_group",
            ResourceType::Instance => "instance",
            ResourceType::LoadBalancer => "load_balancer",
            ResourceType::TargetGroup => "target_group",
            ResourceType::Listener => "listener",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pointer to an attribute of another resource that is only known once
/// that resource has been created
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    /// Id of the producing resource
    pub node: String,

    /// Attribute name on the producing resource
    pub attribute: String,
}

impl Reference {
    pub fn new(node: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            attribute: attribute.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.attribute)
    }
}

/// A declared property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropValue {
    /// A concrete JSON value
    Literal(Value),
    /// An attribute of another resource
    Ref(Reference),
    /// A list mixing literals and references
    List(Vec<PropValue>),
}

impl PropValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        PropValue::Literal(value.into())
    }

    pub fn reference(node: impl Into<String>, attribute: impl Into<String>) -> Self {
        PropValue::Ref(Reference::new(node, attribute))
    }

    /// All references contained in this value, depth first
    pub fn references(&self) -> Vec<&Reference> {
        let mut found = Vec::new();
        self.collect_references(&mut found);
        found
    }

    fn collect_references<'a>(&'a self, found: &mut Vec<&'a Reference>) {
        match self {
            PropValue::Literal(_) => {}
            PropValue::Ref(reference) => found.push(reference),
            PropValue::List(items) => {
                for item in items {
                    item.collect_references(found);
                }
            }
        }
    }

    /// Substitute references using `lookup`, producing a concrete value
    pub fn resolve_with<E, F>(&self, lookup: &mut F) -> Result<Value, E>
    where
        F: FnMut(&Reference) -> Result<Value, E>,
    {
        match self {
            PropValue::Literal(value) => Ok(value.clone()),
            PropValue::Ref(reference) => lookup(reference),
            PropValue::List(items) => items
                .iter()
                .map(|item| item.resolve_with(lookup))
                .collect::<Result<Vec<_>, E>>()
                .map(Value::Array),
        }
    }
}

impl From<Reference> for PropValue {
    fn from(reference: Reference) -> Self {
        PropValue::Ref(reference)
    }
}

impl From<Value> for PropValue {
    fn from(value: Value) -> Self {
        PropValue::Literal(value)
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::Literal(Value::from(value))
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        PropValue::Literal(Value::from(value))
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        PropValue::Literal(Value::from(value))
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Literal(Value::from(value))
    }
}

impl From<Vec<PropValue>> for PropValue {
    fn from(items: Vec<PropValue>) -> Self {
        PropValue::List(items)
    }
}

/// Resolve every property of a map with the same lookup
pub fn resolve_props<E, F>(
    props: &BTreeMap<String, PropValue>,
    mut lookup: F,
) -> Result<ResolvedProps, E>
where
    F: FnMut(&Reference) -> Result<Value, E>,
{
    props
        .iter()
        .map(|(key, value)| {
            value
                .resolve_with(&mut lookup)
                .map(|resolved| (key.clone(), resolved))
        })
        .collect()
}

/// Declaration of a single resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    /// Unique resource id
    pub id: String,

    /// Resource type
    #[serde(rename = "type")]
    pub resource_type: ResourceType,

    /// Desired properties
    #[serde(default)]
    pub properties: BTreeMap<String, PropValue>,

    /// Ordering-only dependencies (in addition to those implied by references)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl Declaration {
    pub fn new(id: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            id: id.into(),
            resource_type,
            properties: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_ref(
        mut self,
        key: impl Into<String>,
        node: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Self {
        self.properties
            .insert(key.into(), PropValue::reference(node, attribute));
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }
}

/// Lifecycle state of a resource node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Blocked,
    Creating,
    Created,
    Updating,
    Deleted,
    Failed,
}

impl NodeState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Pending, Blocked | Creating | Updating | Created | Failed | Deleted)
                | (Creating, Created | Failed)
                | (Updating, Created | Failed)
                | (Created, Updating | Blocked | Deleted)
                | (Failed, Pending | Deleted)
                | (Blocked, Pending | Deleted)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::Blocked => "blocked",
            NodeState::Creating => "creating",
            NodeState::Created => "created",
            NodeState::Updating => "updating",
            NodeState::Deleted => "deleted",
            NodeState::Failed => "failed",
        };
        f.write_str(s)
    }
}
