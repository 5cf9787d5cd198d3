//! Resource dependency graph
//!
//! Built from declarations. Dependencies are the union of the ids named by
//! property references and the explicit ordering-only dependencies, so the
//! edge set can be inspected independently of scheduling.

use crate::error::{EngineError, Result, ValidationError};
use crate::resource::{Declaration, NodeState, PropValue, Reference, ResourceType};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// A declared resource together with its lifecycle state
#[derive(Debug, Clone, Serialize)]
pub struct ResourceNode {
    id: String,
    resource_type: ResourceType,
    desired_props: BTreeMap<String, PropValue>,
    dependencies: BTreeSet<String>,
    state: NodeState,
}

impl ResourceNode {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn desired_props(&self) -> &BTreeMap<String, PropValue> {
        &self.desired_props
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// References found in the desired properties
    pub fn references(&self) -> Vec<&Reference> {
        self.desired_props
            .values()
            .flat_map(|value| value.references())
            .collect()
    }
}

/// Validated, acyclic set of resource nodes
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: HashMap<String, ResourceNode>,
    /// Declaration order, used to break ties deterministically
    order: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

impl ResourceGraph {
    /// Build and validate a graph from declarations
    pub fn build(
        declarations: impl IntoIterator<Item = Declaration>,
    ) -> std::result::Result<Self, ValidationError> {
        let mut graph = Self::default();

        for decl in declarations {
            if graph.nodes.contains_key(&decl.id) {
                return Err(ValidationError::DuplicateId(decl.id));
            }

            let mut dependencies: BTreeSet<String> = decl.depends_on.into_iter().collect();
            for value in decl.properties.values() {
                for reference in value.references() {
                    dependencies.insert(reference.node.clone());
                }
            }

            graph.order.push(decl.id.clone());
            graph.nodes.insert(
                decl.id.clone(),
                ResourceNode {
                    id: decl.id,
                    resource_type: decl.resource_type,
                    desired_props: decl.properties,
                    dependencies,
                    state: NodeState::Pending,
                },
            );
        }

        graph.validate()?;
        Ok(graph)
    }

    /// Check that every edge targets a declared node and that there is no cycle
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        for id in &self.order {
            let node = &self.nodes[id];

            for reference in node.references() {
                if !self.nodes.contains_key(&reference.node) {
                    return Err(ValidationError::DanglingReference {
                        node: id.clone(),
                        reference: reference.clone(),
                    });
                }
            }

            for dependency in &node.dependencies {
                if !self.nodes.contains_key(dependency) {
                    return Err(ValidationError::UnknownDependency {
                        node: id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        match self.find_cycle() {
            Some(cycle) => Err(ValidationError::Cycle { cycle }),
            None => Ok(()),
        }
    }

    /// Iterative depth-first search; a back-edge to an in-progress node is a cycle.
    ///
    /// The returned path starts and ends with the same node id.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(self.nodes.len());

        for root in &self.order {
            if marks.contains_key(root.as_str()) {
                continue;
            }

            let mut stack = vec![(root.as_str(), self.nodes[root].dependencies.iter())];
            marks.insert(root, Mark::InProgress);

            loop {
                let Some((current, dependencies)) = stack.last_mut() else {
                    break;
                };
                let current: &str = *current;

                match dependencies.next() {
                    Some(dependency) => match marks.get(dependency.as_str()) {
                        Some(Mark::InProgress) => {
                            let start = stack
                                .iter()
                                .position(|(id, _)| *id == dependency.as_str())
                                .unwrap_or(0);
                            let mut cycle: Vec<String> = stack[start..]
                                .iter()
                                .map(|(id, _)| id.to_string())
                                .collect();
                            cycle.push(dependency.clone());
                            return Some(cycle);
                        }
                        Some(Mark::Done) => {}
                        None => {
                            if let Some(node) = self.nodes.get(dependency) {
                                marks.insert(dependency, Mark::InProgress);
                                stack.push((dependency.as_str(), node.dependencies.iter()));
                            }
                        }
                    },
                    None => {
                        marks.insert(current, Mark::Done);
                        stack.pop();
                    }
                }
            }
        }

        None
    }

    /// Node ids ordered so that every dependency precedes its dependents.
    /// Ties are broken by declaration order.
    pub fn topological_order(&self) -> Vec<String> {
        let position: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut remaining: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut ready = BTreeSet::new();

        for id in &self.order {
            let node = &self.nodes[id];
            remaining.insert(id, node.dependencies.len());
            for dependency in &node.dependencies {
                dependents.entry(dependency.as_str()).or_default().push(id);
            }
            if node.dependencies.is_empty() {
                ready.insert(position[id.as_str()]);
            }
        }

        let mut sorted = Vec::with_capacity(self.order.len());
        while let Some(index) = ready.pop_first() {
            let id = self.order[index].as_str();
            sorted.push(id.to_string());

            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(position[dependent]);
                    }
                }
            }
        }

        sorted
    }

    /// Nodes that directly depend on `id`, in declaration order
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.order
            .iter()
            .filter(|other| self.nodes[*other].dependencies.contains(id))
            .map(String::as_str)
            .collect()
    }

    /// Every node that depends on `id` directly or transitively
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([id.to_string()]);

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(&current) {
                if found.insert(dependent.to_string()) {
                    queue.push_back(dependent.to_string());
                }
            }
        }

        found
    }

    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Node ids in declaration order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Nodes in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &ResourceNode> {
        self.order.iter().map(|id| &self.nodes[id])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Distinct resource types present in the graph
    pub fn resource_types(&self) -> BTreeSet<ResourceType> {
        self.nodes.values().map(|n| n.resource_type).collect()
    }

    /// Ids of nodes currently in `state`, in declaration order
    pub fn ids_in_state(&self, state: NodeState) -> Vec<String> {
        self.iter()
            .filter(|n| n.state == state)
            .map(|n| n.id.clone())
            .collect()
    }

    pub(crate) fn set_state(&mut self, id: &str, next: NodeState) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownNode(id.to_string()))?;

        if node.state == next {
            return Ok(());
        }
        if !node.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                node: id.to_string(),
                from: node.state,
                to: next,
            });
        }

        tracing::debug!("{}: {} -> {}", id, node.state, next);
        node.state = next;
        Ok(())
    }

    /// Drop a node once its remote counterpart is gone
    pub(crate) fn remove(&mut self, id: &str) -> Option<ResourceNode> {
        let node = self.nodes.remove(id)?;
        self.order.retain(|other| other != id);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(id: &str) -> Declaration {
        Declaration::new(id, ResourceType::Network)
    }

    #[test]
    fn test_build_extracts_reference_dependencies() {
        let graph = ResourceGraph::build(vec![
            decl("vpc"),
            Declaration::new("subnet", ResourceType::Subnet)
                .with_ref("vpcId", "vpc", "vpcId"),
            Declaration::new("sg", ResourceType::SecurityGroup)
                .with_ref("vpcId", "vpc", "vpcId")
                .depends_on("subnet"),
        ])
        .unwrap();

        let sg = graph.get("sg").unwrap();
        let deps: Vec<&str> = sg.dependencies().iter().map(String::as_str).collect();
        assert_eq!(deps, vec!["subnet", "vpc"]);
        assert_eq!(sg.state(), NodeState::Pending);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let decls = vec![decl("vpc"), decl("vpc")];
        let err = ResourceGraph::build(decls).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateId("vpc".to_string()));
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let err = ResourceGraph::build(vec![
            Declaration::new("subnet", ResourceType::Subnet)
                .with_ref("vpcId", "missing", "vpcId"),
        ])
        .unwrap_err();

        assert!(matches!(
            err,
            ValidationError::DanglingReference { ref node, ref reference }
                if node == "subnet" && reference.node == "missing"
        ));
    }

    #[test]
    fn test_unknown_ordering_dependency_rejected() {
        let decls = vec![decl("a").depends_on("ghost")];
        let err = ResourceGraph::build(decls).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownDependency { .. }));
    }

    #[test]
    fn test_cycle_reports_nodes_on_cycle() {
        let err = ResourceGraph::build(vec![
            decl("root"),
            decl("a").depends_on("c").depends_on("root"),
            decl("b").depends_on("a"),
            decl("c").depends_on("b"),
        ])
        .unwrap_err();

        let cycle = err.cycle_nodes().expect("cycle error");
        assert_eq!(cycle.first(), cycle.last());
        for id in ["a", "b", "c"] {
            assert!(cycle.contains(&id.to_string()), "{} missing", id);
        }
        assert!(!cycle.iter().any(|n| n == "root"));
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let err = ResourceGraph::build(vec![
            Declaration::new("sg", ResourceType::SecurityGroup)
                .with_ref("peer", "sg", "groupId"),
        ])
        .unwrap_err();
        assert_eq!(
            err.cycle_nodes(),
            Some(&["sg".to_string(), "sg".to_string()][..])
        );
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let graph = ResourceGraph::build(vec![
            decl("listener").depends_on("lb").depends_on("tg"),
            decl("tg").depends_on("web1").depends_on("web2"),
            decl("web2").depends_on("sg"),
            decl("lb").depends_on("tg"),
            decl("web1").depends_on("sg"),
            decl("sg"),
        ])
        .unwrap();

        let order = graph.topological_order();
        assert_eq!(order.len(), graph.len());
        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        for node in graph.iter() {
            for dep in node.dependencies() {
                assert!(pos(dep) < pos(node.id()), "{} before {}", dep, node.id());
            }
        }
        // declaration order breaks ties between web2 and web1
        assert!(pos("web2") < pos("web1"));
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = ResourceGraph::build(vec![
            decl("vpc"),
            decl("subnet").depends_on("vpc"),
            decl("web").depends_on("subnet"),
            decl("other"),
        ])
        .unwrap();

        let found: Vec<String> = graph.transitive_dependents("vpc").into_iter().collect();
        assert_eq!(found, vec!["subnet", "web"]);
        assert!(graph.transitive_dependents("other").is_empty());
    }

    #[test]
    fn test_set_state_rejects_backward_transition() {
        let mut graph = ResourceGraph::build(vec![decl("vpc")]).unwrap();
        graph.set_state("vpc", NodeState::Creating).unwrap();
        graph.set_state("vpc", NodeState::Created).unwrap();

        let err = graph.set_state("vpc", NodeState::Creating).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_remove_drops_node_from_order() {
        let mut graph = ResourceGraph::build(vec![decl("a"), decl("b")]).unwrap();
        assert!(graph.remove("a").is_some());
        assert_eq!(graph.ids().collect::<Vec<_>>(), vec!["b"]);
        assert!(graph.remove("a").is_none());
    }
}
