//! Batch scheduling
//!
//! A node's batch index is one more than the highest batch index among its
//! dependencies (zero without dependencies). Nodes in the same batch run
//! concurrently; batches run one after another.

use crate::graph::ResourceGraph;
use serde::Serialize;
use std::collections::HashMap;

/// Nodes eligible to run concurrently
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub index: usize,
    pub nodes: Vec<String>,
}

/// Ordered sequence of batches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Schedule {
    batches: Vec<Batch>,
}

impl Schedule {
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Batch index assigned to `id`
    pub fn batch_of(&self, id: &str) -> Option<usize> {
        self.batches
            .iter()
            .find(|b| b.nodes.iter().any(|n| n == id))
            .map(|b| b.index)
    }

    pub fn node_count(&self) -> usize {
        self.batches.iter().map(|b| b.nodes.len()).sum()
    }

    /// Node ids from batch `from` onwards
    pub fn nodes_from(&self, from: usize) -> Vec<String> {
        self.batches
            .iter()
            .skip(from)
            .flat_map(|b| b.nodes.iter().cloned())
            .collect()
    }

    fn from_levels(order: &[String], levels: &HashMap<String, usize>) -> Self {
        let mut batches: Vec<Batch> = Vec::new();
        for id in order {
            let index = levels[id];
            while batches.len() <= index {
                batches.push(Batch {
                    index: batches.len(),
                    nodes: Vec::new(),
                });
            }
            batches[index].nodes.push(id.clone());
        }
        Self { batches }
    }
}

/// Batches for the create/update pass
pub fn plan(graph: &ResourceGraph) -> Schedule {
    let order = graph.topological_order();
    let mut levels: HashMap<String, usize> = HashMap::with_capacity(order.len());

    for id in &order {
        let level = graph
            .get(id)
            .map(|node| {
                node.dependencies()
                    .iter()
                    .filter_map(|dep| levels.get(dep))
                    .map(|level| level + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        levels.insert(id.clone(), level);
    }

    let schedule = Schedule::from_levels(&order, &levels);
    tracing::debug!(
        "Scheduled {} resources into {} batches",
        schedule.node_count(),
        schedule.len()
    );
    schedule
}

/// Batches for the delete pass: every node lands after all of its dependents
pub fn plan_teardown(graph: &ResourceGraph) -> Schedule {
    let mut order = graph.topological_order();
    order.reverse();
    let mut levels: HashMap<String, usize> = HashMap::with_capacity(order.len());

    for id in &order {
        let level = graph
            .dependents(id)
            .into_iter()
            .filter_map(|dependent| levels.get(dependent))
            .map(|level| level + 1)
            .max()
            .unwrap_or(0);
        levels.insert(id.clone(), level);
    }

    Schedule::from_levels(&order, &levels)
}
