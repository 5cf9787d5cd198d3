//! Named stack outputs

use crate::error::{NotReadyError, ValidationError};
use crate::graph::ResourceGraph;
use crate::reference::ReferenceStore;
use crate::resource::Reference;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A value exposed after apply, taken from one resource attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub value: Reference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl OutputSpec {
    pub fn new(node: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            value: Reference::new(node, attribute),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutputEmitter {
    outputs: BTreeMap<String, OutputSpec>,
}

impl OutputEmitter {
    pub fn new(outputs: BTreeMap<String, OutputSpec>) -> Self {
        Self { outputs }
    }

    pub fn outputs(&self) -> &BTreeMap<String, OutputSpec> {
        &self.outputs
    }

    /// Reject outputs whose source node is not declared
    pub fn validate(&self, graph: &ResourceGraph) -> Result<(), ValidationError> {
        match self
            .outputs
            .iter()
            .find(|(_, spec)| !graph.contains(&spec.value.node))
        {
            Some((name, spec)) => Err(ValidationError::DanglingOutput {
                output: name.clone(),
                reference: spec.value.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Resolve every output; fails on the first source that is not published yet
    pub fn emit(&self, store: &ReferenceStore) -> Result<BTreeMap<String, Value>, NotReadyError> {
        self.outputs
            .iter()
            .map(|(name, spec)| {
                store
                    .resolve(&spec.value.node, &spec.value.attribute)
                    .map(|value| (name.clone(), value))
            })
            .collect()
    }
}
