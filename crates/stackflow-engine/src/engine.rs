//! Engine facade: one call per run, state file handling included

use crate::action::{ApplyReport, ChangePlan};
use crate::error::Result;
use crate::graph::ResourceGraph;
use crate::output::{OutputEmitter, OutputSpec};
use crate::provider::ProviderRegistry;
use crate::reconciler::{ReconcileOptions, Reconciler};
use crate::reference::ReferenceStore;
use crate::resource::Declaration;
use crate::scheduler::{self, Schedule};
use crate::state::StateManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// A named set of declarations plus the outputs it exposes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    pub name: String,

    #[serde(default)]
    pub resources: Vec<Declaration>,

    #[serde(default)]
    pub outputs: BTreeMap<String, OutputSpec>,
}

impl Stack {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn resource(mut self, declaration: Declaration) -> Self {
        self.resources.push(declaration);
        self
    }

    pub fn output(mut self, name: impl Into<String>, spec: OutputSpec) -> Self {
        self.outputs.insert(name.into(), spec);
        self
    }

    /// Build and validate the graph and outputs of this stack
    pub fn compile(&self) -> Result<(ResourceGraph, OutputEmitter)> {
        let graph = ResourceGraph::build(self.resources.iter().cloned())?;
        let emitter = OutputEmitter::new(self.outputs.clone());
        emitter.validate(&graph)?;
        Ok((graph, emitter))
    }
}

/// Result of a successful apply
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub schedule: Schedule,
    pub report: ApplyReport,
    pub outputs: BTreeMap<String, Value>,
}

pub struct Engine {
    registry: ProviderRegistry,
    options: ReconcileOptions,
    state: StateManager,
}

impl Engine {
    pub fn new(registry: ProviderRegistry, state: StateManager) -> Self {
        Self {
            registry,
            options: ReconcileOptions::default(),
            state,
        }
    }

    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Compute the change plan against the recorded state, without side effects
    pub async fn plan(&self, stack: &Stack) -> Result<ChangePlan> {
        let (graph, _) = stack.compile()?;
        let snapshot = self.state.load().await?;
        let reconciler = Reconciler::new(self.registry.clone(), snapshot, self.options.clone());
        Ok(reconciler.preview(&graph))
    }

    /// Apply `stack` and resolve its outputs.
    ///
    /// The snapshot is saved whether or not the pass succeeded, so a later
    /// run picks up what was created.
    pub async fn apply(&self, stack: &Stack, cancel: &CancellationToken) -> Result<Deployment> {
        let (mut graph, emitter) = stack.compile()?;
        let schedule = scheduler::plan(&graph);
        tracing::info!(
            "Applying stack {}: {} resources in {} batches",
            stack.name,
            graph.len(),
            schedule.len()
        );

        let lock = self.state.acquire_lock().await?;
        let snapshot = self.state.load().await?;

        let mut reconciler = Reconciler::new(self.registry.clone(), snapshot, self.options.clone());
        let store = ReferenceStore::new();
        let result = reconciler
            .apply(&mut graph, &schedule, &store, cancel)
            .await;

        let saved = self.state.save(reconciler.snapshot()).await;
        lock.release().await?;
        saved?;

        let report = result?;
        tracing::debug!("{} resources published attributes", store.len());
        let outputs = emitter.emit(&store)?;
        Ok(Deployment {
            schedule,
            report,
            outputs,
        })
    }

    /// Delete every resource of `stack` that the snapshot knows about
    pub async fn destroy(&self, stack: &Stack, cancel: &CancellationToken) -> Result<ApplyReport> {
        let (mut graph, _) = stack.compile()?;
        tracing::info!("Destroying stack {}", stack.name);

        let lock = self.state.acquire_lock().await?;
        let snapshot = self.state.load().await?;

        let mut reconciler = Reconciler::new(self.registry.clone(), snapshot, self.options.clone());
        let result = reconciler.destroy(&mut graph, cancel).await;

        let saved = self.state.save(reconciler.snapshot()).await;
        lock.release().await?;
        saved?;

        result
    }
}
