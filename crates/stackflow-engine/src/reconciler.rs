//! Reconciler - drives remote state toward the declared state
//!
//! Batches run strictly one after another. Inside a batch every node is
//! handed to a worker task; a semaphore bounds how many provider calls are
//! in flight. Workers only talk to the provider, all bookkeeping (node
//! state, published attributes, snapshot) happens on the calling task once
//! the whole batch has finished.

use crate::action::{Action, ActionType, ApplyReport, ChangePlan, NodeOutcome};
use crate::error::{EngineError, PartialApplyError, ProviderError, Result};
use crate::graph::{ResourceGraph, ResourceNode};
use crate::provider::{ProviderAdapter, ProviderRegistry, RetryConfig, with_retry};
use crate::reference::ReferenceStore;
use crate::resource::{Attributes, NodeState, ResolvedProps, ResourceType, resolve_props};
use crate::scheduler::{self, Schedule};
use crate::state::{ResourceRecord, StateSnapshot};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Options for a reconcile pass
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Maximum number of provider calls in flight
    pub max_workers: usize,

    /// Retry policy for transient provider errors
    pub retry: RetryConfig,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            retry: RetryConfig::default(),
        }
    }
}

enum Operation {
    Create {
        props: ResolvedProps,
    },
    /// Props match the last apply: read only
    Refresh {
        remote_id: String,
        props: ResolvedProps,
    },
    Update {
        remote_id: String,
        props: ResolvedProps,
    },
    /// The recorded object has another type: delete it, then create
    Replace {
        previous: Arc<dyn ProviderAdapter>,
        previous_id: String,
        props: ResolvedProps,
    },
    Delete {
        remote_id: String,
    },
}

impl Operation {
    /// State the node holds while the call is in flight, if it changes
    fn in_flight_state(&self, current: NodeState) -> Option<NodeState> {
        match self {
            Operation::Delete { .. } => None,
            Operation::Update { .. } => Some(NodeState::Updating),
            _ if current == NodeState::Created => Some(NodeState::Updating),
            Operation::Refresh { .. } => None,
            Operation::Create { .. } | Operation::Replace { .. } => Some(NodeState::Creating),
        }
    }
}

struct Job {
    node_id: String,
    resource_type: ResourceType,
    adapter: Arc<dyn ProviderAdapter>,
    operation: Operation,
}

enum Change {
    Created,
    Updated,
    Recreated,
    Unchanged,
    Deleted,
}

struct Applied {
    change: Change,
    remote_id: String,
    props: ResolvedProps,
    attributes: Attributes,
}

struct Completed {
    node_id: String,
    resource_type: ResourceType,
    result: ProviderResult<Applied>,
}

pub struct Reconciler {
    registry: ProviderRegistry,
    snapshot: StateSnapshot,
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(
        registry: ProviderRegistry,
        snapshot: StateSnapshot,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            registry,
            snapshot,
            options,
        }
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> StateSnapshot {
        self.snapshot
    }

    /// Compute the actions an apply would take, without calling any provider
    pub fn preview(&self, graph: &ResourceGraph) -> ChangePlan {
        let mut actions = Vec::new();

        for id in graph.topological_order() {
            let Some(node) = graph.get(&id) else {
                continue;
            };
            let resource_type = node.resource_type();

            let (action_type, description, changed) = match self.snapshot.get(&id) {
                None => (
                    ActionType::Create,
                    format!("create {} {}", resource_type, id),
                    Vec::new(),
                ),
                Some(record) if record.resource_type != resource_type => (
                    ActionType::Create,
                    format!(
                        "replace {} {} with a new {}",
                        record.resource_type, id, resource_type
                    ),
                    Vec::new(),
                ),
                Some(record) => match self.recorded_props(node) {
                    Some(props) => {
                        let changed = record.changed_keys(&props);
                        if changed.is_empty() {
                            (
                                ActionType::NoOp,
                                format!("{} {} is up to date", resource_type, id),
                                changed,
                            )
                        } else {
                            (
                                ActionType::Update,
                                format!("update {} {} ({})", resource_type, id, changed.join(", ")),
                                changed,
                            )
                        }
                    }
                    None => (
                        ActionType::Update,
                        format!("update {} {} (inputs known after apply)", resource_type, id),
                        Vec::new(),
                    ),
                },
            };

            actions.push(Action {
                node_id: id,
                action_type,
                resource_type,
                description,
                changed,
            });
        }

        for (id, record) in &self.snapshot.resources {
            if !graph.contains(id) {
                actions.push(Action {
                    node_id: id.clone(),
                    action_type: ActionType::Delete,
                    resource_type: record.resource_type,
                    description: format!(
                        "delete {} {} (no longer declared)",
                        record.resource_type, id
                    ),
                    changed: Vec::new(),
                });
            }
        }

        ChangePlan::new(actions)
    }

    /// Create or update every node of `graph`, batch by batch.
    ///
    /// `store` must be fresh for this run. Cancellation is honoured between
    /// batches only.
    pub async fn apply(
        &mut self,
        graph: &mut ResourceGraph,
        schedule: &Schedule,
        store: &ReferenceStore,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport> {
        self.ensure_adapters(graph)?;
        self.requeue(graph)?;
        self.warn_undeclared(graph);

        let started = Instant::now();
        let mut report = ApplyReport::new();
        let total = schedule.len();

        for batch in schedule.batches() {
            if cancel.is_cancelled() {
                return Err(cancelled(graph, schedule, batch.index));
            }

            tracing::info!(
                "Batch {}/{}: {}",
                batch.index + 1,
                total,
                batch.nodes.join(", ")
            );

            let mut jobs = Vec::with_capacity(batch.nodes.len());
            for id in &batch.nodes {
                let job = self.prepare(graph, schedule, store, id, batch.index, &mut report)?;
                jobs.extend(job);
            }

            for done in self.run_batch(jobs).await {
                self.record(graph, schedule, store, done, batch.index, &mut report)?;
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            "Apply finished: {} changed, {} failed, {} blocked in {}ms",
            report.total_changes(),
            report.failed().len(),
            report.blocked().len(),
            report.duration_ms
        );
        finish(report)
    }

    /// Delete every node of `graph` in reverse dependency order.
    ///
    /// A node is only deleted once all of its dependents are gone; deleted
    /// nodes are removed from the graph and from the snapshot.
    pub async fn destroy(
        &mut self,
        graph: &mut ResourceGraph,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport> {
        self.ensure_adapters(graph)?;

        let started = Instant::now();
        let schedule = scheduler::plan_teardown(graph);
        let mut report = ApplyReport::new();
        let total = schedule.len();

        for batch in schedule.batches() {
            if cancel.is_cancelled() {
                return Err(cancelled(graph, &schedule, batch.index));
            }

            tracing::info!(
                "Teardown batch {}/{}: {}",
                batch.index + 1,
                total,
                batch.nodes.join(", ")
            );

            let mut jobs = Vec::new();
            for id in &batch.nodes {
                let Some(node) = graph.get(id) else {
                    continue;
                };
                let resource_type = node.resource_type();

                let remaining = graph.dependents(id).first().map(|d| d.to_string());
                if let Some(dependent) = remaining {
                    report.push(
                        id,
                        resource_type,
                        batch.index,
                        NodeOutcome::Blocked {
                            reason: format!("dependent resource {} was not deleted", dependent),
                        },
                    );
                    continue;
                }

                match self.snapshot.get(id) {
                    None => {
                        tracing::debug!("{} was never materialized, nothing to delete", id);
                        graph.set_state(id, NodeState::Deleted)?;
                        graph.remove(id);
                        report.push(id, resource_type, batch.index, NodeOutcome::Unchanged);
                    }
                    Some(record) => jobs.push(Job {
                        node_id: id.clone(),
                        resource_type,
                        adapter: self.adapter(record.resource_type)?,
                        operation: Operation::Delete {
                            remote_id: record.remote_id.clone(),
                        },
                    }),
                }
            }

            for done in self.run_batch(jobs).await {
                let Completed {
                    node_id,
                    resource_type,
                    result,
                } = done;

                match result {
                    Ok(_) => {
                        graph.set_state(&node_id, NodeState::Deleted)?;
                        graph.remove(&node_id);
                        self.snapshot.remove_record(&node_id);
                        tracing::info!("Deleted {} {}", resource_type, node_id);
                        report.push(node_id, resource_type, batch.index, NodeOutcome::Deleted);
                    }
                    Err(err) => {
                        tracing::error!("Failed to delete {} {}: {}", resource_type, node_id, err);
                        report.push(
                            node_id,
                            resource_type,
                            batch.index,
                            NodeOutcome::Failed {
                                error: err.to_string(),
                            },
                        );
                    }
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        finish(report)
    }

    fn adapter(&self, resource_type: ResourceType) -> Result<Arc<dyn ProviderAdapter>> {
        self.registry
            .get(resource_type)
            .ok_or(EngineError::NoAdapter(resource_type))
    }

    /// Every type the pass may call: declared types, plus the recorded
    /// type of nodes that changed type
    fn ensure_adapters(&self, graph: &ResourceGraph) -> Result<()> {
        let replaced = graph.iter().filter_map(|node| {
            let recorded = self.snapshot.get(node.id())?.resource_type;
            (recorded != node.resource_type()).then_some(recorded)
        });
        let missing = self
            .registry
            .missing_for(graph)
            .into_iter()
            .chain(replaced.filter(|t| self.registry.get(*t).is_none()))
            .next();

        match missing {
            Some(resource_type) => Err(EngineError::NoAdapter(resource_type)),
            None => Ok(()),
        }
    }

    /// Nodes left failed or blocked by an earlier pass get another attempt
    fn requeue(&self, graph: &mut ResourceGraph) -> Result<()> {
        for state in [NodeState::Failed, NodeState::Blocked] {
            for id in graph.ids_in_state(state) {
                graph.set_state(&id, NodeState::Pending)?;
            }
        }
        Ok(())
    }

    fn warn_undeclared(&self, graph: &ResourceGraph) {
        for (id, record) in &self.snapshot.resources {
            if !graph.contains(id) {
                tracing::warn!(
                    "{} {} ({}) is no longer declared and will not be deleted automatically",
                    record.resource_type,
                    id,
                    record.remote_id
                );
            }
        }
    }

    /// Desired props resolved against recorded attributes only
    fn recorded_props(&self, node: &ResourceNode) -> Option<ResolvedProps> {
        resolve_props(node.desired_props(), |reference| {
            self.snapshot
                .get(&reference.node)
                .and_then(|r| r.attributes.get(&reference.attribute).cloned())
                .ok_or(())
        })
        .ok()
    }

    /// Decide which provider call a node needs, or skip it
    fn prepare(
        &self,
        graph: &mut ResourceGraph,
        schedule: &Schedule,
        store: &ReferenceStore,
        id: &str,
        batch: usize,
        report: &mut ApplyReport,
    ) -> Result<Option<Job>> {
        let node = graph
            .get(id)
            .ok_or_else(|| EngineError::UnknownNode(id.to_string()))?;
        let resource_type = node.resource_type();
        let state = node.state();

        if state == NodeState::Blocked {
            // Already reported when the upstream failure was recorded
            return Ok(None);
        }

        let unavailable = node.dependencies().iter().find_map(|dep| {
            graph
                .get(dep)
                .filter(|d| d.state() != NodeState::Created)
                .map(|d| (dep.clone(), d.state()))
        });
        if let Some((dependency, dependency_state)) = unavailable {
            mark_blocked(graph, id)?;
            report.push(
                id,
                resource_type,
                batch,
                NodeOutcome::Blocked {
                    reason: format!("dependency {} is {}", dependency, dependency_state),
                },
            );
            return Ok(None);
        }

        let props = match store.resolve_props(node.desired_props()) {
            Ok(props) => props,
            Err(err) => {
                tracing::error!(
                    "{} was scheduled before its inputs were ready: {}",
                    id,
                    err
                );
                mark_blocked(graph, id)?;
                report.push(
                    id,
                    resource_type,
                    batch,
                    NodeOutcome::Blocked {
                        reason: err.to_string(),
                    },
                );
                self.block_dependents(graph, schedule, id, report)?;
                return Ok(None);
            }
        };

        let operation = match self.snapshot.get(id) {
            None => Operation::Create { props },
            Some(record) if record.resource_type != resource_type => {
                tracing::warn!(
                    "{} was recorded as {} but is now declared as {}; replacing {}",
                    id,
                    record.resource_type,
                    resource_type,
                    record.remote_id
                );
                Operation::Replace {
                    previous: self.adapter(record.resource_type)?,
                    previous_id: record.remote_id.clone(),
                    props,
                }
            }
            Some(record) if record.last_applied == props => Operation::Refresh {
                remote_id: record.remote_id.clone(),
                props,
            },
            Some(record) => {
                tracing::debug!(
                    "{} changed: {}",
                    id,
                    record.changed_keys(&props).join(", ")
                );
                Operation::Update {
                    remote_id: record.remote_id.clone(),
                    props,
                }
            }
        };

        if let Some(next) = operation.in_flight_state(state) {
            graph.set_state(id, next)?;
        }

        Ok(Some(Job {
            node_id: id.to_string(),
            resource_type,
            adapter: self.adapter(resource_type)?,
            operation,
        }))
    }

    /// Run every job of one batch and wait for all of them
    async fn run_batch(&self, jobs: Vec<Job>) -> Vec<Completed> {
        if jobs.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.options.max_workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut expected = Vec::with_capacity(jobs.len());

        for job in jobs {
            expected.push((job.node_id.clone(), job.resource_type));
            let semaphore = Arc::clone(&semaphore);
            let retry = self.options.retry.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                execute(job, &retry).await
            });
        }

        let mut finished: HashMap<String, Completed> = HashMap::with_capacity(expected.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(done) => {
                    finished.insert(done.node_id.clone(), done);
                }
                Err(err) => tracing::error!("Worker task failed: {}", err),
            }
        }

        expected
            .into_iter()
            .map(|(node_id, resource_type)| {
                finished.remove(&node_id).unwrap_or_else(|| Completed {
                    node_id,
                    resource_type,
                    result: Err(ProviderError::permanent(
                        "worker task terminated before reporting a result",
                    )),
                })
            })
            .collect()
    }

    fn record(
        &mut self,
        graph: &mut ResourceGraph,
        schedule: &Schedule,
        store: &ReferenceStore,
        done: Completed,
        batch: usize,
        report: &mut ApplyReport,
    ) -> Result<()> {
        let Completed {
            node_id,
            resource_type,
            result,
        } = done;

        match result {
            Ok(applied) => {
                let outcome = match applied.change {
                    Change::Created => NodeOutcome::Created,
                    Change::Updated => NodeOutcome::Updated,
                    Change::Recreated => NodeOutcome::Recreated,
                    Change::Unchanged | Change::Deleted => NodeOutcome::Unchanged,
                };

                graph.set_state(&node_id, NodeState::Created)?;
                store.put(node_id.clone(), applied.attributes.clone())?;
                self.snapshot.set_record(
                    node_id.clone(),
                    ResourceRecord::new(
                        applied.remote_id,
                        resource_type,
                        applied.props,
                        applied.attributes,
                    ),
                );

                if outcome.is_change() {
                    tracing::info!("{:?} {} {}", outcome, resource_type, node_id);
                } else {
                    tracing::debug!("{} {} is up to date", resource_type, node_id);
                }
                report.push(node_id, resource_type, batch, outcome);
            }
            Err(err) => {
                tracing::error!("{} {} failed: {}", resource_type, node_id, err);
                graph.set_state(&node_id, NodeState::Failed)?;
                report.push(
                    node_id.clone(),
                    resource_type,
                    batch,
                    NodeOutcome::Failed {
                        error: err.to_string(),
                    },
                );
                self.block_dependents(graph, schedule, &node_id, report)?;
            }
        }

        Ok(())
    }

    /// Mark every transitive dependent of `failed` as blocked, including
    /// ones an earlier pass over the same graph had created
    fn block_dependents(
        &self,
        graph: &mut ResourceGraph,
        schedule: &Schedule,
        failed: &str,
        report: &mut ApplyReport,
    ) -> Result<()> {
        for dependent in graph.transitive_dependents(failed) {
            let Some(node) = graph.get(&dependent) else {
                continue;
            };
            if !blockable(node.state()) {
                continue;
            }
            let resource_type = node.resource_type();

            graph.set_state(&dependent, NodeState::Blocked)?;
            tracing::warn!("{} blocked by failure of {}", dependent, failed);
            report.push(
                dependent.clone(),
                resource_type,
                schedule.batch_of(&dependent).unwrap_or_default(),
                NodeOutcome::Blocked {
                    reason: format!("depends on failed resource {}", failed),
                },
            );
        }
        Ok(())
    }
}

/// Created nodes count as waiting when the same graph is applied again
fn blockable(state: NodeState) -> bool {
    matches!(state, NodeState::Pending | NodeState::Created)
}

fn mark_blocked(graph: &mut ResourceGraph, id: &str) -> Result<()> {
    match graph.get(id).map(|n| n.state()) {
        Some(state) if blockable(state) => graph.set_state(id, NodeState::Blocked),
        _ => Ok(()),
    }
}

fn cancelled(graph: &ResourceGraph, schedule: &Schedule, batch: usize) -> EngineError {
    let pending: Vec<String> = schedule
        .nodes_from(batch)
        .into_iter()
        .filter(|id| graph.contains(id))
        .collect();
    tracing::warn!(
        "Cancellation requested, not starting batch {}/{}",
        batch + 1,
        schedule.len()
    );
    EngineError::Cancelled {
        completed: batch,
        total: schedule.len(),
        pending,
    }
}

fn finish(report: ApplyReport) -> Result<ApplyReport> {
    let failed = report.failed();
    let blocked = report.blocked();
    if failed.is_empty() && blocked.is_empty() {
        return Ok(report);
    }
    Err(PartialApplyError {
        failed,
        blocked,
        report: Box::new(report),
    }
    .into())
}

async fn execute(job: Job, retry: &RetryConfig) -> Completed {
    let Job {
        node_id,
        resource_type,
        adapter,
        operation,
    } = job;
    let calls = Calls {
        node_id: &node_id,
        adapter: adapter.as_ref(),
        retry,
    };

    let result = match operation {
        Operation::Create { props } => calls.create(props, Change::Created).await,
        Operation::Refresh { remote_id, props } => match calls.read(&remote_id).await {
            Ok(attributes) => Ok(Applied {
                change: Change::Unchanged,
                remote_id,
                props,
                attributes,
            }),
            Err(err) if err.is_not_found() => calls.recreate(&remote_id, props).await,
            Err(err) => Err(err),
        },
        Operation::Update { remote_id, props } => match calls.update(&remote_id, &props).await {
            Ok(attributes) => Ok(Applied {
                change: Change::Updated,
                remote_id,
                props,
                attributes,
            }),
            Err(err) if err.is_not_found() => calls.recreate(&remote_id, props).await,
            Err(err) => Err(err),
        },
        Operation::Replace {
            previous,
            previous_id,
            props,
        } => {
            let old = Calls {
                adapter: previous.as_ref(),
                ..calls
            };
            match old.delete(&previous_id).await {
                Ok(()) => calls.create(props, Change::Recreated).await,
                Err(err) => Err(err),
            }
        }
        Operation::Delete { remote_id } => match calls.delete(&remote_id).await {
            Ok(()) => Ok(Applied {
                change: Change::Deleted,
                remote_id,
                props: ResolvedProps::new(),
                attributes: Attributes::new(),
            }),
            Err(err) => Err(err),
        },
    };

    Completed {
        node_id,
        resource_type,
        result,
    }
}

/// Provider calls for one node, each under the retry policy
#[derive(Clone, Copy)]
struct Calls<'a> {
    node_id: &'a str,
    adapter: &'a dyn ProviderAdapter,
    retry: &'a RetryConfig,
}

impl Calls<'_> {
    async fn run<T, F, Fut>(self, verb: &str, call: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let operation = format!("{} {}", verb, self.node_id);
        with_retry(self.retry, &operation, call).await
    }

    async fn create(self, props: ResolvedProps, change: Change) -> ProviderResult<Applied> {
        let created = self.run("create", || self.adapter.create(&props)).await?;
        Ok(Applied {
            change,
            remote_id: created.remote_id,
            props,
            attributes: created.attributes,
        })
    }

    async fn recreate(self, remote_id: &str, props: ResolvedProps) -> ProviderResult<Applied> {
        tracing::warn!(
            "{} ({}) disappeared remotely, recreating",
            self.node_id,
            remote_id
        );
        self.create(props, Change::Recreated).await
    }

    async fn read(self, remote_id: &str) -> ProviderResult<Attributes> {
        let read = || self.adapter.read(remote_id);
        self.run("read", read).await
    }

    async fn update(self, remote_id: &str, props: &ResolvedProps) -> ProviderResult<Attributes> {
        let update = || self.adapter.update(remote_id, props);
        self.run("update", update).await
    }

    /// Delete `remote_id`; an object that is already gone counts as deleted
    async fn delete(self, remote_id: &str) -> ProviderResult<()> {
        let delete = || self.adapter.delete(remote_id);
        match self.run("delete", delete).await {
            Err(err) if err.is_not_found() => {
                tracing::debug!("{} ({}) was already gone", self.node_id, remote_id);
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::CreatedResource;
    use crate::resource::{Declaration, PropValue};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Provider double that records every call
    #[derive(Default)]
    struct FakeAdapter {
        calls: Mutex<Vec<String>>,
        fail_create: Mutex<HashSet<String>>,
        panic_create: Mutex<HashSet<String>>,
        fail_read: Mutex<HashSet<String>>,
        fail_delete: Mutex<HashSet<String>>,
        gone: Mutex<HashSet<String>>,
    }

    impl FakeAdapter {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, op: &str) -> usize {
            let prefix = format!("{}:", op);
            self.calls()
                .iter()
                .filter(|c| c.starts_with(&prefix))
                .count()
        }

        fn log(&self, entry: String) {
            self.calls.lock().unwrap().push(entry);
        }

        fn set(list: &Mutex<HashSet<String>>, entry: &str) {
            list.lock().unwrap().insert(entry.to_string());
        }

        fn has(list: &Mutex<HashSet<String>>, entry: &str) -> bool {
            list.lock().unwrap().contains(entry)
        }
    }

    #[async_trait]
    impl ProviderAdapter for FakeAdapter {
        fn name(&self) -> &str {
            "fake"
        }

        async fn create(&self, props: &ResolvedProps) -> ProviderResult<CreatedResource> {
            let name = props["name"].as_str().unwrap().to_string();
            self.log(format!("create:{}", name));
            if Self::has(&self.panic_create, &name) {
                panic!("adapter crashed while creating {}", name);
            }
            if Self::has(&self.fail_create, &name) {
                return Err(ProviderError::permanent(format!("cannot create {}", name)));
            }
            let remote_id = format!("r-{}", name);
            let mut attributes = Attributes::new();
            attributes.insert("id".into(), json!(remote_id));
            Ok(CreatedResource::new(remote_id, attributes))
        }

        async fn read(&self, remote_id: &str) -> ProviderResult<Attributes> {
            self.log(format!("read:{}", remote_id));
            if Self::has(&self.gone, remote_id) {
                return Err(ProviderError::NotFound(remote_id.to_string()));
            }
            if Self::has(&self.fail_read, remote_id) {
                return Err(ProviderError::permanent("access denied"));
            }
            let mut attributes = Attributes::new();
            attributes.insert("id".into(), json!(remote_id));
            Ok(attributes)
        }

        async fn update(
            &self,
            remote_id: &str,
            _props: &ResolvedProps,
        ) -> ProviderResult<Attributes> {
            self.log(format!("update:{}", remote_id));
            let mut attributes = Attributes::new();
            attributes.insert("id".into(), json!(remote_id));
            Ok(attributes)
        }

        async fn delete(&self, remote_id: &str) -> ProviderResult<()> {
            self.log(format!("delete:{}", remote_id));
            if Self::has(&self.fail_delete, remote_id) {
                return Err(ProviderError::permanent("resource in use"));
            }
            Ok(())
        }
    }

    fn registry(adapter: &Arc<FakeAdapter>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for resource_type in ResourceType::ALL {
            registry.register(resource_type, adapter.clone());
        }
        registry
    }

    fn options() -> ReconcileOptions {
        ReconcileOptions {
            max_workers: 2,
            retry: RetryConfig::immediate(2),
        }
    }

    fn node(id: &str, resource_type: ResourceType) -> Declaration {
        Declaration::new(id, resource_type).with_prop("name", id)
    }

    fn instance(id: &str) -> Declaration {
        node(id, ResourceType::Instance)
            .with_ref("subnetId", "subnet", "id")
    }

    /// vpc -> subnet -> {web1, web2} -> tg
    fn declarations() -> Vec<Declaration> {
        let targets = vec![
            PropValue::reference("web1", "id"),
            PropValue::reference("web2", "id"),
        ];
        vec![
            node("vpc", ResourceType::Network),
            node("subnet", ResourceType::Subnet)
                .with_ref("vpcId", "vpc", "id"),
            instance("web1"),
            instance("web2"),
            node("tg", ResourceType::TargetGroup)
                .with_prop("targets", targets),
        ]
    }

    async fn apply_fresh(
        reconciler: &mut Reconciler,
        decls: Vec<Declaration>,
    ) -> (ResourceGraph, Result<ApplyReport>) {
        let mut graph = ResourceGraph::build(decls).unwrap();
        let schedule = scheduler::plan(&graph);
        let store = ReferenceStore::new();
        let result = reconciler
            .apply(&mut graph, &schedule, &store, &CancellationToken::new())
            .await;
        (graph, result)
    }

    fn partial(result: Result<ApplyReport>) -> PartialApplyError {
        match result {
            Err(EngineError::PartialApply(err)) => err,
            other => panic!("expected partial apply error, got {:?}", other.map(|_| ())),
        }
    }

    fn sorted(mut ids: Vec<String>) -> Vec<String> {
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_apply_creates_everything_in_dependency_order() {
        let adapter = Arc::new(FakeAdapter::default());
        let mut reconciler = Reconciler::new(registry(&adapter), StateSnapshot::new(), options());

        let (graph, result) = apply_fresh(&mut reconciler, declarations()).await;
        let report = result.unwrap();

        assert_eq!(report.total_changes(), 5);
        assert!(graph.iter().all(|n| n.state() == NodeState::Created));

        let calls = adapter.calls();
        let pos = |c: &str| calls.iter().position(|x| x == c).unwrap();
        assert!(pos("create:vpc") < pos("create:subnet"));
        assert!(pos("create:subnet") < pos("create:web1"));
        assert!(pos("create:web2") < pos("create:tg"));

        let record = reconciler.snapshot().get("tg").unwrap();
        assert_eq!(record.last_applied["targets"], json!(["r-web1", "r-web2"]));
    }

    #[tokio::test]
    async fn test_failure_blocks_transitive_dependents() {
        let adapter = Arc::new(FakeAdapter::default());
        FakeAdapter::set(&adapter.fail_create, "subnet");
        let mut reconciler = Reconciler::new(registry(&adapter), StateSnapshot::new(), options());

        let (graph, result) = apply_fresh(&mut reconciler, declarations()).await;

        let err = partial(result);
        assert_eq!(err.failed, vec!["subnet"]);
        assert_eq!(sorted(err.blocked), vec!["tg", "web1", "web2"]);

        assert_eq!(graph.get("vpc").unwrap().state(), NodeState::Created);
        assert_eq!(graph.get("subnet").unwrap().state(), NodeState::Failed);
        for id in ["web1", "web2", "tg"] {
            assert_eq!(graph.get(id).unwrap().state(), NodeState::Blocked);
        }
        assert_eq!(adapter.count("create"), 2);
        assert!(!reconciler.snapshot().contains("subnet"));
    }

    #[tokio::test]
    async fn test_worker_panic_marks_node_failed() {
        let adapter = Arc::new(FakeAdapter::default());
        FakeAdapter::set(&adapter.panic_create, "web1");
        let mut reconciler = Reconciler::new(registry(&adapter), StateSnapshot::new(), options());

        let (graph, result) = apply_fresh(&mut reconciler, declarations()).await;

        let err = partial(result);
        assert_eq!(err.failed, vec!["web1"]);
        assert_eq!(err.blocked, vec!["tg"]);
        match err.report.outcome("web1") {
            Some(NodeOutcome::Failed { error }) => assert!(error.contains("terminated")),
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert_eq!(graph.get("web1").unwrap().state(), NodeState::Failed);
        assert_eq!(graph.get("web2").unwrap().state(), NodeState::Created);
        assert_eq!(graph.get("tg").unwrap().state(), NodeState::Blocked);
        assert!(!reconciler.snapshot().contains("web1"));
        assert!(reconciler.snapshot().contains("web2"));
    }

    #[tokio::test]
    async fn test_reapply_without_changes_only_reads() {
        let adapter = Arc::new(FakeAdapter::default());
        let mut reconciler = Reconciler::new(registry(&adapter), StateSnapshot::new(), options());
        apply_fresh(&mut reconciler, declarations()).await.1.unwrap();
        adapter.calls.lock().unwrap().clear();

        let (graph, result) = apply_fresh(&mut reconciler, declarations()).await;
        let report = result.unwrap();

        assert_eq!(report.total_changes(), 0);
        assert_eq!(adapter.count("create"), 0);
        assert_eq!(adapter.count("update"), 0);
        assert_eq!(adapter.count("read"), 5);
        assert!(graph.iter().all(|n| n.state() == NodeState::Created));
    }

    #[tokio::test]
    async fn test_reapply_same_graph_is_idempotent() {
        let adapter = Arc::new(FakeAdapter::default());
        let mut reconciler = Reconciler::new(registry(&adapter), StateSnapshot::new(), options());

        let mut graph = ResourceGraph::build(declarations()).unwrap();
        let schedule = scheduler::plan(&graph);
        let cancel = CancellationToken::new();
        reconciler
            .apply(&mut graph, &schedule, &ReferenceStore::new(), &cancel)
            .await
            .unwrap();
        adapter.calls.lock().unwrap().clear();

        let report = reconciler
            .apply(&mut graph, &schedule, &ReferenceStore::new(), &cancel)
            .await
            .unwrap();
        assert_eq!(report.total_changes(), 0);
        assert_eq!(adapter.count("create") + adapter.count("update"), 0);
        assert!(graph.iter().all(|n| n.state() == NodeState::Created));
    }

    #[tokio::test]
    async fn test_failed_read_on_reapplied_graph_blocks_created_dependents() {
        let adapter = Arc::new(FakeAdapter::default());
        let mut reconciler = Reconciler::new(registry(&adapter), StateSnapshot::new(), options());
        let decls = vec![
            node("vpc", ResourceType::Network),
            node("subnet", ResourceType::Subnet)
                .with_ref("vpcId", "vpc", "id"),
        ];

        let mut graph = ResourceGraph::build(decls).unwrap();
        let schedule = scheduler::plan(&graph);
        let cancel = CancellationToken::new();
        reconciler
            .apply(&mut graph, &schedule, &ReferenceStore::new(), &cancel)
            .await
            .unwrap();
        FakeAdapter::set(&adapter.fail_read, "r-vpc");
        adapter.calls.lock().unwrap().clear();

        let result = reconciler
            .apply(&mut graph, &schedule, &ReferenceStore::new(), &cancel)
            .await;
        let err = partial(result);
        assert_eq!(err.failed, vec!["vpc"]);
        assert_eq!(err.blocked, vec!["subnet"]);
        assert_eq!(graph.get("vpc").unwrap().state(), NodeState::Failed);
        assert_eq!(graph.get("subnet").unwrap().state(), NodeState::Blocked);
        assert_eq!(adapter.calls(), vec!["read:r-vpc"]);

        // Both come back once the provider answers again
        adapter.fail_read.lock().unwrap().clear();
        reconciler
            .apply(&mut graph, &schedule, &ReferenceStore::new(), &cancel)
            .await
            .unwrap();
        assert!(graph.iter().all(|n| n.state() == NodeState::Created));
        assert_eq!(adapter.count("create"), 0);
    }

    #[tokio::test]
    async fn test_changed_props_issue_update() {
        let adapter = Arc::new(FakeAdapter::default());
        let mut reconciler = Reconciler::new(registry(&adapter), StateSnapshot::new(), options());
        apply_fresh(&mut reconciler, declarations()).await.1.unwrap();
        adapter.calls.lock().unwrap().clear();

        let mut decls = declarations();
        decls[2] = decls[2].clone().with_prop("instanceType", "t3.small");
        let (_, result) = apply_fresh(&mut reconciler, decls).await;
        let report = result.unwrap();

        assert_eq!(report.outcome("web1"), Some(&NodeOutcome::Updated));
        assert_eq!(adapter.count("update"), 1);
        assert!(adapter.calls().contains(&"update:r-web1".to_string()));

        let record = reconciler.snapshot().get("web1").unwrap();
        assert_eq!(record.last_applied["instanceType"], json!("t3.small"));
    }

    #[tokio::test]
    async fn test_missing_remote_is_recreated() {
        let adapter = Arc::new(FakeAdapter::default());
        let mut reconciler = Reconciler::new(registry(&adapter), StateSnapshot::new(), options());
        apply_fresh(&mut reconciler, declarations()).await.1.unwrap();
        FakeAdapter::set(&adapter.gone, "r-web2");

        let (_, result) = apply_fresh(&mut reconciler, declarations()).await;
        let report = result.unwrap();
        assert_eq!(report.outcome("web2"), Some(&NodeOutcome::Recreated));
        assert_eq!(report.outcome("web1"), Some(&NodeOutcome::Unchanged));
    }

    #[tokio::test]
    async fn test_type_change_deletes_old_object_before_create() {
        let adapter = Arc::new(FakeAdapter::default());
        let mut reconciler = Reconciler::new(registry(&adapter), StateSnapshot::new(), options());
        let original = vec![node("cache", ResourceType::Instance)];
        apply_fresh(&mut reconciler, original).await.1.unwrap();
        adapter.calls.lock().unwrap().clear();

        let replaced = vec![node("cache", ResourceType::LoadBalancer)];
        let graph = ResourceGraph::build(replaced.clone()).unwrap();
        let plan = reconciler.preview(&graph);
        let action = plan.action_for("cache").unwrap();
        assert_eq!(action.action_type, ActionType::Create);
        assert!(action.description.starts_with("replace instance cache"));

        let (_, result) = apply_fresh(&mut reconciler, replaced).await;
        let report = result.unwrap();
        assert_eq!(report.outcome("cache"), Some(&NodeOutcome::Recreated));
        assert_eq!(adapter.calls(), vec!["delete:r-cache", "create:cache"]);

        let record = reconciler.snapshot().get("cache").unwrap();
        assert_eq!(record.resource_type, ResourceType::LoadBalancer);
    }

    #[tokio::test]
    async fn test_type_change_needs_adapter_for_recorded_type() {
        let adapter = Arc::new(FakeAdapter::default());
        let mut reconciler = Reconciler::new(registry(&adapter), StateSnapshot::new(), options());
        let original = vec![node("cache", ResourceType::Instance)];
        apply_fresh(&mut reconciler, original).await.1.unwrap();
        adapter.calls.lock().unwrap().clear();

        let mut registry = ProviderRegistry::new();
        registry.register(ResourceType::LoadBalancer, adapter.clone());
        let mut reconciler = Reconciler::new(registry, reconciler.into_snapshot(), options());
        let replaced = vec![node("cache", ResourceType::LoadBalancer)];

        let (_, result) = apply_fresh(&mut reconciler, replaced).await;
        assert!(matches!(
            result,
            Err(EngineError::NoAdapter(ResourceType::Instance))
        ));
        assert!(adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn test_apply_keeps_undeclared_snapshot_entries() {
        let adapter = Arc::new(FakeAdapter::default());
        let mut reconciler = Reconciler::new(registry(&adapter), StateSnapshot::new(), options());
        apply_fresh(&mut reconciler, declarations()).await.1.unwrap();
        adapter.calls.lock().unwrap().clear();

        let mut decls = declarations();
        decls.remove(4);
        let (graph, result) = apply_fresh(&mut reconciler, decls).await;
        result.unwrap();

        assert!(!graph.contains("tg"));
        assert_eq!(adapter.count("delete"), 0);
        assert_eq!(reconciler.snapshot().get("tg").unwrap().remote_id, "r-tg");
        assert_eq!(reconciler.snapshot().len(), 5);
    }

    #[tokio::test]
    async fn test_cancel_before_start_runs_nothing() {
        let adapter = Arc::new(FakeAdapter::default());
        let mut reconciler = Reconciler::new(registry(&adapter), StateSnapshot::new(), options());

        let mut graph = ResourceGraph::build(declarations()).unwrap();
        let schedule = scheduler::plan(&graph);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = reconciler
            .apply(&mut graph, &schedule, &ReferenceStore::new(), &cancel)
            .await
            .unwrap_err();
        match err {
            EngineError::Cancelled {
                completed, pending, ..
            } => {
                assert_eq!(completed, 0);
                assert_eq!(pending.len(), 5);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_adapter_fails_before_side_effects() {
        let adapter = Arc::new(FakeAdapter::default());
        let mut registry = ProviderRegistry::new();
        registry.register(ResourceType::Network, adapter.clone());
        let mut reconciler = Reconciler::new(registry, StateSnapshot::new(), options());

        let (_, result) = apply_fresh(&mut reconciler, declarations()).await;
        assert!(matches!(
            result,
            Err(EngineError::NoAdapter(ResourceType::Subnet))
        ));
        assert!(adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_deletes_dependents_first() {
        let adapter = Arc::new(FakeAdapter::default());
        let mut reconciler = Reconciler::new(registry(&adapter), StateSnapshot::new(), options());
        let (mut graph, result) = apply_fresh(&mut reconciler, declarations()).await;
        result.unwrap();
        adapter.calls.lock().unwrap().clear();

        let report = reconciler
            .destroy(&mut graph, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.total_changes(), 5);
        assert!(graph.is_empty());
        assert!(reconciler.snapshot().is_empty());

        let calls = adapter.calls();
        let pos = |c: &str| calls.iter().position(|x| x == c).unwrap();
        assert!(pos("delete:r-tg") < pos("delete:r-web1"));
        assert!(pos("delete:r-web1") < pos("delete:r-subnet"));
        assert!(pos("delete:r-subnet") < pos("delete:r-vpc"));
    }

    #[tokio::test]
    async fn test_failed_delete_leaves_dependencies_blocked() {
        let adapter = Arc::new(FakeAdapter::default());
        let mut reconciler = Reconciler::new(registry(&adapter), StateSnapshot::new(), options());
        let (mut graph, result) = apply_fresh(&mut reconciler, declarations()).await;
        result.unwrap();
        FakeAdapter::set(&adapter.fail_delete, "r-web1");
        adapter.calls.lock().unwrap().clear();

        let result = reconciler
            .destroy(&mut graph, &CancellationToken::new())
            .await;

        let err = partial(result);
        assert_eq!(err.failed, vec!["web1"]);
        assert_eq!(sorted(err.blocked), vec!["subnet", "vpc"]);
        assert_eq!(adapter.count("delete"), 3);

        assert_eq!(graph.get("web1").unwrap().state(), NodeState::Created);
        for id in ["subnet", "vpc"] {
            assert!(graph.contains(id));
            assert!(reconciler.snapshot().contains(id));
        }
        for id in ["tg", "web2"] {
            assert!(!graph.contains(id));
            assert!(!reconciler.snapshot().contains(id));
        }
    }

    #[tokio::test]
    async fn test_preview_reports_creates_then_noops() {
        let adapter = Arc::new(FakeAdapter::default());
        let mut reconciler = Reconciler::new(registry(&adapter), StateSnapshot::new(), options());

        let graph = ResourceGraph::build(declarations()).unwrap();
        let plan = reconciler.preview(&graph);
        assert_eq!(plan.summary().create, 5);
        assert!(adapter.calls().is_empty());

        apply_fresh(&mut reconciler, declarations()).await.1.unwrap();
        let plan = reconciler.preview(&graph);
        assert!(!plan.has_changes);

        let mut decls = declarations();
        decls.remove(4);
        let smaller = ResourceGraph::build(decls).unwrap();
        let plan = reconciler.preview(&smaller);
        let delete = plan.action_for("tg").unwrap();
        assert_eq!(delete.action_type, ActionType::Delete);
        assert_eq!(plan.summary().delete, 1);
    }
}
