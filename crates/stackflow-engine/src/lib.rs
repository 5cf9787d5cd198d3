//! StackFlow Engine
//!
//! Declarative provisioning core: resources are declared with references to
//! each other's attributes, the engine orders them, drives a provider through
//! create/update/delete and hands out the resulting attributes to later
//! resources and to stack outputs.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              Stack (declarations)               │
//! └─────────────────┬───────────────────────────────┘
//!                   │ build + validate
//! ┌─────────────────▼───────────────────────────────┐
//! │                stackflow-engine                 │
//! │  ┌──────────────┐  ┌──────────────┐             │
//! │  │ResourceGraph │─▶│  Scheduler   │             │
//! │  └──────────────┘  └──────┬───────┘             │
//! │                    ┌──────▼───────┐             │
//! │  ┌──────────────┐  │  Reconciler  │  ┌────────┐ │
//! │  │ReferenceStore│◀─┤ (per batch)  ├─▶│ State  │ │
//! │  └──────┬───────┘  └──────┬───────┘  └────────┘ │
//! │  ┌──────▼───────┐         │                     │
//! │  │OutputEmitter │         │                     │
//! │  └──────────────┘         │                     │
//! └───────────────────────────┼─────────────────────┘
//!                             │
//!                  ┌──────────▼──────────┐
//!                  │ trait ProviderAdapter│
//!                  └─────────────────────┘
//! ```

pub mod action;
pub mod engine;
pub mod error;
pub mod graph;
pub mod output;
pub mod provider;
pub mod reconciler;
pub mod reference;
pub mod resource;
pub mod scheduler;
pub mod state;

// Re-exports
pub use action::{
    Action, ActionType, ApplyReport, ChangePlan, NodeOutcome, NodeResult, PlanSummary,
};
pub use engine::{Deployment, Engine, Stack};
pub use error::{
    EngineError, NotReadyError, PartialApplyError, ProviderError, Result, ValidationError,
};
pub use graph::{ResourceGraph, ResourceNode};
pub use output::{OutputEmitter, OutputSpec};
pub use provider::{CreatedResource, ProviderAdapter, ProviderRegistry, RetryConfig, with_retry};
pub use reconciler::{ReconcileOptions, Reconciler};
pub use reference::ReferenceStore;
pub use resource::{
    Attributes, Declaration, NodeState, PropValue, Reference, ResolvedProps, ResourceType,
};
pub use scheduler::{Batch, Schedule};
pub use state::{ResourceRecord, SnapshotLock, StateManager, StateSnapshot};

pub use tokio_util::sync::CancellationToken;
