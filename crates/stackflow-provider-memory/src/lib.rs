//! In-memory provider for StackFlow
//!
//! Simulates a single cloud account with AWS-shaped identifiers so the
//! engine can be exercised end to end without network access.
//!
//! # Features
//!
//! - All seven resource types, one adapter each
//! - Fault injection per call kind, resource type and target
//! - Artificial latency and peak-concurrency accounting
//! - Out-of-band deletion to simulate drift
//!
//! # Example
//!
//! ```ignore
//! use stackflow_provider_memory::{CallKind, FaultRule, MemoryCloud};
//!
//! let cloud = MemoryCloud::new();
//! cloud.inject(FaultRule::on(CallKind::Create).target("web2"));
//! let engine = Engine::new(cloud.registry(), StateManager::new("."));
//! ```

pub mod adapter;
pub mod cloud;
pub mod fault;

pub use adapter::MemoryAdapter;
pub use cloud::{ACCOUNT_ID, Call, MemoryCloud, REGION};
pub use fault::{CallKind, FaultRule};
