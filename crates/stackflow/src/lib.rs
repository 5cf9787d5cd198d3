//! StackFlow
//!
//! The web-tier stack and a runner that previews, applies and destroys it
//! through the StackFlow engine.

pub mod runner;
pub mod topology;

pub use runner::Command;
pub use topology::{TopologyOptions, web_tier};
