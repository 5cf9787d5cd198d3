use stackflow::topology::{TopologyOptions, web_tier};
use stackflow_engine::{Engine, ReconcileOptions, RetryConfig, Stack, StateManager};
use stackflow_provider_memory::MemoryCloud;
use std::path::PathBuf;
use tempfile::TempDir;

pub struct TestProject {
    pub root: TempDir,
    pub cloud: MemoryCloud,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self {
            root,
            cloud: MemoryCloud::new(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    pub fn state(&self) -> StateManager {
        StateManager::new(self.root.path())
    }

    /// Engine backed by this project's cloud and state directory
    pub fn engine(&self) -> Engine {
        self.engine_with(ReconcileOptions {
            max_workers: 4,
            retry: RetryConfig::immediate(3),
        })
    }

    pub fn engine_with(&self, options: ReconcileOptions) -> Engine {
        let engine = Engine::new(self.cloud.registry(), self.state());
        engine.with_options(options)
    }

    pub fn stack(&self) -> Stack {
        web_tier(&TopologyOptions::default())
    }
}
