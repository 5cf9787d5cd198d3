//! State snapshot for materialized resources
//!
//! Manages the `.stackflow/state.json` file which records, per declared
//! resource, the remote id and the properties that were last applied. The
//! snapshot is what makes re-apply idempotent and teardown possible.

use crate::error::{EngineError, Result};
use crate::resource::{Attributes, ResolvedProps, ResourceType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const STATE_VERSION: u32 = 1;
const STATE_DIR: &str = ".stackflow";
const STATE_FILE: &str = "state.json";
const PREVIOUS_FILE: &str = "state.previous.json";
const STAGING_FILE: &str = "state.json.tmp";
const LOCK_FILE: &str = "lock.json";

/// Minutes after which a lock file no longer blocks a run
const STALE_LOCK_MINUTES: i64 = 60;

/// Snapshot of every resource the engine has materialized
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State file version
    pub version: u32,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Records indexed by resource id
    pub resources: BTreeMap<String, ResourceRecord>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
        }
    }
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a record, keeping the original creation time
    pub fn set_record(&mut self, node_id: impl Into<String>, mut record: ResourceRecord) {
        let node_id = node_id.into();
        if let Some(existing) = self.resources.get(&node_id)
            && existing.remote_id == record.remote_id
        {
            record.created_at = existing.created_at;
        }
        self.resources.insert(node_id, record);
        self.updated_at = Utc::now();
    }

    /// Remove a record
    pub fn remove_record(&mut self, node_id: &str) -> Option<ResourceRecord> {
        let result = self.resources.remove(node_id);
        if result.is_some() {
            self.updated_at = Utc::now();
        }
        result
    }

    pub fn get(&self, node_id: &str) -> Option<&ResourceRecord> {
        self.resources.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.resources.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Recorded state of a single resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Provider-specific resource ID
    pub remote_id: String,

    /// Resource type
    pub resource_type: ResourceType,

    /// Resolved properties sent with the last successful create/update
    pub last_applied: ResolvedProps,

    /// Attributes reported by the provider (ids, addresses, DNS names)
    pub attributes: Attributes,

    /// When the resource was created
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    pub fn new(
        remote_id: impl Into<String>,
        resource_type: ResourceType,
        last_applied: ResolvedProps,
        attributes: Attributes,
    ) -> Self {
        let now = Utc::now();
        Self {
            remote_id: remote_id.into(),
            resource_type,
            last_applied,
            attributes,
            created_at: now,
            updated_at: now,
        }
    }

    /// Property keys whose value differs from `desired`
    pub fn changed_keys(&self, desired: &ResolvedProps) -> Vec<String> {
        let mut keys: Vec<String> = desired
            .iter()
            .filter(|(k, v)| self.last_applied.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        keys.extend(
            self.last_applied
                .keys()
                .filter(|k| !desired.contains_key(*k))
                .cloned(),
        );
        keys.sort();
        keys
    }
}

/// Reads and writes the snapshot and guards it with a lock file
#[derive(Debug, Clone)]
pub struct StateManager {
    /// Directory holding the snapshot, its backup and the lock file
    state_dir: PathBuf,
}

impl StateManager {
    /// Keep state under `<project_root>/.stackflow`
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            state_dir: project_root.as_ref().join(STATE_DIR),
        }
    }

    /// Keep state directly in `state_dir`
    pub fn at(state_dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    fn previous_path(&self) -> PathBuf {
        self.state_dir.join(PREVIOUS_FILE)
    }

    fn staging_path(&self) -> PathBuf {
        self.state_dir.join(STAGING_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE)
    }

    async fn ensure_state_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        Ok(())
    }

    /// Read the snapshot; a missing file is an empty snapshot
    pub async fn load(&self) -> Result<StateSnapshot> {
        let path = self.snapshot_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No snapshot at {}, starting empty", path.display());
                return Ok(StateSnapshot::new());
            }
            Err(err) => return Err(err.into()),
        };

        let snapshot: StateSnapshot = serde_json::from_str(&content)?;
        if snapshot.version > STATE_VERSION {
            return Err(EngineError::StateError(format!(
                "Snapshot version {} is newer than supported version {}",
                snapshot.version, STATE_VERSION
            )));
        }

        tracing::debug!("Loaded snapshot of {} resources", snapshot.len());
        Ok(snapshot)
    }

    /// Write the snapshot.
    ///
    /// The new content is staged next to the live file and renamed over it,
    /// so a crash leaves either the old or the new snapshot in place. The
    /// replaced snapshot is copied to `state.previous.json` first.
    pub async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.ensure_state_dir().await?;

        let path = self.snapshot_path();
        let staging = self.staging_path();
        let content = serde_json::to_vec_pretty(snapshot)?;
        fs::write(&staging, content).await?;

        if fs::try_exists(&path).await? {
            fs::copy(&path, self.previous_path()).await?;
        }
        fs::rename(&staging, &path).await?;

        tracing::debug!(
            "Saved snapshot of {} resources to {}",
            snapshot.len(),
            path.display()
        );
        Ok(())
    }

    /// Take the snapshot lock.
    ///
    /// The lock file is created exclusively. A lock taken more than an hour
    /// ago is treated as abandoned and taken over once.
    pub async fn acquire_lock(&self) -> Result<SnapshotLock> {
        self.ensure_state_dir().await?;

        let path = self.lock_path();
        if !create_lock_file(&path).await? {
            let owner = read_lock_owner(&path).await?;
            if !owner.is_stale() {
                return Err(EngineError::LockError(format!(
                    "State is locked by {} since {}",
                    owner, owner.acquired_at
                )));
            }

            tracing::warn!("Taking over stale lock held by {}", owner);
            fs::remove_file(&path).await?;
            if !create_lock_file(&path).await? {
                return Err(EngineError::LockError(
                    "State lock was taken by another process".to_string(),
                ));
            }
        }

        tracing::debug!("Acquired state lock at {}", path.display());
        Ok(SnapshotLock {
            path,
            released: false,
        })
    }
}

/// Who holds the snapshot lock, as written into the lock file
#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    holder: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

impl LockOwner {
    fn current() -> Self {
        let holder = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            holder,
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    fn is_stale(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.acquired_at);
        age.num_minutes() >= STALE_LOCK_MINUTES
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.holder, self.pid)
    }
}

/// Create the lock file with the current owner; `false` if it already exists
async fn create_lock_file(path: &Path) -> Result<bool> {
    let content = serde_json::to_vec_pretty(&LockOwner::current())?;
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    file.write_all(&content).await?;
    file.flush().await?;
    Ok(true)
}

async fn read_lock_owner(path: &Path) -> Result<LockOwner> {
    let content = fs::read_to_string(path).await?;
    serde_json::from_str(&content).map_err(|err| {
        EngineError::LockError(format!("Unreadable lock file {}: {}", path.display(), err))
    })
}

/// Held snapshot lock; the lock file is removed on release or drop
pub struct SnapshotLock {
    path: PathBuf,
    released: bool,
}

impl SnapshotLock {
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::debug!("Released state lock");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
