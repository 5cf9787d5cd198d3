//! Provider adapter trait definition
//!
//! Each resource type is served by exactly one adapter. Adapters perform
//! the actual remote calls; the engine only decides which call to make.

use crate::error::ProviderError;
use crate::graph::ResourceGraph;
use crate::resource::{Attributes, ResolvedProps, ResourceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Provider adapter abstraction trait
///
/// Implementations talk to a remote API for a single resource type.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Returns the adapter name (e.g., "aws-ec2", "memory")
    fn name(&self) -> &str;

    /// Create the remote object and return its id and attributes
    async fn create(&self, props: &ResolvedProps) -> Result<CreatedResource, ProviderError>;

    /// Read the current attributes of an existing remote object
    async fn read(&self, remote_id: &str) -> Result<Attributes, ProviderError>;

    /// Apply new properties to an existing remote object
    async fn update(
        &self,
        remote_id: &str,
        props: &ResolvedProps,
    ) -> Result<Attributes, ProviderError>;

    /// Destroy the remote object
    async fn delete(&self, remote_id: &str) -> Result<(), ProviderError>;
}

/// Result of a successful create call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedResource {
    /// Provider-side identifier
    pub remote_id: String,

    /// Attributes exposed to references (ids, addresses, DNS names)
    pub attributes: Attributes,
}

impl CreatedResource {
    pub fn new(remote_id: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            remote_id: remote_id.into(),
            attributes,
        }
    }
}

/// Adapters indexed by the resource type they serve
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<ResourceType, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` for `resource_type`, returning the adapter it replaces
    pub fn register(
        &mut self,
        resource_type: ResourceType,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Option<Arc<dyn ProviderAdapter>> {
        let previous = self.adapters.insert(resource_type, adapter);
        if let Some(previous) = &previous {
            tracing::warn!(
                "Replacing provider adapter {} for {}",
                previous.name(),
                resource_type
            );
        }
        previous
    }

    pub fn with(mut self, resource_type: ResourceType, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(resource_type, adapter);
        self
    }

    pub fn get(&self, resource_type: ResourceType) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&resource_type).cloned()
    }

    /// Resource types used by `graph` that have no adapter
    pub fn missing_for(&self, graph: &ResourceGraph) -> Vec<ResourceType> {
        graph
            .resource_types()
            .into_iter()
            .filter(|t| !self.adapters.contains_key(t))
            .collect()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<(ResourceType, &str)> = self
            .adapters
            .iter()
            .map(|(t, a)| (*t, a.name()))
            .collect();
        entries.sort();
        f.debug_map().entries(entries).finish()
    }
}

/// Retry configuration for provider operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first call included
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retry without waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt + 1`, capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

/// Run `call` until it succeeds, fails permanently, or attempts run out.
///
/// Only [`ProviderError::Transient`] is retried.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation,
                    attempt + 1,
                    max_attempts,
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10000),
            backoff_multiplier: 2.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(8000));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(10000)); // capped at max
        assert_eq!(config.delay_for_attempt(200), Duration::from_millis(10000));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryConfig::immediate(3), "create", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(ProviderError::transient("throttled"))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryConfig::immediate(4), "create", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::transient("timeout"))
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryConfig::immediate(5), "update", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::permanent("quota exceeded"))
        })
        .await;

        assert_eq!(
            result.unwrap_err(),
            ProviderError::Permanent("quota exceeded".to_string())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
