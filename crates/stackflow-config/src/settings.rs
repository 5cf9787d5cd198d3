//! Settings file schema
//!
//! Every field has a default, so an empty file (or no file at all) is a
//! valid configuration.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Maximum concurrent provider calls within one batch
    pub workers: usize,

    pub retry: RetrySettings,

    /// Where the state snapshot lives; `.stackflow/` next to the settings when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    pub topology: TopologySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetrySettings::default(),
            state_dir: None,
            topology: TopologySettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            multiplier: 2.0,
        }
    }
}

/// Overrides for the web-tier topology; unset fields keep the built-in values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopologySettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_source_cidr: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc_cidr: Option<String>,
}

impl Settings {
    /// Parse settings from YAML text
    pub fn from_yaml(content: &str, path: &Path) -> Result<Self> {
        // An empty document deserializes to unit, not to a mapping
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let settings: Settings = serde_yaml::from_str(content).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "workers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.multiplier",
                reason: format!("{} is not a number >= 1.0", self.retry.multiplier),
            });
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.initial_delay_ms",
                reason: "must not exceed retry.max_delay_ms".to_string(),
            });
        }

        let cidrs = [
            ("topology.ssh_source_cidr", &self.topology.ssh_source_cidr),
            ("topology.vpc_cidr", &self.topology.vpc_cidr),
        ];
        for (field, value) in cidrs {
            if let Some(cidr) = value
                && !is_cidr(cidr)
            {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("{} is not an IPv4 CIDR block", cidr),
                });
            }
        }

        Ok(())
    }
}

fn is_cidr(value: &str) -> bool {
    let Some((address, prefix)) = value.split_once('/') else {
        return false;
    };
    address.parse::<std::net::Ipv4Addr>().is_ok() && prefix.parse::<u8>().is_ok_and(|p| p <= 32)
}
