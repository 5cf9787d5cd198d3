use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "Settings file not found. Looked in:\n\
        - current directory: stackflow.local.yaml, .stackflow.local.yaml,\n\
          stackflow.yaml, .stackflow.yaml\n\
        - ./.stackflow/ directory\n\
        - ~/.config/stackflow/stackflow.yaml\n\
        Set STACKFLOW_CONFIG_PATH to point at a file directly"
    )]
    SettingsFileNotFound,

    #[error("Invalid settings in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid setting {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
