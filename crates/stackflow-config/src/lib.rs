pub mod error;
pub mod settings;

pub use error::*;
pub use settings::{RetrySettings, Settings, TopologySettings};

use std::path::{Path, PathBuf};

/// Environment variable pointing directly at a settings file
pub const CONFIG_PATH_ENV: &str = "STACKFLOW_CONFIG_PATH";

const CANDIDATES: [&str; 4] = [
    "stackflow.local.yaml",
    ".stackflow.local.yaml",
    "stackflow.yaml",
    ".stackflow.yaml",
];

/// Find the settings file
///
/// Search order:
/// 1. `STACKFLOW_CONFIG_PATH`
/// 2. Current directory: stackflow.local.yaml, .stackflow.local.yaml,
///    stackflow.yaml, .stackflow.yaml
/// 3. `./.stackflow/`, same order
/// 4. `~/.config/stackflow/stackflow.yaml`
pub fn find_settings_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;

    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let project_dir = current_dir.join(".stackflow");
    if project_dir.is_dir() {
        for filename in &CANDIDATES {
            let path = project_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global = config_dir.join("stackflow").join("stackflow.yaml");
        if global.exists() {
            return Ok(global);
        }
    }

    Err(ConfigError::SettingsFileNotFound)
}

/// Load settings from an explicit path
pub fn load_settings(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)?;
    Settings::from_yaml(&content, path)
}

/// Load the discovered settings file, or defaults when there is none.
///
/// Returns the path the settings came from, if any.
pub fn load_settings_or_default() -> Result<(Settings, Option<PathBuf>)> {
    match find_settings_file() {
        Ok(path) => Ok((load_settings(&path)?, Some(path))),
        Err(ConfigError::SettingsFileNotFound) => Ok((Settings::default(), None)),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn write_settings(dir: &Path, name: &str, workers: u32) {
        let content = format!("workers: {}\n", workers);
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    #[serial]
    fn test_find_settings_file_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        write_settings(temp_dir.path(), "stackflow.yaml", 2);
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_settings_file();

        std::env::set_current_dir(original_dir).unwrap();
        assert!(result.unwrap().ends_with("stackflow.yaml"));
    }

    #[test]
    #[serial]
    fn test_local_file_has_priority() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        write_settings(temp_dir.path(), "stackflow.yaml", 2);
        write_settings(temp_dir.path(), ".stackflow.local.yaml", 6);
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_settings_file();
        let loaded = load_settings_or_default();

        std::env::set_current_dir(original_dir).unwrap();
        assert!(result.unwrap().ends_with(".stackflow.local.yaml"));
        assert_eq!(loaded.unwrap().0.workers, 6);
    }

    #[test]
    #[serial]
    fn test_find_settings_file_in_project_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        let project_dir = temp_dir.path().join(".stackflow");
        fs::create_dir(&project_dir).unwrap();
        write_settings(&project_dir, "stackflow.yaml", 3);
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_settings_file();

        std::env::set_current_dir(original_dir).unwrap();
        assert!(result.unwrap().ends_with(".stackflow/stackflow.yaml"));
    }

    #[test]
    #[serial]
    fn test_find_settings_file_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(&config_path, "workers: 1\n").unwrap();

        unsafe {
            std::env::set_var(CONFIG_PATH_ENV, config_path.to_str().unwrap());
        }

        let result = find_settings_file();

        unsafe {
            std::env::remove_var(CONFIG_PATH_ENV);
        }
        assert_eq!(result.unwrap(), config_path);
    }

    #[test]
    #[serial]
    fn test_missing_file_falls_back_to_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let found = find_settings_file();
        let loaded = load_settings_or_default();

        std::env::set_current_dir(original_dir).unwrap();

        // A global settings file on the machine running the tests would win
        if matches!(found, Err(ConfigError::SettingsFileNotFound)) {
            let (settings, path) = loaded.unwrap();
            assert_eq!(settings, Settings::default());
            assert!(path.is_none());
        }
    }

    #[test]
    fn test_load_settings_reports_path_on_parse_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("stackflow.yaml");
        fs::write(&path, "workers: [1, 2]\n").unwrap();

        match load_settings(&path) {
            Err(ConfigError::Yaml { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected yaml error, got {:?}", other),
        }
    }
}
