use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dsl::context::DEFAULT_MAX_CALL_DEPTH;
use crate::dsl::ExecutionMode;
use crate::error::CtlError;
use crate::transform::DataErrorPolicy;

// ── Engine settings ───────────────────────────────────────────────

/// Engine configuration, read from a JSON file. Missing fields take their
/// defaults, so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub version: u32,
    /// Opt in to keeping global variables between runs instead of re-running
    /// global code.
    pub keep_global_scope: bool,
    /// Back-end for sources without a `//#CTL2` pragma.
    pub default_mode: ExecutionMode,
    pub data_error_policy: DataErrorPolicy,
    pub max_call_depth: usize,
    /// `env_logger` filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

const SETTINGS_VERSION: u32 = 1;

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            keep_global_scope: false,
            default_mode: ExecutionMode::Interpret,
            data_error_policy: DataErrorPolicy::Strict,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            log_level: "info".to_string(),
        }
    }
}

/// Load settings from `path`. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<EngineSettings, CtlError> {
    if !path.exists() {
        log::debug!("no settings at {}, using defaults", path.display());
        return Ok(EngineSettings::default());
    }
    let settings: EngineSettings = read_json(path)?;
    if settings.version > SETTINGS_VERSION {
        log::warn!(
            "settings version {} is newer than supported version {SETTINGS_VERSION}",
            settings.version
        );
    }
    Ok(settings)
}

/// Save settings to `path` as pretty-printed JSON.
pub fn save_settings(path: &Path, settings: &EngineSettings) -> Result<(), CtlError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CtlError> {
    let data = std::fs::read_to_string(path)?;
    let value = serde_json::from_str(&data)?;
    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip() {
        let dir = std::env::temp_dir().join("ctl_test_settings");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("settings.json");

        let settings = EngineSettings {
            default_mode: ExecutionMode::Compile,
            data_error_policy: DataErrorPolicy::Skip,
            ..EngineSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path).unwrap(), settings);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = std::env::temp_dir().join("ctl_test_partial_settings");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, r#"{ "default_mode": "compile", "max_call_depth": 64 }"#).unwrap();

        let loaded = load_settings(&path).unwrap();
        assert_eq!(loaded.default_mode, ExecutionMode::Compile);
        assert_eq!(loaded.max_call_depth, 64);
        assert!(!loaded.keep_global_scope);
        assert_eq!(loaded.data_error_policy, DataErrorPolicy::Strict);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_returns_defaults() {
        let path = std::env::temp_dir().join("ctl_test_no_settings").join("settings.json");
        assert_eq!(load_settings(&path).unwrap(), EngineSettings::default());
    }
}
