use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crosscode_ops::DeviceInfo;
use crosscode_util::{BACKEND_ADDR_ENV, DEFAULT_BACKEND_ADDR};
use serde::{Deserialize, Serialize};
use tracing::warn;

const CLI_CONFIG_FILE: &str = "cli-config.json";

/// Settings remembered between CLI runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct CliConfig {
    pub(crate) backend_addr: String,
    pub(crate) toolchain_path: String,
    pub(crate) last_xcode_path: String,
    pub(crate) last_project_path: String,
    pub(crate) last_device: Option<DeviceInfo>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            backend_addr: DEFAULT_BACKEND_ADDR.to_string(),
            toolchain_path: String::new(),
            last_xcode_path: String::new(),
            last_project_path: String::new(),
            last_device: None,
        }
    }
}

impl CliConfig {
    pub(crate) fn load() -> Self {
        let env_addr = std::env::var(BACKEND_ADDR_ENV).ok();
        Self::load_from(&cli_config_path(), env_addr)
    }

    /// Reads `path` and applies `env_addr` on top. A missing or unreadable
    /// file yields defaults.
    pub(crate) fn load_from(path: &Path, env_addr: Option<String>) -> Self {
        let mut cfg = match fs::read_to_string(path) {
            Ok(data) => serde_json::from_str::<CliConfig>(&data).unwrap_or_else(|err| {
                warn!("Failed to parse {}: {err}", path.display());
                CliConfig::default()
            }),
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {err}", path.display());
                }
                CliConfig::default()
            }
        };
        if cfg.backend_addr.trim().is_empty() {
            cfg.backend_addr = DEFAULT_BACKEND_ADDR.to_string();
        }
        if let Some(addr) = env_addr.filter(|addr| !addr.trim().is_empty()) {
            cfg.backend_addr = addr.trim().to_string();
        }
        cfg
    }

    pub(crate) fn save(&self) -> io::Result<()> {
        self.save_to(&cli_config_path())
    }

    pub(crate) fn save_to(&self, path: &Path) -> io::Result<()> {
        crosscode_util::write_json_atomic(path, self)
    }
}

fn cli_config_path() -> PathBuf {
    crosscode_util::state_file_path(CLI_CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CliConfig::load_from(&dir.path().join(CLI_CONFIG_FILE), None);
        assert_eq!(cfg, CliConfig::default());
    }

    #[test]
    fn env_address_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CLI_CONFIG_FILE);
        let saved = CliConfig {
            backend_addr: "10.0.0.2:50061".into(),
            toolchain_path: "/opt/swift".into(),
            ..CliConfig::default()
        };
        saved.save_to(&path).unwrap();

        assert_eq!(CliConfig::load_from(&path, None), saved);
        let cfg = CliConfig::load_from(&path, Some("127.0.0.1:6000".into()));
        assert_eq!(cfg.backend_addr, "127.0.0.1:6000");
        assert_eq!(cfg.toolchain_path, "/opt/swift");
    }

    #[test]
    fn partial_or_broken_files_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CLI_CONFIG_FILE);

        fs::write(&path, r#"{"last_project_path": "/src/app", "backend_addr": ""}"#).unwrap();
        let cfg = CliConfig::load_from(&path, Some("  ".into()));
        assert_eq!(cfg.last_project_path, "/src/app");
        assert_eq!(cfg.backend_addr, DEFAULT_BACKEND_ADDR);

        fs::write(&path, "not json").unwrap();
        assert_eq!(CliConfig::load_from(&path, None), CliConfig::default());
    }
}
