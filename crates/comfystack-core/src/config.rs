//! Stack configuration
//!
//! Built-in defaults, optionally overlaid by a TOML file and then by
//! environment variables:
//!
//! - `COMFYSTACK_HF_ENDPOINT` overrides the model download endpoint
//! - `COMFYSTACK_COMMAND_TIMEOUT_SECS` overrides the per-command timeout

use crate::catalog::{COMFY_REPO_URL, MANAGER_REPO_URL, WAN_REPO};
use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// File name looked up in the target root when no `--config` is given.
pub const CONFIG_FILE_NAME: &str = "comfystack.toml";

/// Tunables that are not part of a single request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Application git URL
    pub app_repo_url: String,
    /// Extension git URL
    pub extension_repo_url: String,
    /// Hugging Face repository for model assets
    pub model_repo: String,
    /// Hugging Face endpoint (mirrors can be substituted)
    pub hf_endpoint: String,
    /// Revision model files are resolved against
    pub model_revision: String,
    /// Timeout applied to every external command, 0 disables it
    pub command_timeout_secs: u64,
    /// How long a launched process must survive to count as started
    pub launch_grace_ms: u64,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            app_repo_url: COMFY_REPO_URL.to_string(),
            extension_repo_url: MANAGER_REPO_URL.to_string(),
            model_repo: WAN_REPO.to_string(),
            hf_endpoint: "https://huggingface.co".to_string(),
            model_revision: "main".to_string(),
            command_timeout_secs: 3600,
            launch_grace_ms: 1500,
        }
    }
}

impl StackConfig {
    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, `<root>/comfystack.toml`
    /// is read when present. Environment overrides apply last.
    pub fn load(path: Option<&Path>, root: &Path) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let candidate = root.join(CONFIG_FILE_NAME);
                if candidate.is_file() {
                    Self::from_file(&candidate)?
                } else {
                    StackConfig::default()
                }
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", path);
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProvisionError::Config(format!("cannot read {:?}: {e}", path)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ProvisionError::Config(e.to_string()))
    }

    fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("COMFYSTACK_HF_ENDPOINT") {
            self.hf_endpoint = endpoint;
        }
        if let Some(raw) = lookup("COMFYSTACK_COMMAND_TIMEOUT_SECS") {
            self.command_timeout_secs = raw.trim().parse().map_err(|_| {
                ProvisionError::Config(format!(
                    "COMFYSTACK_COMMAND_TIMEOUT_SECS must be an integer, got '{raw}'"
                ))
            })?;
        }
        Ok(())
    }

    /// Download URL of a repository-relative model file.
    pub fn asset_url(&self, repo_path: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.hf_endpoint.trim_end_matches('/'),
            self.model_repo,
            self.model_revision,
            repo_path
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = StackConfig::default();
        assert_eq!(config.model_repo, WAN_REPO);
        assert!(config.command_timeout_secs > 0);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = StackConfig::from_toml("launch_grace_ms = 10\n").unwrap();
        assert_eq!(config.launch_grace_ms, 10);
        assert_eq!(config.app_repo_url, COMFY_REPO_URL);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = StackConfig::from_toml("launch_grace_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = StackConfig::default();
        config
            .apply_env_overrides(|key| match key {
                "COMFYSTACK_HF_ENDPOINT" => Some("https://hf-mirror.example/".to_string()),
                "COMFYSTACK_COMMAND_TIMEOUT_SECS" => Some("42".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.command_timeout_secs, 42);
        assert_eq!(
            config.asset_url("split_files/vae/a.safetensors"),
            format!("https://hf-mirror.example/{WAN_REPO}/resolve/main/split_files/vae/a.safetensors")
        );
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = StackConfig::default();
        let result = config.apply_env_overrides(|key| {
            (key == "COMFYSTACK_COMMAND_TIMEOUT_SECS").then(|| "forever".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_load_reads_root_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "model_revision = \"v2\"\n").unwrap();
        let config = StackConfig::load(None, dir.path()).unwrap();
        assert_eq!(config.model_revision, "v2");
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(StackConfig::load(Some(&missing), dir.path()).is_err());
    }
}
