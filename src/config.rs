use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::caption::blip::DEFAULT_MAX_TOKENS;
use crate::caption::default_model_dir;

/// Top-level configuration for the captioning service.
///
/// Every section falls back to its defaults when absent, so a config file
/// only needs the keys it changes.
///
/// # Loading
///
/// ```rust,no_run
/// use exif_caption::config::Config;
///
/// // From a JSON file
/// let config = Config::load(Some("config.json".as_ref())).unwrap();
///
/// // Or use defaults and customize
/// let mut config = Config::default();
/// config.server.port = 8080;
/// config.metadata.embed_caption = false;
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener and request limits.
    pub server: ServerConfig,
    /// Where uploads are staged and whether they are kept.
    pub storage: StorageConfig,
    /// BLIP model location and inference settings.
    pub model: ModelConfig,
    /// What gets written back into the image.
    pub metadata: MetadataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted request body, in bytes.
    pub max_upload_bytes: usize,
    /// Caption calls allowed in flight at once. Extra requests wait.
    pub max_concurrent_captions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for staged uploads. Created on demand.
    pub upload_dir: PathBuf,
    /// If `false`, a staged upload is deleted once its response is built.
    pub retain_uploads: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory holding `model.safetensors` and `tokenizer.json`.
    /// `None` means the platform cache directory.
    pub model_dir: Option<PathBuf>,
    /// Skip GPU detection and run on the CPU.
    pub force_cpu: bool,
    /// Upper bound on generated tokens per caption.
    pub max_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Write the caption into the image's ImageDescription field.
    pub embed_caption: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            max_upload_bytes: 16 * 1024 * 1024,
            max_concurrent_captions: 1,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            retain_uploads: true,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: None,
            force_cpu: false,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            embed_caption: true,
        }
    }
}

impl ModelConfig {
    /// Configured model directory, or the platform cache default.
    pub fn resolve_dir(&self) -> Result<PathBuf> {
        match &self.model_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_model_dir(),
        }
    }

    /// Configured token limit. Zero falls back to the generator default.
    pub fn max_tokens(&self) -> usize {
        if self.max_tokens == 0 {
            DEFAULT_MAX_TOKENS
        } else {
            self.max_tokens
        }
    }
}

impl Config {
    /// Resolve the config file path: `config.json` next to the executable.
    pub fn config_path() -> Result<PathBuf> {
        let exe_path = std::env::current_exe().context("Failed to get executable path")?;
        let exe_dir = exe_path
            .parent()
            .context("Failed to get executable directory")?;
        Ok(exe_dir.join("config.json"))
    }

    /// Load config from the given path, or from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            log::warn!(
                "Config file not found at {}. Using defaults.",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save config to the given path, or to the default location.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents).context("Failed to write config file")?;
        log::info!("Config saved to {}", config_path.display());
        Ok(())
    }

    /// Socket address string for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(Some(&dir.path().join("nope.json"))).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.max_upload_bytes, 16 * 1024 * 1024);
        assert_eq!(config.server.max_concurrent_captions, 1);
        assert!(config.storage.retain_uploads);
        assert!(config.metadata.embed_caption);
        assert_eq!(config.model.max_tokens(), DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "server": { "port": 8080 }, "metadata": { "embed_caption": false } }"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(!config.metadata.embed_caption);
        assert_eq!(config.storage.upload_dir, PathBuf::from("uploads"));
        assert_eq!(config.bind_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.model.force_cpu = true;
        config.model.max_tokens = 32;
        config.storage.retain_uploads = false;
        config.save(Some(&path)).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert!(loaded.model.force_cpu);
        assert_eq!(loaded.model.max_tokens(), 32);
        assert_eq!(loaded.model.model_dir, None);
        assert!(!loaded.storage.retain_uploads);
    }

    #[test]
    fn explicit_model_dir_wins() {
        let mut config = Config::default();
        config.model.model_dir = Some(PathBuf::from("/opt/blip"));
        assert_eq!(config.model.resolve_dir().unwrap(), PathBuf::from("/opt/blip"));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
