//! Configuration management for vectis

pub mod schema;
pub mod suite;

pub use schema::Config;
pub use suite::Suite;

use crate::error::{VectisError, VectisResult};
use schema::builtin_vendors;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vectis")
            .join("config.toml")
    }

    /// Get the default artifact storage root
    pub fn default_storage_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vectis")
    }

    /// Load configuration, using defaults if the file does not exist
    ///
    /// Built-in vendors are merged underneath whatever the file defines and
    /// every suite chain is checked, so a cyclic `base` fails here rather
    /// than halfway through a build.
    pub async fn load(&self) -> VectisResult<Config> {
        let mut config = if self.config_path.exists() {
            self.load_from_file(&self.config_path).await?
        } else {
            debug!("Config file not found, using defaults");
            Config::default()
        };

        merge_builtin_vendors(&mut config);

        config
            .validate_suites()
            .map_err(|e| VectisError::ConfigInvalid {
                path: self.config_path.clone(),
                reason: e.to_string(),
            })?;

        Ok(config)
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> VectisResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| VectisError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| VectisError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> VectisResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            VectisError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> VectisResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| VectisError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Storage root with `~` expanded
    pub fn storage_root(&self) -> PathBuf {
        match self.storage.root {
            Some(ref root) => expand_home(root),
            None => ConfigManager::default_storage_root(),
        }
    }

    /// Architecture to build for when none is given
    pub fn default_architecture(&self) -> String {
        self.defaults
            .architecture
            .clone()
            .unwrap_or_else(host_architecture)
    }

    /// Suite to build for when none is given
    pub fn default_suite(&self, vendor: &str) -> Option<String> {
        self.defaults.suite.clone().or_else(|| {
            self.vendors
                .get(vendor)
                .and_then(|v| v.default_suite.clone())
        })
    }
}

fn merge_builtin_vendors(config: &mut Config) {
    for (name, builtin) in builtin_vendors() {
        config
            .vendors
            .entry(name)
            .and_modify(|v| v.fill_from(&builtin))
            .or_insert(builtin);
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Debian name of the host architecture
pub fn host_architecture() -> String {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "i386",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "powerpc64" => "ppc64el",
        "s390x" => "s390x",
        "riscv64" => "riscv64",
        other => other,
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_default_when_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nonexistent.toml");
        let manager = ConfigManager::with_path(path);

        let config = manager.load().await.unwrap();
        assert_eq!(config.defaults.vendor, "debian");
        assert!(config.vendors.contains_key("debian"));
        assert_eq!(config.default_suite("debian").as_deref(), Some("sid"));
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let manager = ConfigManager::with_path(path);

        let mut config = Config::default();
        config.worker.backend = "schroot".to_string();
        config.storage.root = Some(temp.path().join("storage"));

        manager.save(&config).await.unwrap();
        let loaded = manager.load().await.unwrap();

        assert_eq!(loaded.worker.backend, "schroot");
        assert_eq!(loaded.storage_root(), temp.path().join("storage"));
    }

    #[tokio::test]
    async fn cyclic_suites_rejected_at_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        tokio::fs::write(
            &path,
            "[vendors.debian.suites.one]\nbase = \"two\"\n[vendors.debian.suites.two]\nbase = \"one\"\n",
        )
        .await
        .unwrap();

        let err = ConfigManager::with_path(path).load().await.unwrap_err();
        assert!(matches!(err, VectisError::ConfigInvalid { .. }));
        assert!(err.to_string().contains("cyclic"));
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(
            expand_home(Path::new("/srv/vectis")),
            PathBuf::from("/srv/vectis")
        );
    }
}
