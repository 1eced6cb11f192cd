use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_PATH_ENV: &str = "XRAY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/app.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub storage: StorageConfig,
    pub overlay: OverlayConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub alpha: f32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            model: ModelConfig::default(),
            storage: StorageConfig::default(),
            overlay: OverlayConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8081,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/xray_classifier.json"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("static/uploads"),
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            alpha: crate::pipeline::DEFAULT_ALPHA,
        }
    }
}

impl AppConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Reads the file named by `XRAY_CONFIG` (or the default path), falling
    /// back to defaults when it does not exist, then applies environment
    /// overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let path = Path::new(&path);
        let config = if path.exists() {
            log::info!("Loading configuration from {}", path.display());
            Self::load_file(path)?
        } else {
            log::warn!("Config file {} not found, using defaults", path.display());
            Self::default()
        };
        config.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `HOST`, `PORT`, `MODEL_PATH` and `UPLOAD_ROOT` from `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PORT is not a port number: {}", port)))?;
        }
        if let Some(model) = lookup("MODEL_PATH") {
            self.model.path = model.into();
        }
        if let Some(root) = lookup("UPLOAD_ROOT") {
            self.storage.root = root.into();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.overlay.alpha > 0.0 && self.overlay.alpha <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "overlay.alpha must be in (0, 1], got {}",
                self.overlay.alpha
            )));
        }
        if self.storage.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid("storage.max_upload_bytes must be positive".into()));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_document_yields_defaults() {
        let config = AppConfig::from_yaml("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.storage.max_upload_bytes, 16 * 1024 * 1024);
        assert_eq!(config.overlay.alpha, 0.4);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = AppConfig::from_yaml("server:\n  port: 9000\noverlay:\n  alpha: 0.5\n").unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.overlay.alpha, 0.5);
        assert_eq!(config.bind_address(), "0.0.0.0:9000");
    }

    #[test]
    fn alpha_outside_unit_interval_is_rejected() {
        assert!(matches!(
            AppConfig::from_yaml("overlay:\n  alpha: 1.5\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(AppConfig::from_yaml("overlay:\n  alpha: 0\n").is_err());
    }

    #[test]
    fn environment_overrides_win() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PORT", "5000"),
            ("MODEL_PATH", "/models/best.json"),
            ("UPLOAD_ROOT", "/var/uploads"),
        ]);
        let config = AppConfig::default()
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.model.path, PathBuf::from("/models/best.json"));
        assert_eq!(config.storage.root, PathBuf::from("/var/uploads"));
    }

    #[test]
    fn bad_port_override_is_an_error() {
        let err = AppConfig::default()
            .with_overrides(|k| (k == "PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("eighty"));
    }
}
