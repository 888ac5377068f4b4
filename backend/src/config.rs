use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strum::{Display, EnumString};

use crate::validator::ValidationLimits;

pub const DEFAULT_CONFIG_PATH: &str = "config/server.yaml";

pub const DEFAULT_CLASSES: [&str; 7] = [
    "Copepod",
    "Diatom",
    "Dinoflagellate",
    "Radiolarian",
    "Foraminifera",
    "Cyanobacteria",
    "Other",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("Invalid value for {key}: {value}")]
    InvalidOverride { key: &'static str, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RuntimeKind {
    Native,
    Torch,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DevicePreference {
    Auto,
    Cpu,
    Cuda,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub upload_dir: PathBuf,
    pub max_content_length: usize,
    pub min_file_bytes: u64,
    pub min_dimension: u32,
    pub max_dimension: u32,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: Option<PathBuf>,
    pub runtime: RuntimeKind,
    pub device: DevicePreference,
    pub classes: Vec<String>,
    pub input_size: u32,
    pub seed: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            upload_dir: PathBuf::from("uploads"),
            max_content_length: 16 * 1024 * 1024,
            min_file_bytes: 100,
            min_dimension: 50,
            max_dimension: 4000,
            model: ModelConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            runtime: RuntimeKind::Native,
            device: DevicePreference::Auto,
            classes: DEFAULT_CLASSES.iter().map(|c| c.to_string()).collect(),
            input_size: 224,
            seed: 42,
        }
    }
}

impl ServerConfig {
    /// Defaults, then the YAML file named by `PLANKTON_CONFIG`, then
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let explicit = env::var("PLANKTON_CONFIG").ok();
        let path = PathBuf::from(explicit.as_deref().unwrap_or(DEFAULT_CONFIG_PATH));
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            if explicit.is_some() {
                log::warn!("Config file {} not found, using defaults", path.display());
            }
            Self::default()
        };

        config.apply_overrides(|key| env::var(key).ok())?;
        config.check()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.port = parse_override("PORT", port)?;
        }
        if let Some(dir) = lookup("UPLOAD_FOLDER") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(model_path) = lookup("MODEL_PATH") {
            self.model.path = (!model_path.is_empty()).then(|| PathBuf::from(model_path));
        }
        if let Some(runtime) = lookup("INFERENCE_RUNTIME") {
            self.model.runtime = parse_override("INFERENCE_RUNTIME", runtime.to_lowercase())?;
        }
        if let Some(device) = lookup("INFERENCE_DEVICE") {
            self.model.device = parse_override("INFERENCE_DEVICE", device.to_lowercase())?;
        }
        Ok(())
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.model.classes.is_empty() {
            return Err(ConfigError::Invalid("class vocabulary is empty".into()));
        }
        if self.min_dimension > self.max_dimension {
            return Err(ConfigError::Invalid(format!(
                "min_dimension {} exceeds max_dimension {}",
                self.min_dimension, self.max_dimension
            )));
        }
        if self.model.input_size == 0 {
            return Err(ConfigError::Invalid("input_size must be positive".into()));
        }
        Ok(())
    }

    pub fn validation_limits(&self) -> ValidationLimits {
        ValidationLimits {
            min_bytes: self.min_file_bytes,
            max_bytes: self.max_content_length as u64,
            min_dimension: self.min_dimension,
            max_dimension: self.max_dimension,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_override<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidOverride { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_limits() {
        let config = ServerConfig::default();
        assert_eq!(config.max_content_length, 16 * 1024 * 1024);
        assert_eq!(config.min_file_bytes, 100);
        assert_eq!(config.min_dimension, 50);
        assert_eq!(config.max_dimension, 4000);
        assert_eq!(config.model.input_size, 224);
        assert_eq!(config.model.classes.len(), 7);
        assert!(config.check().is_ok());
    }

    #[test]
    fn yaml_file_overrides_selected_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        std::fs::write(
            &path,
            "port: 8081\nmodel:\n  runtime: disabled\n  classes: [A, B]\n",
        )
        .unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.port, 8081);
        assert_eq!(config.model.runtime, RuntimeKind::Disabled);
        assert_eq!(config.model.classes, vec!["A", "B"]);
        assert_eq!(config.max_dimension, 4000);
    }

    #[test]
    fn malformed_yaml_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        std::fs::write(&path, "port: [not a number\n").unwrap();
        assert!(matches!(
            ServerConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn environment_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("PORT", "9000"),
            ("MODEL_PATH", "models/plankton.json"),
            ("INFERENCE_RUNTIME", "Torch"),
            ("INFERENCE_DEVICE", "cpu"),
        ]
        .into_iter()
        .collect();

        let mut config = ServerConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.model.path, Some(PathBuf::from("models/plankton.json")));
        assert_eq!(config.model.runtime, RuntimeKind::Torch);
        assert_eq!(config.model.device, DevicePreference::Cpu);
    }

    #[test]
    fn bad_override_is_rejected() {
        let mut config = ServerConfig::default();
        let err = config
            .apply_overrides(|key| (key == "PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { key: "PORT", .. }));
    }
}
