use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/app.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub version: u32,
    pub server: ServerConfig,
    pub upload: UploadConfig,
    pub display: DisplayConfig,
    pub model: ModelConfig,
    pub saliency: SaliencyConfig,
    pub registry: RegistryConfig,
    pub about: AboutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub serve_without_model: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub max_bytes: usize,
    pub allowed_mime_types: Vec<String>,
    pub max_decoded_dimension: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub max_dimension: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceConfig {
    Auto,
    Cpu,
    Cuda,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelOutput {
    Logits,
    Probabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub path: PathBuf,
    pub version: String,
    pub architecture: String,
    pub device: DeviceConfig,
    pub layout: TensorLayout,
    pub output: ModelOutput,
    pub saliency_layer: SaliencyLayerConfig,
    pub preprocessing: PreprocessingConfig,
}

/// TorchScript methods that split the network at the Grad-CAM target layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaliencyLayerConfig {
    pub features_method: String,
    pub head_method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    pub version: String,
    pub input_size: u32,
    pub equalize_histogram: bool,
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaliencyConfig {
    pub heatmap_alpha: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AboutConfig {
    pub title: String,
    pub description: String,
    pub dataset: String,
    pub accuracy: String,
    pub sensitivity: String,
}

impl AppConfig {
    /// Loads the config named by `APP_CONFIG` (or the default path) and
    /// applies the `PORT` / `MODEL_PATH` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("APP_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(&path)?;

        if let Ok(port) = std::env::var("PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PORT is not a valid port: {}", port)))?;
        }
        if let Ok(model_path) = std::env::var("MODEL_PATH") {
            config.model.path = PathBuf::from(model_path);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let preprocessing = &self.model.preprocessing;
        if preprocessing.mean.len() != 3 || preprocessing.std.len() != 3 {
            return Err(ConfigError::Invalid(format!(
                "preprocessing profile {} needs exactly 3 mean and 3 std values",
                preprocessing.version
            )));
        }
        if preprocessing.std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(ConfigError::Invalid(
                "preprocessing std values must be positive".into(),
            ));
        }
        if preprocessing.mean.iter().any(|m| !m.is_finite()) {
            return Err(ConfigError::Invalid(
                "preprocessing mean values must be finite".into(),
            ));
        }
        if preprocessing.input_size == 0 {
            return Err(ConfigError::Invalid("input_size must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.saliency.heatmap_alpha) {
            return Err(ConfigError::Invalid(
                "heatmap_alpha must be within [0, 1]".into(),
            ));
        }
        if self.upload.max_bytes == 0 {
            return Err(ConfigError::Invalid("upload.max_bytes must be > 0".into()));
        }
        if self.upload.allowed_mime_types.is_empty() {
            return Err(ConfigError::Invalid(
                "upload.allowed_mime_types must not be empty".into(),
            ));
        }
        if self.display.max_dimension == 0 || self.upload.max_decoded_dimension == 0 {
            return Err(ConfigError::Invalid(
                "display and decode dimensions must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl PreprocessingConfig {
    pub fn mean_array(&self) -> [f32; 3] {
        [self.mean[0], self.mean[1], self.mean[2]]
    }

    pub fn std_array(&self) -> [f32; 3] {
        [self.std[0], self.std[1], self.std[2]]
    }
}

#[cfg(test)]
pub(crate) const BUNDLED_CONFIG: &str = include_str!("../../config/app.yaml");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_config_parses() {
        let config = AppConfig::from_yaml_str(BUNDLED_CONFIG).unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.upload.max_bytes, 16 * 1024 * 1024);
        assert_eq!(config.model.preprocessing.input_size, 224);
        assert_eq!(config.model.layout, TensorLayout::Nchw);
        assert_eq!(config.model.output, ModelOutput::Logits);
        assert_eq!(config.model.device, DeviceConfig::Auto);
        assert!(config.upload.allowed_mime_types.contains(&"image/png".to_string()));
        assert!(!config.server.serve_without_model);
        assert_eq!(config.about.accuracy, "84.3%");
        assert_eq!(config.about.sensitivity, "91%");
    }

    #[test]
    fn rejects_bad_normalization_profile() {
        let mut config = AppConfig::from_yaml_str(BUNDLED_CONFIG).unwrap();
        config.model.preprocessing.std = vec![0.229, 0.0, 0.225];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.model.preprocessing.std = vec![0.229, 0.224];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_out_of_range_alpha() {
        let mut config = AppConfig::from_yaml_str(BUNDLED_CONFIG).unwrap();
        config.saliency.heatmap_alpha = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_layout_fails_to_parse() {
        let broken = BUNDLED_CONFIG.replace("layout: nchw", "layout: chw");
        assert!(matches!(
            AppConfig::from_yaml_str(&broken),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = AppConfig::from_file("does/not/exist.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
