use crate::fitter::{FitSettings, ImageEncoding};
use crate::inference::InferenceParams;
use anyhow::{Result, anyhow, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const STAGING_DIR: &str = "uploads";

/// Main configuration structure that can be loaded from CLI, config file, or environment
///
/// Example configuration file content
/// # VILA relay configuration
///
/// # Server configuration
/// listen_on_port = 5000
/// workspace = "./data"
///
/// # Remote services
/// vila_api_url = "https://ai.api.nvidia.com/v1/vlm/nvidia/vila"
/// assets_api_url = "https://api.nvcf.nvidia.com/v2/nvcf/assets"
///
/// # Uploads
/// allowed_extensions = ["png", "jpg", "jpeg", "gif", "mp4"]
/// max_file_size = 10485760
///
/// # Image fitting
/// max_image_size = 180000
/// max_width = 1200
/// max_height = 1200
/// image_encoding = "png"  # Options: "png" or "jpeg"
///
/// The API key is only read from the CLI or the `NVIDIA_API_KEY` environment
/// variable and never written back out.
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 5000)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Working directory, uploads are staged under `<workspace>/uploads`
    #[arg(short = 'w', long, env = "VILA_WORKSPACE", default_value = ".")]
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Configuration file path
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// VILA inference endpoint
    #[arg(long, env = "NVIDIA_API_URL", default_value_t = default_vila_api_url())]
    #[serde(default = "default_vila_api_url")]
    pub vila_api_url: String,

    /// Bearer token for both the inference and the asset service
    #[arg(long, env = "NVIDIA_API_KEY", hide_env_values = true)]
    #[serde(skip)]
    pub api_key: Option<String>,

    /// Asset storage endpoint used for video uploads
    #[arg(long, env = "NVIDIA_ASSETS_URL", default_value_t = default_assets_api_url())]
    #[serde(default = "default_assets_api_url")]
    pub assets_api_url: String,

    /// Model name sent with every inference request
    #[arg(long, env = "VILA_MODEL", default_value_t = default_model())]
    #[serde(default = "default_model")]
    pub model: String,

    /// Accepted upload extensions, matched case-insensitively
    #[arg(
        long,
        env = "ALLOWED_EXTENSIONS",
        value_delimiter = ',',
        default_values_t = default_allowed_extensions()
    )]
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Maximum upload size in bytes
    #[arg(long, env = "MAX_FILE_SIZE", default_value_t = default_max_file_size())]
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,

    /// Byte budget for the base64 text of an inlined image
    #[arg(long, env = "MAX_IMAGE_SIZE", default_value_t = default_max_image_size())]
    #[serde(default = "default_max_image_size")]
    pub max_image_size: usize,

    #[arg(long, env = "MAX_WIDTH", default_value_t = default_max_dimension())]
    #[serde(default = "default_max_dimension")]
    pub max_width: u32,

    #[arg(long, env = "MAX_HEIGHT", default_value_t = default_max_dimension())]
    #[serde(default = "default_max_dimension")]
    pub max_height: u32,

    /// Smallest width or height the fitter may shrink an image to
    #[arg(long, env = "MIN_DIMENSION", default_value_t = default_min_dimension())]
    #[serde(default = "default_min_dimension")]
    pub min_dimension: u32,

    #[arg(long, env = "INITIAL_QUALITY", default_value_t = default_initial_quality())]
    #[serde(default = "default_initial_quality")]
    pub initial_quality: u8,

    #[arg(long, env = "MIN_QUALITY", default_value_t = default_min_quality())]
    #[serde(default = "default_min_quality")]
    pub min_quality: u8,

    #[arg(long, env = "QUALITY_STEP", default_value_t = default_quality_step())]
    #[serde(default = "default_quality_step")]
    pub quality_step: u8,

    /// Encoding used for inlined images: png or jpeg
    #[arg(long, env = "IMAGE_ENCODING", value_enum, default_value_t = ImageEncoding::Png)]
    pub image_encoding: ImageEncoding,

    #[arg(long, env = "MAX_TOKENS", default_value_t = default_max_tokens())]
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[arg(long, env = "TEMPERATURE", default_value_t = default_temperature())]
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[arg(long, env = "TOP_P", default_value_t = default_top_p())]
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[arg(long, env = "SEED", default_value_t = default_seed())]
    #[serde(default = "default_seed")]
    pub seed: u64,

    #[arg(long, env = "NUM_FRAMES_PER_INFERENCE", default_value_t = default_num_frames())]
    #[serde(default = "default_num_frames")]
    pub num_frames_per_inference: u32,

    /// Timeout in seconds for control calls (asset creation/deletion, inference)
    #[arg(long, env = "REQUEST_TIMEOUT", default_value_t = default_request_timeout())]
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout in seconds for pushing asset bytes
    #[arg(long, env = "STREAM_TIMEOUT", default_value_t = default_stream_timeout())]
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_on_port: default_port(),
            workspace: default_workspace(),
            config: None,
            vila_api_url: default_vila_api_url(),
            api_key: None,
            assets_api_url: default_assets_api_url(),
            model: default_model(),
            allowed_extensions: default_allowed_extensions(),
            max_file_size: default_max_file_size(),
            max_image_size: default_max_image_size(),
            max_width: default_max_dimension(),
            max_height: default_max_dimension(),
            min_dimension: default_min_dimension(),
            initial_quality: default_initial_quality(),
            min_quality: default_min_quality(),
            quality_step: default_quality_step(),
            image_encoding: ImageEncoding::Png,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            seed: default_seed(),
            num_frames_per_inference: default_num_frames(),
            request_timeout_secs: default_request_timeout(),
            stream_timeout_secs: default_stream_timeout(),
        }
    }
}

// Take the file value when the CLI/env value was left at its default.
macro_rules! prefer_file {
    ($this:ident, $file:ident, $($field:ident => $default:expr),+ $(,)?) => {
        $(
            if $this.$field == $default {
                $this.$field = $file.$field;
            }
        )+
    };
}

impl Config {
    /// Load configuration from CLI args and environment, optionally merging with a config file
    pub fn load() -> Result<Self> {
        let mut config = Config::parse();

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args and env take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        prefer_file!(self, file_config,
            listen_on_port => default_port(),
            workspace => default_workspace(),
            vila_api_url => default_vila_api_url(),
            assets_api_url => default_assets_api_url(),
            model => default_model(),
            allowed_extensions => default_allowed_extensions(),
            max_file_size => default_max_file_size(),
            max_image_size => default_max_image_size(),
            max_width => default_max_dimension(),
            max_height => default_max_dimension(),
            min_dimension => default_min_dimension(),
            initial_quality => default_initial_quality(),
            min_quality => default_min_quality(),
            quality_step => default_quality_step(),
            image_encoding => ImageEncoding::Png,
            max_tokens => default_max_tokens(),
            temperature => default_temperature(),
            top_p => default_top_p(),
            seed => default_seed(),
            num_frames_per_inference => default_num_frames(),
            request_timeout_secs => default_request_timeout(),
            stream_timeout_secs => default_stream_timeout(),
        );
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_key().is_none() {
            bail!("NVIDIA_API_KEY environment variable is required");
        }

        for (name, url) in [
            ("vila_api_url", &self.vila_api_url),
            ("assets_api_url", &self.assets_api_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(anyhow!("{name} must start with http:// or https://"));
            }
        }

        if self.allowed_extensions.iter().all(|ext| ext.is_empty()) {
            bail!("At least one allowed file extension is required");
        }

        if self.max_file_size == 0 || self.max_image_size == 0 {
            bail!("max_file_size and max_image_size must be greater than zero");
        }

        if self.max_width == 0 || self.max_height == 0 {
            bail!("max_width and max_height must be greater than zero");
        }

        if self.min_dimension == 0 {
            bail!("min_dimension must be greater than zero");
        }

        if self.min_dimension > self.max_width.min(self.max_height) {
            bail!(
                "min_dimension ({}) cannot exceed max_width/max_height",
                self.min_dimension
            );
        }

        if !(1..=100).contains(&self.min_quality) || !(1..=100).contains(&self.initial_quality) {
            bail!("Image quality can only be set in the range 1-100");
        }

        if self.min_quality > self.initial_quality {
            bail!(
                "min_quality ({}) cannot exceed initial_quality ({})",
                self.min_quality,
                self.initial_quality
            );
        }

        if self.quality_step == 0 {
            bail!("quality_step must be greater than zero");
        }

        Ok(())
    }

    /// API key, treating an empty value as missing
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn staging_dir(&self) -> PathBuf {
        PathBuf::from(&self.workspace).join(STAGING_DIR)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn fit_settings(&self) -> FitSettings {
        FitSettings {
            max_encoded_len: self.max_image_size,
            max_width: self.max_width,
            max_height: self.max_height,
            min_dimension: self.min_dimension,
            initial_quality: self.initial_quality,
            min_quality: self.min_quality,
            quality_step: self.quality_step,
            encoding: self.image_encoding,
        }
    }

    pub fn inference_params(&self) -> InferenceParams {
        InferenceParams {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.seed,
            num_frames_per_inference: self.num_frames_per_inference,
        }
    }
}

// Default value functions
fn default_port() -> u16 {
    5000
}

fn default_workspace() -> String {
    ".".to_string()
}

fn default_vila_api_url() -> String {
    "https://ai.api.nvidia.com/v1/vlm/nvidia/vila".to_string()
}

fn default_assets_api_url() -> String {
    "https://api.nvcf.nvidia.com/v2/nvcf/assets".to_string()
}

fn default_model() -> String {
    "nvidia/vila".to_string()
}

fn default_allowed_extensions() -> Vec<String> {
    ["png", "jpg", "jpeg", "gif", "mp4"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_max_file_size() -> usize {
    10 * 1024 * 1024
}

fn default_max_image_size() -> usize {
    180_000
}

fn default_max_dimension() -> u32 {
    1200
}

fn default_min_dimension() -> u32 {
    100
}

fn default_initial_quality() -> u8 {
    95
}

fn default_min_quality() -> u8 {
    60
}

fn default_quality_step() -> u8 {
    5
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.20
}

fn default_top_p() -> f32 {
    0.70
}

fn default_seed() -> u64 {
    50
}

fn default_num_frames() -> u32 {
    8
}

fn default_request_timeout() -> u64 {
    30
}

fn default_stream_timeout() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_key() -> Config {
        Config {
            api_key: Some("nvapi-test".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_api_key_is_rejected() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("NVIDIA_API_KEY"));

        let blank = Config {
            api_key: Some("   ".into()),
            ..Default::default()
        };
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = with_key();
        config.validate().unwrap();
        assert_eq!(config.staging_dir(), PathBuf::from("./uploads"));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.stream_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_quality_range_is_checked() {
        let config = Config {
            min_quality: 96,
            ..with_key()
        };
        assert!(config.validate().is_err());

        let config = Config {
            quality_step: 0,
            ..with_key()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_min_dimension_is_rejected() {
        let config = Config {
            min_dimension: 0,
            ..with_key()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_dimension"));
    }

    #[test]
    fn test_urls_must_be_http() {
        let config = Config {
            assets_api_url: "ftp://assets".into(),
            ..with_key()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("assets_api_url"));
    }

    #[test]
    fn test_file_values_fill_in_defaults() {
        let file: Config = toml::from_str(
            r#"
            listen_on_port = 8080
            max_image_size = 90000
            allowed_extensions = [".PNG", "mp4"]
            image_encoding = "jpeg"
            "#,
        )
        .unwrap();

        let cli = Config {
            max_width: 640,
            ..with_key()
        };
        let merged = cli.merge_with_file(file);

        assert_eq!(merged.listen_on_port, 8080);
        assert_eq!(merged.max_image_size, 90000);
        assert_eq!(merged.max_width, 640);
        assert_eq!(merged.allowed_extensions, vec![".PNG", "mp4"]);
        assert_eq!(merged.image_encoding, ImageEncoding::Jpeg);
        assert_eq!(merged.api_key(), Some("nvapi-test"));
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let rendered = toml::to_string(&with_key()).unwrap();
        assert!(!rendered.contains("nvapi-test"));
    }
}
