//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Production origin hosting keys and segments.
pub const DEFAULT_PRODUCTION_BASE_URL: &str =
    "https://e-linkpower.hcm.s3storage.vn/videos/khoa-hoc";

/// Development origin hosting keys and segments.
pub const DEFAULT_DEVELOPMENT_BASE_URL: &str =
    "https://e-linkpower-dev.hcm.s3storage.vn/videos/khoa-hoc";

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Configuration parsed but holds an unusable value
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    /// Transcoder binary (default "ffmpeg")
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    /// Media inspection binary (default "ffprobe")
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
    /// Random-byte generator binary (default "openssl")
    #[serde(default = "default_openssl")]
    pub openssl: PathBuf,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_openssl() -> PathBuf {
    PathBuf::from("openssl")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            openssl: default_openssl(),
        }
    }
}

/// Segmenting and encoding settings passed to the transcoder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HlsConfig {
    /// Target segment duration in seconds (default 9)
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,
    /// Video codec (default "libx264")
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    /// Audio codec (default "aac")
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    /// Encoder threads (0 = let the encoder decide)
    #[serde(default)]
    pub threads: u32,
}

fn default_segment_seconds() -> u32 {
    9
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            segment_seconds: default_segment_seconds(),
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
            threads: 0,
        }
    }
}

/// Where the 16 key bytes come from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeySourceKind {
    /// `openssl rand` subprocess
    #[default]
    Openssl,
    /// Operating system CSPRNG, no subprocess
    System,
}

impl KeySourceKind {
    /// Parse a key source name, case-insensitively
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "openssl" => Some(KeySourceKind::Openssl),
            "system" | "os" => Some(KeySourceKind::System),
            _ => None,
        }
    }
}

/// Encryption key configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct KeyConfig {
    #[serde(default)]
    pub source: KeySourceKind,
}

/// Selectable origins for the key URL
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BaseUrlConfig {
    /// Known base URLs, in display order
    #[serde(default = "default_base_urls")]
    pub urls: Vec<String>,
    /// Preselected base URL (falls back to the first entry)
    #[serde(default)]
    pub default: Option<String>,
}

fn default_base_urls() -> Vec<String> {
    vec![
        DEFAULT_PRODUCTION_BASE_URL.to_string(),
        DEFAULT_DEVELOPMENT_BASE_URL.to_string(),
    ]
}

impl Default for BaseUrlConfig {
    fn default() -> Self {
        Self {
            urls: default_base_urls(),
            default: None,
        }
    }
}

/// Source of selectable base URLs.
///
/// The packager only needs to enumerate origins; where they are stored is up to
/// the implementation.
pub trait BaseUrlProvider {
    /// All selectable base URLs, in display order
    fn list_base_urls(&self) -> Vec<String>;

    /// The preselected base URL, if any
    fn default_base_url(&self) -> Option<String> {
        self.list_base_urls().into_iter().next()
    }
}

impl BaseUrlProvider for BaseUrlConfig {
    fn list_base_urls(&self) -> Vec<String> {
        let mut urls = self.urls.clone();
        // A configured default that is not in the list is still selectable
        if let Some(default) = &self.default {
            if !urls.contains(default) {
                urls.push(default.clone());
            }
        }
        urls
    }

    fn default_base_url(&self) -> Option<String> {
        self.default
            .clone()
            .or_else(|| self.urls.first().cloned())
    }
}

/// Scratch and output locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkspaceConfig {
    /// Parent directory of per-job workspaces (system temp dir if None)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    /// Directory receiving archives (input file's directory if None)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Keep the job workspace after the job ends
    #[serde(default)]
    pub keep_intermediates: bool,
}

impl WorkspaceConfig {
    /// Resolve the scratch directory, defaulting to `<tmp>/hls-packager`
    pub fn resolved_scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("hls-packager"))
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub hls: HlsConfig,
    #[serde(default)]
    pub key: KeyConfig,
    #[serde(default)]
    pub base_urls: BaseUrlConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - HLS_FFMPEG -> tools.ffmpeg
    /// - HLS_FFPROBE -> tools.ffprobe
    /// - HLS_OPENSSL -> tools.openssl
    /// - HLS_SEGMENT_SECONDS -> hls.segment_seconds
    /// - HLS_THREADS -> hls.threads
    /// - HLS_KEY_SOURCE -> key.source
    /// - HLS_BASE_URLS -> base_urls.urls (comma separated)
    /// - HLS_DEFAULT_BASE_URL -> base_urls.default
    /// - HLS_SCRATCH_DIR -> workspace.scratch_dir
    /// - HLS_OUTPUT_DIR -> workspace.output_dir
    /// - HLS_KEEP_INTERMEDIATES -> workspace.keep_intermediates
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = non_empty_var("HLS_FFMPEG") {
            self.tools.ffmpeg = PathBuf::from(path);
        }

        if let Some(path) = non_empty_var("HLS_FFPROBE") {
            self.tools.ffprobe = PathBuf::from(path);
        }

        if let Some(path) = non_empty_var("HLS_OPENSSL") {
            self.tools.openssl = PathBuf::from(path);
        }

        if let Ok(val) = env::var("HLS_SEGMENT_SECONDS") {
            if let Ok(secs) = val.parse::<u32>() {
                self.hls.segment_seconds = secs;
            }
        }

        if let Ok(val) = env::var("HLS_THREADS") {
            if let Ok(threads) = val.parse::<u32>() {
                self.hls.threads = threads;
            }
        }

        if let Ok(val) = env::var("HLS_KEY_SOURCE") {
            if let Some(source) = KeySourceKind::parse(&val) {
                self.key.source = source;
            }
        }

        if let Ok(val) = env::var("HLS_BASE_URLS") {
            let urls: Vec<String> = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !urls.is_empty() {
                self.base_urls.urls = urls;
            }
        }

        if let Some(url) = non_empty_var("HLS_DEFAULT_BASE_URL") {
            self.base_urls.default = Some(url);
        }

        if let Some(dir) = non_empty_var("HLS_SCRATCH_DIR") {
            self.workspace.scratch_dir = Some(PathBuf::from(dir));
        }

        if let Some(dir) = non_empty_var("HLS_OUTPUT_DIR") {
            self.workspace.output_dir = Some(PathBuf::from(dir));
        }

        if let Ok(val) = env::var("HLS_KEEP_INTERMEDIATES") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.workspace.keep_intermediates = true,
                "false" | "0" | "no" => self.workspace.keep_intermediates = false,
                _ => {} // Invalid value, keep existing
            }
        }
    }

    /// Check values that parse fine but cannot drive a conversion
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hls.segment_seconds == 0 {
            return Err(ConfigError::Invalid(
                "hls.segment_seconds must be at least 1".to_string(),
            ));
        }
        if self.hls.video_codec.trim().is_empty() || self.hls.audio_codec.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "hls.video_codec and hls.audio_codec must not be empty".to_string(),
            ));
        }
        if let Some(bad) = self
            .base_urls
            .list_base_urls()
            .into_iter()
            .find(|url| !url.starts_with("http://") && !url.starts_with("https://"))
        {
            return Err(ConfigError::Invalid(format!(
                "base URL '{}' is not an http(s) URL",
                bad
            )));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the built-in defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}
