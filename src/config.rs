use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

const DEFAULT_CAPTURE_CAP_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

impl Config {
    /// Loads the config from an optional TOML file, then applies `MIRRA_*`
    /// environment overrides. A missing path yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(port) = env::var("MIRRA_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("parse MIRRA_PORT `{port}`"))?;
        }
        if let Ok(enabled) = env::var("MIRRA_RECORDING_ENABLED") {
            self.recording.enabled = enabled
                .parse()
                .with_context(|| format!("parse MIRRA_RECORDING_ENABLED `{enabled}`"))?;
        }
        if let Ok(path) = env::var("MIRRA_RECORDING_PATH") {
            self.recording.path = PathBuf::from(path);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            recording: RecordingConfig::default(),
            logging: None,
            providers: ProvidersConfig::default(),
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_recording_path")]
    pub path: PathBuf,
    #[serde(default = "default_storage")]
    pub storage: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_capture_cap")]
    pub max_capture_bytes: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_recording_path(),
            storage: default_storage(),
            format: default_format(),
            max_capture_bytes: default_capture_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: Option<LogFormat>,
    #[serde(default)]
    pub level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_claude_provider")]
    pub claude: ProviderConfig,
    #[serde(default = "default_openai_provider")]
    pub openai: ProviderConfig,
    #[serde(default = "default_gemini_provider")]
    pub gemini: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            claude: default_claude_provider(),
            openai: default_openai_provider(),
            gemini: default_gemini_provider(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub upstream_url: String,
}

fn default_port() -> u16 {
    4567
}

fn default_true() -> bool {
    true
}

fn default_recording_path() -> PathBuf {
    PathBuf::from("./recordings")
}

fn default_storage() -> String {
    "file".to_owned()
}

fn default_format() -> String {
    "jsonl".to_owned()
}

fn default_capture_cap() -> usize {
    DEFAULT_CAPTURE_CAP_BYTES
}

fn default_claude_provider() -> ProviderConfig {
    ProviderConfig {
        upstream_url: "https://api.anthropic.com".to_owned(),
    }
}

fn default_openai_provider() -> ProviderConfig {
    ProviderConfig {
        upstream_url: "https://api.openai.com".to_owned(),
    }
}

fn default_gemini_provider() -> ProviderConfig {
    ProviderConfig {
        upstream_url: "https://generativelanguage.googleapis.com".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.port, 4567);
        assert!(config.recording.enabled);
        assert_eq!(config.recording.path.to_str(), Some("./recordings"));
        assert_eq!(config.recording.storage, "file");
        assert_eq!(config.recording.format, "jsonl");
        assert_eq!(
            config.providers.claude.upstream_url,
            "https://api.anthropic.com"
        );
        assert_eq!(
            config.providers.openai.upstream_url,
            "https://api.openai.com"
        );
        assert_eq!(
            config.providers.gemini.upstream_url,
            "https://generativelanguage.googleapis.com"
        );
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = Config::from_toml_str(
            r#"
port = 8080

[recording]
enabled = false
path = "/tmp/recordings"

[providers.claude]
upstream_url = "http://127.0.0.1:9999"
"#,
        )
        .expect("config should parse");

        assert_eq!(config.port, 8080);
        assert!(!config.recording.enabled);
        assert_eq!(config.recording.path.to_str(), Some("/tmp/recordings"));
        assert_eq!(
            config.providers.claude.upstream_url,
            "http://127.0.0.1:9999"
        );
        assert_eq!(
            config.providers.openai.upstream_url,
            "https://api.openai.com"
        );
    }

    #[test]
    fn invalid_toml_is_rejected() {
        let err = Config::from_toml_str("port = \"not-a-number\"").unwrap_err();
        assert!(err.to_string().contains("parse config TOML"));
    }
}
