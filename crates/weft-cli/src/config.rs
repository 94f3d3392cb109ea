//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use weft_api::HttpBackendConfig;
use weft_engine::PollPolicy;

/// Configuration for weft
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend base URL
    pub base_url: Option<String>,
    /// Path of the query endpoint, relative to the base URL
    pub query_path: Option<String>,
    /// Path of the status endpoint; `{conversation_id}` is substituted
    pub status_path: Option<String>,
    /// Milliseconds between status polls
    pub poll_interval_ms: Option<u64>,
    /// Extra polls after a terminal status
    pub grace_polls: Option<u32>,
    /// Stop polling once a final answer is shown
    pub stop_on_final: Option<bool>,
    /// Upper bound on polls per conversation
    pub max_polls: Option<u32>,
    /// HTTP request timeout in seconds
    pub request_timeout_secs: Option<u64>,
    /// Write a JSONL transcript log for every run
    pub log_transcripts: Option<bool>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("weft")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("WEFT_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Self::default()
            }),
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let backend = HttpBackendConfig::default();
        let policy = PollPolicy::default();
        let default_config = Config {
            base_url: Some(backend.base_url),
            query_path: Some(backend.query_path),
            status_path: Some(backend.status_path),
            poll_interval_ms: Some(policy.interval.as_millis() as u64),
            grace_polls: Some(policy.grace_polls),
            stop_on_final: Some(policy.stop_on_final),
            max_polls: None,
            request_timeout_secs: Some(backend.timeout.as_secs()),
            log_transcripts: Some(false),
        };

        default_config.save()?;
        Ok(path)
    }

    /// Backend client settings, defaults filled in
    pub fn backend_config(&self) -> HttpBackendConfig {
        let defaults = HttpBackendConfig::default();
        HttpBackendConfig {
            base_url: self.base_url.clone().unwrap_or(defaults.base_url),
            query_path: self.query_path.clone().unwrap_or(defaults.query_path),
            status_path: self.status_path.clone().unwrap_or(defaults.status_path),
            timeout: self
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }

    /// Polling settings, defaults filled in
    pub fn poll_policy(&self) -> PollPolicy {
        let defaults = PollPolicy::default();
        PollPolicy {
            interval: self
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.interval),
            grace_polls: self.grace_polls.unwrap_or(defaults.grace_polls),
            stop_on_final: self.stop_on_final.unwrap_or(defaults.stop_on_final),
            max_polls: self.max_polls.or(defaults.max_polls),
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# weft configuration file
# Place at ~/.config/weft/config.toml (Linux/Mac) or %APPDATA%\weft\config.toml (Windows)
# or point WEFT_CONFIG_PATH at it.

# Backend base URL
base_url = "http://localhost:8000/api"

# Endpoint paths, relative to base_url
query_path = "/query"
status_path = "/status/{conversation_id}"

# Milliseconds between status polls
poll_interval_ms = 2000

# Extra polls after the conversation reports a terminal status
grace_polls = 2

# Stop polling as soon as a final answer is shown
stop_on_final = false

# Upper bound on polls per conversation (optional)
# max_polls = 300

# HTTP request timeout in seconds
request_timeout_secs = 30

# Write a JSONL transcript log for every run
log_transcripts = false
"#
}
