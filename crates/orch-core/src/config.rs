//! Daemon configuration: a typed `Config` with a hand-rolled `key=value` file
//! format, overridable by environment variables (Section 4.11, Section 6).
//!
//! Precedence: environment variables > config file > defaults.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Image builder mode (Section 6 environment contract, Section 9 builder mode resolution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageBuilderMode {
    Artifact,
    Buildkit,
}

impl Default for ImageBuilderMode {
    fn default() -> Self {
        Self::Buildkit
    }
}

impl ImageBuilderMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" => None,
            "artifact" => Some(Self::Artifact),
            "buildkit" => Some(Self::Buildkit),
            _ => None,
        }
    }
}

/// Daemon configuration (Section 4.11, Section 6 "Config file and environment variables").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// Per-project op history index cap (Section 3, Section 8 "history index cap").
    pub history_cap: usize,
    /// Op Event Hub replay buffer size per op (Section 4.6, default 256).
    pub event_buffer: usize,
    /// Messaging fabric max-deliver ceiling before a message is poisoned (Section 4.3/4.4).
    pub max_deliver: u32,
    /// Requested image builder mode; empty/unset resolves per Section 9.
    pub image_builder_mode: Option<ImageBuilderMode>,
    pub local_api_base_url: String,
    /// Gates repoBootstrap installing post-commit/post-merge webhook hooks (Section 4.5, Section 6).
    pub enable_commit_watcher: bool,
    /// Per-op step execution timeout (Section 4.4 "Execute ... under a per-op timeout").
    pub step_timeout_sec: u32,
    /// Retained-event TTL after the last SSE subscriber disconnects (Section 4.6).
    pub event_ttl_sec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from("./data"),
            db_path: PathBuf::from("./data/orchestrator.db"),
            history_cap: 200,
            event_buffer: 256,
            max_deliver: 5,
            image_builder_mode: None,
            local_api_base_url: "http://127.0.0.1:8080".to_string(),
            enable_commit_watcher: false,
            step_timeout_sec: 300,
            event_ttl_sec: 600,
        }
    }
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Ok(true),
        "false" | "0" | "no" | "n" | "off" => Ok(false),
        other => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: other.to_string(),
        }),
    }
}

/// Permissive truthy parse for `PAAS_ENABLE_COMMIT_WATCHER` (Section 6).
pub fn parse_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "y" | "on"
    )
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_content(&content)
    }

    pub fn parse_content(content: &str) -> Result<Self> {
        let mut config = Self::default();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::InvalidLine(format!(
                    "line {}: {}",
                    lineno + 1,
                    line
                )));
            };
            let key = key.trim();
            let value = unquote(value);
            config.apply_value(key, &value)?;
        }
        Ok(config)
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "bind_addr" => self.bind_addr = value.to_string(),
            "data_dir" => self.data_dir = PathBuf::from(value),
            "db_path" => self.db_path = PathBuf::from(value),
            "history_cap" => {
                self.history_cap = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "event_buffer" => {
                self.event_buffer = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "max_deliver" => {
                self.max_deliver = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "image_builder_mode" => self.image_builder_mode = ImageBuilderMode::parse(value),
            "local_api_base_url" => self.local_api_base_url = value.to_string(),
            "enable_commit_watcher" => self.enable_commit_watcher = parse_bool(key, value)?,
            "step_timeout_sec" => {
                self.step_timeout_sec = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "event_ttl_sec" => {
                self.event_ttl_sec = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            other => {
                eprintln!("warning: unknown config key {other:?}, ignoring");
            }
        }
        Ok(())
    }

    /// Apply `PAAS_*`/`ORCHD_*` environment variable overrides (Section 6).
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ORCHD_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("ORCHD_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ORCHD_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ORCHD_HISTORY_CAP") {
            if let Ok(n) = v.parse() {
                self.history_cap = n;
            }
        }
        if let Ok(v) = std::env::var("ORCHD_EVENT_BUFFER") {
            if let Ok(n) = v.parse() {
                self.event_buffer = n;
            }
        }
        if let Ok(v) = std::env::var("ORCHD_MAX_DELIVER") {
            if let Ok(n) = v.parse() {
                self.max_deliver = n;
            }
        }
        if let Ok(v) = std::env::var("PAAS_IMAGE_BUILDER_MODE") {
            self.image_builder_mode = ImageBuilderMode::parse(&v);
        }
        if let Ok(v) = std::env::var("PAAS_LOCAL_API_BASE_URL") {
            self.local_api_base_url = v;
        }
        if let Ok(v) = std::env::var("PAAS_ENABLE_COMMIT_WATCHER") {
            self.enable_commit_watcher = parse_truthy(&v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.history_cap, 200);
        assert_eq!(config.event_buffer, 256);
        assert!(config.image_builder_mode.is_none());
    }

    #[test]
    fn parses_key_value_file() {
        let content = "\
# a comment
bind_addr = 0.0.0.0:9000
history_cap=50
enable_commit_watcher = yes
image_builder_mode = artifact
";
        let config = Config::parse_content(content).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.history_cap, 50);
        assert!(config.enable_commit_watcher);
        assert_eq!(config.image_builder_mode, Some(ImageBuilderMode::Artifact));
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let content = "totally_unknown_key = 1\nbind_addr = 1.2.3.4:80\n";
        let config = Config::parse_content(content).unwrap();
        assert_eq!(config.bind_addr, "1.2.3.4:80");
    }

    #[test]
    fn invalid_int_is_an_error() {
        let content = "history_cap = not-a-number\n";
        assert!(matches!(
            Config::parse_content(content),
            Err(ConfigError::InvalidInt { .. })
        ));
    }

    #[test]
    fn truthy_parse_is_permissive() {
        assert!(parse_truthy("1"));
        assert!(parse_truthy("Yes"));
        assert!(!parse_truthy("nope"));
        assert!(!parse_truthy(""));
    }
}
