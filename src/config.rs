use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{check_store_name, CacheConfig};
use crate::source::DEFAULT_HISTORY_LINES;
use crate::stream::{StreamConfig, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_POLL_INTERVAL, MAX_STREAMS};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "AGENTDASH_CONFIG";

/// Top-level config, loaded from TOML. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentdashConfig {
    pub server: ServerSection,
    pub source: SourceSection,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address of the HTTP server.
    pub bind: SocketAddr,
    /// Delay between polls of a session's output, in milliseconds.
    pub poll_interval_ms: u64,
    /// Silence before a keep-alive comment is sent, in seconds.
    pub heartbeat_secs: u64,
    /// Cap on concurrently open streams.
    pub max_streams: usize,
    /// Origins allowed by CORS. Empty disables CORS.
    pub cors_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7681)),
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            heartbeat_secs: DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
            max_streams: MAX_STREAMS,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerSection {
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(10)),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            max_streams: self.max_streams,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSection {
    /// tmux binary to invoke.
    pub tmux: String,
    /// Scrollback lines captured per poll.
    pub history_lines: u32,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            tmux: "tmux".to_string(),
            history_lines: DEFAULT_HISTORY_LINES,
        }
    }
}

impl AgentdashConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate(path)?;
        Ok(Some(config))
    }

    /// Load from `path`, falling back to defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path)? {
            Some(config) => {
                tracing::info!(path = %path.display(), "loaded config");
                Ok(config)
            }
            None => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Save config to a TOML file path.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |detail: &str| ConfigError::Invalid(path.to_path_buf(), detail.to_string());
        if self.server.max_streams == 0 {
            return Err(invalid("server.max_streams must be at least 1"));
        }
        if self.cache.max_api_entries == 0 {
            return Err(invalid("cache.max_api_entries must be at least 1"));
        }
        for name in [&self.cache.static_cache_name, &self.cache.api_cache_name] {
            if check_store_name(name).is_err() {
                return Err(invalid(&format!("cache store name {name:?} is not usable as a file name")));
            }
        }
        if self.cache.static_cache_name == self.cache.api_cache_name {
            return Err(invalid("cache.static_cache_name and cache.api_cache_name must differ"));
        }
        if !self.cache.shell_assets.contains(&self.cache.offline_document) {
            return Err(invalid("cache.offline_document must be listed in cache.shell_assets"));
        }
        Ok(())
    }
}

/// Resolve the config file path: explicit flag, then `$AGENTDASH_CONFIG`,
/// then `<config dir>/agentdash/config.toml`.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentdash")
        .join("config.toml")
}

/// Directory holding the on-disk response cache.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentdash")
}

/// Errors that can occur when loading or saving config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    WriteFailed(PathBuf, std::io::Error),
    SerializeFailed(toml::ser::Error),
    Invalid(PathBuf, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::WriteFailed(path, e) => {
                write!(f, "Failed to write config {}: {}", path.display(), e)
            }
            Self::SerializeFailed(e) => write!(f, "Failed to serialize config: {}", e),
            Self::Invalid(path, detail) => {
                write!(f, "Invalid config {}: {}", path.display(), detail)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: AgentdashConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.poll_interval_ms, 1000);
        assert_eq!(config.server.heartbeat_secs, 15);
        assert_eq!(config.source.tmux, "tmux");
        assert_eq!(config.cache.max_api_entries, 50);
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
            [server]
            bind = "0.0.0.0:9000"
            poll_interval_ms = 250

            [cache]
            max_api_entries = 10
        "#;
        let config: AgentdashConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind.port(), 9000);
        assert_eq!(
            config.server.stream_config().poll_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.cache.max_api_entries, 10);
        assert_eq!(config.source.history_lines, DEFAULT_HISTORY_LINES);
    }

    #[test]
    fn stream_config_clamps_tiny_intervals() {
        let section = ServerSection {
            poll_interval_ms: 0,
            heartbeat_secs: 0,
            ..ServerSection::default()
        };
        let config = section.stream_config();
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        assert!(AgentdashConfig::load(&path).unwrap().is_none());
        let config = AgentdashConfig::load_or_default(&path).unwrap();
        assert_eq!(config.server.max_streams, MAX_STREAMS);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = AgentdashConfig::default();
        config.server.poll_interval_ms = 500;
        config.cache.api_prefixes.push("/api/extra".into());
        config.save(&path).unwrap();

        let loaded = AgentdashConfig::load(&path).unwrap().unwrap();
        assert_eq!(loaded.server.poll_interval_ms, 500);
        assert!(loaded.cache.api_prefixes.contains(&"/api/extra".to_string()));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache]\nmax_api_entries = 0\n").unwrap();
        let err = AgentdashConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(..)));
        assert!(err.to_string().contains("max_api_entries"));
    }

    #[test]
    fn offline_document_must_be_a_shell_asset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache]\nshell_assets = [\"/\"]\n").unwrap();
        let err = AgentdashConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("offline_document"));
    }

    #[test]
    fn cache_store_names_must_be_file_safe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        for name in ["../escape", "a/b", "", ".."] {
            std::fs::write(&path, format!("[cache]\napi_cache_name = {name:?}\n")).unwrap();
            let err = AgentdashConfig::load(&path).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(..)), "{name:?}");
            assert!(err.to_string().contains("cache store name"), "{name:?}");
        }
        std::fs::write(&path, "[cache]\nstatic_cache_name = \"shell v2\"\n").unwrap();
        assert!(AgentdashConfig::load(&path).is_err());

        std::fs::write(&path, "[cache]\napi_cache_name = \"api-v2\"\n").unwrap();
        assert!(AgentdashConfig::load(&path).unwrap().is_some());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\n").unwrap();
        assert!(matches!(
            AgentdashConfig::load(&path),
            Err(ConfigError::ParseFailed(..))
        ));
    }

    #[test]
    fn default_cache_dir_is_app_specific() {
        assert!(default_cache_dir().ends_with("agentdash"));
    }

    #[test]
    fn explicit_config_path_wins() {
        let path = resolve_config_path(Some(PathBuf::from("/tmp/x.toml")));
        assert_eq!(path, PathBuf::from("/tmp/x.toml"));
    }
}
