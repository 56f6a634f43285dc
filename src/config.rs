//! Client configuration.
//!
//! Layering, lowest to highest precedence: built-in defaults, TOML file,
//! environment, command-line flags (applied by the binary).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ChatError;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const ENV_BASE_URL: &str = "CAREER_CHAT_API_BASE_URL";
pub const ENV_IDLE_TIMEOUT: &str = "CAREER_CHAT_IDLE_TIMEOUT_SECS";
pub const CONFIG_DIR_NAME: &str = ".career-chat";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const TOKEN_FILE_NAME: &str = "token";

/// Runtime settings for the API client and stream controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Backend base URL without a trailing slash.
    pub base_url: String,
    /// A stream with no bytes for this long fails with an idle timeout.
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Total timeout for non-streaming requests.
    pub request_timeout: Duration,
    pub token_file: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

/// On-disk shape of `config.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub base_url: Option<String>,
    pub idle_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub token_file: Option<PathBuf>,
}

impl ClientConfig {
    /// Defaults aimed at `base_url`.
    ///
    /// - idle_timeout: 60 s
    /// - connect_timeout: 10 s
    /// - request_timeout: 30 s
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            token_file: config_dir().join(TOKEN_FILE_NAME),
        }
    }

    /// Defaults, then `path` (or the default config file if it exists), then
    /// the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ChatError> {
        let mut config = Self::default();
        match path {
            Some(p) => config.apply_file(read_file_config(p)?)?,
            None => {
                let default_path = config_dir().join(CONFIG_FILE_NAME);
                if default_path.exists() {
                    config.apply_file(read_file_config(&default_path)?)?;
                }
            }
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_file(&mut self, file: FileConfig) -> Result<(), ChatError> {
        if let Some(url) = file.base_url {
            self.base_url = normalize_base_url(&url);
        }
        if let Some(secs) = file.idle_timeout_secs {
            self.set_idle_timeout_secs(secs)?;
        }
        if let Some(secs) = file.connect_timeout_secs {
            self.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.request_timeout_secs {
            self.request_timeout = Duration::from_secs(secs);
        }
        if let Some(path) = file.token_file {
            self.token_file = path;
        }
        Ok(())
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ChatError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|u| !u.trim().is_empty()) {
            self.base_url = normalize_base_url(&url);
        }
        if let Some(raw) = lookup(ENV_IDLE_TIMEOUT) {
            let secs = raw.trim().parse::<u64>().map_err(|_| {
                ChatError::Config(format!("{ENV_IDLE_TIMEOUT} must be a number of seconds, got '{raw}'"))
            })?;
            self.set_idle_timeout_secs(secs)?;
        }
        Ok(())
    }

    /// A zero timeout would fail every chunk that is not already buffered.
    pub fn set_idle_timeout_secs(&mut self, secs: u64) -> Result<(), ChatError> {
        if secs == 0 {
            return Err(ChatError::Config("idle timeout must be at least 1 second".to_string()));
        }
        self.idle_timeout = Duration::from_secs(secs);
        Ok(())
    }

    /// Highest-precedence override, e.g. from `--base-url`.
    pub fn set_base_url(&mut self, url: &str) {
        self.base_url = normalize_base_url(url);
    }

    /// Build a full URL for an API path such as `/chat/42`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// `$HOME/.career-chat`, or `./.career-chat` when no home directory is known.
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

fn read_file_config(path: &Path) -> Result<FileConfig, ChatError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ChatError::Config(format!("cannot read {}: {e}", path.display())))?;
    toml::from_str(&text).map_err(|e| ChatError::Config(format!("{}: {e}", path.display())))
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let c = ClientConfig::default();
        assert_eq!(c.base_url, "http://localhost:8000");
        assert_eq!(c.idle_timeout, Duration::from_secs(60));
        assert!(c.token_file.ends_with(".career-chat/token"));
    }

    #[test]
    fn test_trailing_slash_stripped() {
        let c = ClientConfig::new("http://api.example.com/ ");
        assert_eq!(c.url("/chat/"), "http://api.example.com/chat/");
    }

    #[test]
    fn test_file_layer_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "base_url = \"http://remote:9000\"\nidle_timeout_secs = 5\ntoken_file = \"/tmp/tok\"\n",
        )
        .unwrap();
        let mut c = ClientConfig::default();
        c.apply_file(read_file_config(&path).unwrap()).unwrap();
        assert_eq!(c.base_url, "http://remote:9000");
        assert_eq!(c.idle_timeout, Duration::from_secs(5));
        assert_eq!(c.token_file, PathBuf::from("/tmp/tok"));
        assert_eq!(c.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "base_uri = \"typo\"\n").unwrap();
        assert!(matches!(read_file_config(&path), Err(ChatError::Config(_))));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(matches!(
            ClientConfig::load(Some(Path::new("/nonexistent/career.toml"))),
            Err(ChatError::Config(_))
        ));
    }

    #[test]
    fn test_env_layer() {
        let env: HashMap<&str, &str> = [(ENV_BASE_URL, "http://env:1/"), (ENV_IDLE_TIMEOUT, "12")]
            .into_iter()
            .collect();
        let mut c = ClientConfig::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.base_url, "http://env:1");
        assert_eq!(c.idle_timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_env_bad_timeout() {
        let mut c = ClientConfig::default();
        let err = c
            .apply_env(|k| (k == ENV_IDLE_TIMEOUT).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }

    #[test]
    fn test_zero_idle_timeout_rejected_in_every_layer() {
        let mut c = ClientConfig::default();
        let err = c
            .apply_env(|k| (k == ENV_IDLE_TIMEOUT).then(|| "0".to_string()))
            .unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));

        let file = FileConfig {
            idle_timeout_secs: Some(0),
            ..FileConfig::default()
        };
        assert!(matches!(c.apply_file(file), Err(ChatError::Config(_))));

        assert!(matches!(c.set_idle_timeout_secs(0), Err(ChatError::Config(_))));
        assert_eq!(c.idle_timeout, Duration::from_secs(60));
    }
}
