//! Configuration loading and persistence.
//!
//! `config.json` lives under `BOTSTER_CONFIG_DIR` (or the platform config
//! dir); environment variables override it. The device token is never
//! serialized here - it lives in the OS keyring behind
//! [`Credentials`](crate::keyring::Credentials).

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::constants::{DEFAULT_MAX_SESSIONS, DEFAULT_POLL_INTERVAL};
use crate::keyring::Credentials;

/// Misconfiguration detected at startup.
///
/// `main` inspects error chains for this type to pick exit code 2, so
/// runtime failures whose messages merely resemble these can never be
/// misclassified.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No platform config directory could be determined.
    #[error("could not determine config directory")]
    NoConfigDir,
    /// The hub was started outside a git repository.
    #[error("not inside a git repository")]
    NotARepository,
}

/// Configuration for the botster hub.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// URL of the control server.
    pub server_url: String,
    /// Device token - NOT serialized to disk (stored in keyring).
    #[serde(skip)]
    pub token: String,
    /// Interval between server polls.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Maximum concurrent agent sessions.
    pub max_sessions: usize,
    /// Base directory for worktrees.
    pub worktree_base: PathBuf,
    /// Command run in each agent's main PTY.
    pub agent_command: String,
    /// Optional command run in the dev-server PTY.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_command: Option<String>,
    /// OSC 777 title substrings classified as "agent asked a question".
    #[serde(default = "default_question_patterns")]
    pub question_patterns: Vec<String>,
}

fn default_question_patterns() -> Vec<String> {
    vec!["question".to_string(), "waiting".to_string()]
}

/// Serde helper: durations persisted as integer seconds.
mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

impl Default for Config {
    fn default() -> Self {
        let worktree_base = dirs::home_dir()
            .map(|h| h.join("botster-sessions"))
            .unwrap_or_else(|| PathBuf::from("botster-sessions"));

        Self {
            server_url: crate::env::DEFAULT_SERVER_URL.to_string(),
            token: String::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_sessions: DEFAULT_MAX_SESSIONS,
            worktree_base,
            agent_command: "bash".to_string(),
            server_command: None,
            question_patterns: default_question_patterns(),
        }
    }
}

impl Config {
    /// The configuration directory, created on first use.
    ///
    /// Priority: `BOTSTER_CONFIG_DIR`, then a project-local `tmp/` in test
    /// mode, then the platform config dir.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(explicit) = std::env::var("BOTSTER_CONFIG_DIR") {
            PathBuf::from(explicit)
        } else if crate::env::is_any_test() {
            std::env::temp_dir().join("botster-test")
        } else {
            dirs::config_dir()
                .ok_or(ConfigError::NoConfigDir)?
                .join(crate::env::APP_NAME)
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Load configuration, applying env overrides, then the keyring token.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();

        if config.token.is_empty() {
            if let Ok(credentials) = Credentials::load() {
                if let Some(token) = credentials.api_token() {
                    config.token = token.to_string();
                }
            }
        }

        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(server_url) = std::env::var("BOTSTER_SERVER_URL") {
            self.server_url = server_url;
        }
        if let Ok(token) = std::env::var("BOTSTER_TOKEN") {
            self.token = token;
        }
        if let Ok(base) = std::env::var("BOTSTER_WORKTREE_BASE") {
            let expanded = shellexpand::tilde(&base).to_string();
            self.worktree_base = PathBuf::from(expanded);
        }
        if let Ok(interval) = std::env::var("BOTSTER_POLL_INTERVAL") {
            if let Ok(seconds) = interval.parse::<u64>() {
                self.poll_interval = Duration::from_secs(seconds);
            }
        }
        if let Ok(max) = std::env::var("BOTSTER_MAX_SESSIONS") {
            if let Ok(max) = max.parse::<usize>() {
                self.max_sessions = max;
            }
        }
        if let Ok(command) = std::env::var("BOTSTER_AGENT_COMMAND") {
            self.agent_command = command;
        }
    }

    /// Persist to disk (token excluded).
    pub fn save(&self) -> Result<()> {
        let path = Self::config_dir()?.join("config.json");
        fs::write(&path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Whether a plausible token is present.
    #[must_use]
    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }

    /// Store a fresh device token in the keyring.
    pub fn save_token(&mut self, token: &str) -> Result<()> {
        self.token = token.to_string();
        let mut credentials = Credentials::load().unwrap_or_default();
        credentials.set_api_token(token.to_string());
        credentials.save()
    }

    /// The stable hub identifier, created on first call and persisted
    /// under the config dir. `BOTSTER_HUB_ID` overrides.
    pub fn hub_identifier() -> Result<String> {
        if let Ok(explicit) = std::env::var("BOTSTER_HUB_ID") {
            return Ok(explicit);
        }

        let path = Self::config_dir()?.join("hub_identifier");
        if path.exists() {
            let id = fs::read_to_string(&path)?.trim().to_string();
            if !id.is_empty() {
                return Ok(id);
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        fs::write(&path, &id)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server_url, crate::env::DEFAULT_SERVER_URL);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_sessions, 20);
        assert_eq!(config.agent_command, "bash");
        assert_eq!(config.question_patterns, vec!["question", "waiting"]);
    }

    #[test]
    fn test_serialization_excludes_token() {
        let mut config = Config::default();
        config.token = "secret_token".to_string();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret_token"));
        assert!(!json.contains("\"token\""));
    }

    #[test]
    fn test_config_error_is_detectable_in_anyhow_chain() {
        let err = anyhow::Error::new(ConfigError::NotARepository).context("startup failed");
        assert!(err
            .chain()
            .any(|cause| cause.downcast_ref::<ConfigError>().is_some()));

        // A runtime error whose text mentions similar words is not one.
        let plain = anyhow::anyhow!("path /tmp/x escapes worktree base /tmp/base");
        assert!(!plain
            .chain()
            .any(|cause| cause.downcast_ref::<ConfigError>().is_some()));
    }

    #[test]
    fn test_poll_interval_roundtrips_as_seconds() {
        let mut config = Config::default();
        config.poll_interval = Duration::from_secs(9);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"poll_interval\":9"));

        let loaded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.poll_interval, Duration::from_secs(9));
    }
}
