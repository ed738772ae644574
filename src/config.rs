use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::DEFAULT_HISTORY_LIMIT;
use crate::input::{Gesture, GestureError};
use crate::scanner::{Severity, DEFAULT_CARRY_LIMIT};

/// Default fan-out piece size (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Engine configuration, loaded from TOML. Every field has a default, so an
/// empty file (or no file) is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum bytes of history kept per session.
    pub history_limit: usize,
    /// Maximum size of one outbound output piece.
    pub chunk_size: usize,
    /// How long a terminated child gets before it is killed.
    pub termination_grace_ms: u64,
    /// Child liveness check interval of the read loop.
    pub poll_interval_ms: u64,
    /// Keep a session without channels alive for this long. `None` closes it
    /// as soon as the last channel detaches.
    pub keep_alive_secs: Option<u64>,
    /// How many closed session ids are remembered for resume checks.
    pub closed_retention: usize,
    /// Value of `TERM` in the child environment.
    pub term: String,
    /// Default working directory for new sessions.
    pub cwd: Option<PathBuf>,
    pub scanner: ScannerConfig,
    pub shell: ShellConfig,
    pub agent: AgentConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            termination_grace_ms: 5_000,
            poll_interval_ms: 50,
            keep_alive_secs: None,
            closed_retention: 1024,
            term: "xterm-256color".to_string(),
            cwd: None,
            scanner: ScannerConfig::default(),
            shell: ShellConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

/// Threat scanner and block policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Scan session output at all.
    pub enabled: bool,
    /// Consult the external advisory scanner, when one is installed.
    pub advisory: bool,
    /// Upper bound on one advisory request.
    pub advisory_timeout_ms: u64,
    /// Key that unlocks a blocked session, e.g. `ctrl+]`.
    pub unlock_gesture: String,
    /// Cap on the unfinished line carried between chunks.
    pub carry_limit: usize,
    /// Drop the built-in tables and use only `rules`.
    pub replace_defaults: bool,
    /// Extra rules, appended to their tier.
    pub rules: Vec<RuleConfig>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            advisory: false,
            advisory_timeout_ms: 2_000,
            unlock_gesture: "ctrl+]".to_string(),
            carry_limit: DEFAULT_CARRY_LIMIT,
            replace_defaults: false,
            rules: Vec::new(),
        }
    }
}

/// One scanner rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub tier: Severity,
    pub pattern: String,
    pub description: String,
}

/// Interactive shell backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell binary; `$SHELL` (then `/bin/sh`) when unset.
    pub program: Option<String>,
    /// Start a login shell (`-l`).
    pub login: bool,
    /// Run the shell as this user through `switch_user_command`.
    pub switch_user: Option<String>,
    /// Helper invocation; `{user}` is replaced with `switch_user`.
    pub switch_user_command: Vec<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: None,
            login: false,
            switch_user: None,
            switch_user_command: vec![
                "sudo".to_string(),
                "-u".to_string(),
                "{user}".to_string(),
                "-i".to_string(),
            ],
        }
    }
}

/// Agent launcher backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub program: Option<String>,
    pub args: Vec<String>,
    /// Extra environment for agent sessions.
    pub env: HashMap<String, String>,
}

impl EngineConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::ReadFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Load from `path` if given, else from the default location; fall back
    /// to defaults when no file exists.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        Ok(Self::load(&path)?.unwrap_or_default())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than 0".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be greater than 0".into()));
        }
        self.gesture()?;
        Ok(())
    }

    pub fn gesture(&self) -> Result<Gesture, ConfigError> {
        Gesture::parse(&self.scanner.unlock_gesture).map_err(ConfigError::Gesture)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive_secs.map(Duration::from_secs)
    }

    pub fn advisory_timeout(&self) -> Duration {
        Duration::from_millis(self.scanner.advisory_timeout_ms)
    }
}

/// `~/.config/shellguard/config.toml` (platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("shellguard").join("config.toml"))
}

/// Errors that can occur when loading config.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", .path.display())]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[source] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid unlock gesture: {0}")]
    Gesture(#[source] GestureError),

    #[error(transparent)]
    Scanner(#[from] crate::scanner::ScannerError),
}

/// Check file permissions on a config file and warn if world-writable.
///
/// The file defines which output blocks a session; anyone who can write it
/// can switch the scanner off.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_writable(mode) {
        tracing::warn!(
            "config file {} is world-writable (mode {:o}); restrict it to 644 or tighter",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-writable bit set.
#[cfg(unix)]
pub fn is_world_writable(mode: u32) -> bool {
    mode & 0o002 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.history_limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.termination_grace(), Duration::from_secs(5));
        assert!(config.keep_alive().is_none());
        assert!(config.scanner.enabled);
        assert!(!config.scanner.advisory);
        assert_eq!(config.scanner.unlock_gesture, "ctrl+]");
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            history_limit = 1000
            chunk_size = 4096
            termination_grace_ms = 250
            keep_alive_secs = 30
            term = "screen"

            [scanner]
            advisory = true
            unlock_gesture = "ctrl+g"

            [[scanner.rules]]
            tier = "critical"
            pattern = "nuke"
            description = "nuclear option"

            [shell]
            program = "/bin/bash"
            login = true

            [agent]
            program = "/usr/local/bin/agent"
            args = ["--interactive"]
            env = { AGENT_MODE = "pty" }
        "#;
        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.history_limit, 1000);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.termination_grace(), Duration::from_millis(250));
        assert_eq!(config.keep_alive(), Some(Duration::from_secs(30)));
        assert_eq!(config.term, "screen");
        assert!(config.scanner.advisory);
        assert_eq!(config.scanner.rules.len(), 1);
        assert_eq!(config.scanner.rules[0].tier, Severity::Critical);
        assert_eq!(config.shell.program.as_deref(), Some("/bin/bash"));
        assert!(config.shell.login);
        assert_eq!(config.agent.args, vec!["--interactive"]);
        assert_eq!(config.agent.env.get("AGENT_MODE").map(String::as_str), Some("pty"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_chunk_size_is_invalid() {
        let config = EngineConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_gesture_is_invalid() {
        let mut config = EngineConfig::default();
        config.scanner.unlock_gesture = "hyper+space".into();
        assert!(matches!(config.validate(), Err(ConfigError::Gesture(_))));
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = EngineConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn load_or_default_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "history_limit = 42\n").unwrap();
        let config = EngineConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.history_limit, 42);
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "history_limit = \"lots\"\n").unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed { .. }), "got: {err:?}");
    }

    #[test]
    fn serialize_roundtrip_keeps_rules() {
        let mut config = EngineConfig::default();
        config.scanner.rules.push(RuleConfig {
            tier: Severity::High,
            pattern: "x".into(),
            description: "y".into(),
        });
        let text = config.to_toml().unwrap();
        let reparsed: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(reparsed.scanner.rules, config.scanner.rules);
    }

    #[cfg(unix)]
    #[test]
    fn world_writable_detection() {
        assert!(is_world_writable(0o666));
        assert!(is_world_writable(0o777));
        assert!(!is_world_writable(0o644));
        assert!(!is_world_writable(0o600));
    }

    #[cfg(unix)]
    #[test]
    fn check_permissions_does_not_panic() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "# test").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666)).unwrap();
        check_config_permissions(&path);
        check_config_permissions(&dir.path().join("missing.toml"));
    }
}
