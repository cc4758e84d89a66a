use sandboxd_shared::shell_session::ShellSessionConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file location, read when `--config` is not given
pub const SANDBOXD_CONFIG_PATH: &str = "~/.sandboxd/config.toml";

/// Daemon configuration, loaded from TOML and then overridden by CLI flags.
///
/// Every field has a default so an empty (or absent) file is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Per-daemon state directory. Session directories live under `sessions/`.
    #[serde(default = "default_config_dir")]
    pub config_dir: String,

    /// Fixed working directory for every new shell. When unset, the
    /// `legacy_working_dir` passed on create is used instead.
    #[serde(default)]
    pub work_dir: Option<String>,

    #[serde(default = "default_shell")]
    pub shell: String,

    /// Maximum concurrent sessions (0 = unlimited)
    #[serde(default)]
    pub max_sessions: usize,

    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_terminate_grace_period", with = "humantime_serde")]
    pub terminate_grace_period: Duration,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// When set, logs are also written to daily-rotated files in this directory
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            config_dir: default_config_dir(),
            work_dir: None,
            shell: default_shell(),
            max_sessions: 0,
            poll_interval: default_poll_interval(),
            terminate_grace_period: default_terminate_grace_period(),
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:4096".to_string()
}

fn default_config_dir() -> String {
    "~/.sandboxd".to_string()
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_terminate_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Errors that can occur during config loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid bind address '{0}': expected host:port")]
    InvalidBind(String),

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

impl DaemonConfig {
    /// Load from the default path, falling back to defaults when no file exists.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = expand_tilde(SANDBOXD_CONFIG_PATH);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Load configuration from a specific path.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from a string (useful for testing).
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.parse::<SocketAddr>().is_err() && !has_host_and_port(&self.bind) {
            return Err(ConfigError::InvalidBind(self.bind.clone()));
        }
        if self.shell.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "shell",
                message: "must not be empty".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn sessions_dir(&self) -> PathBuf {
        expand_tilde(&self.config_dir).join("sessions")
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log_dir.as_deref().map(expand_tilde)
    }

    pub fn session_config(&self) -> ShellSessionConfig {
        ShellSessionConfig {
            sessions_dir: self.sessions_dir(),
            shell: self.shell.clone(),
            work_dir: self.work_dir.as_deref().map(expand_tilde),
            max_sessions: self.max_sessions,
            poll_interval: self.poll_interval,
            terminate_grace_period: self.terminate_grace_period,
            ..ShellSessionConfig::default()
        }
    }
}

/// `localhost:4096` style addresses that only resolve at bind time
fn has_host_and_port(bind: &str) -> bool {
    match bind.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Expand ~ to home directory in paths.
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path_str = path.as_ref().to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    path.as_ref().to_path_buf()
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config_str = r#"
bind = "0.0.0.0:9000"
config_dir = "/var/lib/sandboxd"
work_dir = "/workspace"
shell = "/bin/bash"
max_sessions = 8
poll_interval = "20ms"
terminate_grace_period = "2s"
log_level = "debug"
log_dir = "/var/log/sandboxd"
"#;

        let config = DaemonConfig::parse(config_str).expect("Should parse valid config");

        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.shell, "/bin/bash");
        assert_eq!(config.max_sessions, 8);
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.terminate_grace_period, Duration::from_secs(2));
        assert_eq!(config.log_dir(), Some(PathBuf::from("/var/log/sandboxd")));

        let session_config = config.session_config();
        assert_eq!(
            session_config.sessions_dir,
            PathBuf::from("/var/lib/sandboxd/sessions")
        );
        assert_eq!(session_config.work_dir, Some(PathBuf::from("/workspace")));
        assert_eq!(session_config.max_sessions, 8);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DaemonConfig::parse("").expect("Should parse empty config");
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.bind, "127.0.0.1:4096");
        assert_eq!(config.shell, "/bin/sh");
        assert!(config.work_dir.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_sessions = 3\n").expect("write config");

        let config = DaemonConfig::load(&path).expect("Should load config file");
        assert_eq!(config.max_sessions, 3);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = DaemonConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = DaemonConfig::parse("shel = \"/bin/bash\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = DaemonConfig::parse("bind = \"not-an-address\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBind(_)));

        let err = DaemonConfig::parse("poll_interval = \"0s\"\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "poll_interval",
                ..
            }
        ));

        let err = DaemonConfig::parse("shell = \"  \"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "shell", .. }));
    }

    #[test]
    fn test_hostname_bind_accepted() {
        let config = DaemonConfig::parse("bind = \"localhost:4096\"\n").expect("hostname bind");
        assert_eq!(config.bind, "localhost:4096");
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/.sandboxd"), home.join(".sandboxd"));
            assert_eq!(expand_tilde("~"), home);
        }
        assert_eq!(expand_tilde("/tmp/x"), PathBuf::from("/tmp/x"));
    }
}
