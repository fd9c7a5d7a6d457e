//! Attach engine configuration.

use crate::{muted_error, weak_error};
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Name of the bootstrap script looked up next to the library.
pub const DEFAULT_SCRIPT: &str = "attach_server.py";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AttachConfig {
    /// Upper bound of the threading bootstrap.
    pub bootstrap_timeout_secs: u64,
    /// How long a thread may take to acknowledge suspension.
    pub suspend_ack_timeout_ms: u64,
    /// Lower the interpreter switch interval while bootstrapping.
    pub lower_switch_interval: bool,
    /// Bootstrap script, [`DEFAULT_SCRIPT`] next to the library if not set.
    pub script: Option<PathBuf>,
    /// `env_logger` filter, `PYSTALKER_LOG` takes precedence.
    pub log_level: Option<String>,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            bootstrap_timeout_secs: 20,
            suspend_ack_timeout_ms: 100,
            lower_switch_interval: true,
            script: None,
            log_level: None,
        }
    }
}

impl AttachConfig {
    const DEFAULT_PATH: &'static str = ".config/pystalker/attach.toml";
    const PATH_ENV: &'static str = "PYSTALKER_CONFIG";

    pub fn parse(data: &str) -> Result<Self, toml::de::Error> {
        toml::de::from_str(data)
    }

    /// Load from `$PYSTALKER_CONFIG` or the default path. Missing or malformed
    /// files give the default configuration.
    pub fn load() -> Self {
        Self::from_file(std::env::var_os(Self::PATH_ENV).map(PathBuf::from).as_deref())
            .unwrap_or_default()
    }

    /// Load from file. Return [`None`] on errors.
    pub fn from_file(path: Option<&Path>) -> Option<Self> {
        let data = match path {
            None => {
                let path = home::home_dir()?.join(Self::DEFAULT_PATH);
                muted_error!(read_to_string(path))?
            }
            Some(path) => weak_error!(read_to_string(path), "config file unreadable:")?,
        };
        weak_error!(Self::parse(&data), "malformed config:")
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    pub fn suspend_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.suspend_ack_timeout_ms)
    }

    /// Bootstrap script path. `library_dir` is the directory of the loaded engine.
    pub fn script_path(&self, library_dir: Option<&Path>) -> PathBuf {
        match (&self.script, library_dir) {
            (Some(script), _) if script.is_absolute() => script.clone(),
            (Some(script), Some(dir)) => dir.join(script),
            (Some(script), None) => script.clone(),
            (None, Some(dir)) => dir.join(DEFAULT_SCRIPT),
            (None, None) => PathBuf::from(DEFAULT_SCRIPT),
        }
    }
}

/// Read-only configuration (set only once, when the attach worker starts).
static CONFIG: OnceLock<AttachConfig> = OnceLock::new();

/// Return the configuration, loading it on first use.
pub fn current() -> &'static AttachConfig {
    CONFIG.get_or_init(AttachConfig::load)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_config() {
        struct TestCase {
            data: &'static str,
            expected: AttachConfig,
        }
        let test_cases = [
            TestCase {
                data: "",
                expected: AttachConfig::default(),
            },
            TestCase {
                data: "bootstrap_timeout_secs = 5\nlower_switch_interval = false",
                expected: AttachConfig {
                    bootstrap_timeout_secs: 5,
                    lower_switch_interval: false,
                    ..Default::default()
                },
            },
            TestCase {
                data: r#"
                    suspend_ack_timeout_ms = 250
                    script = "/opt/debug/attach_server.py"
                    log_level = "pystalker=debug"
                "#,
                expected: AttachConfig {
                    suspend_ack_timeout_ms: 250,
                    script: Some(PathBuf::from("/opt/debug/attach_server.py")),
                    log_level: Some("pystalker=debug".to_string()),
                    ..Default::default()
                },
            },
        ];

        for tc in test_cases {
            assert_eq!(AttachConfig::parse(tc.data).unwrap(), tc.expected);
        }
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(AttachConfig::parse("timeout = 1").is_err());
        assert!(AttachConfig::parse("bootstrap_timeout_secs = \"x\"").is_err());
    }

    #[test]
    fn test_script_path() {
        let lib_dir = Path::new("/usr/lib/pystalker");
        let config = AttachConfig::default();
        assert_eq!(
            config.script_path(Some(lib_dir)),
            PathBuf::from("/usr/lib/pystalker/attach_server.py")
        );

        let config = AttachConfig {
            script: Some(PathBuf::from("custom.py")),
            ..Default::default()
        };
        assert_eq!(
            config.script_path(Some(lib_dir)),
            PathBuf::from("/usr/lib/pystalker/custom.py")
        );

        let config = AttachConfig {
            script: Some(PathBuf::from("/tmp/s.py")),
            ..Default::default()
        };
        assert_eq!(config.script_path(Some(lib_dir)), PathBuf::from("/tmp/s.py"));
    }

    #[test]
    fn test_missing_file_gives_none() {
        assert!(AttachConfig::from_file(Some(Path::new("/nonexistent/attach.toml"))).is_none());
    }
}
