use std::{env, fs, io, path::Path, time::Duration};

use log::{debug, LevelFilter};
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_ENV_VAR: &str = "TASK_CONSOLE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown log level '{0}'")]
    LogLevel(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Shell used as `<shell> -c <command>`.
    pub shell: String,
    pub registry_timeout_ms: u64,
    /// Prefix log lines with the stream they came from.
    pub stream_prefixes: bool,
    pub log_level: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            registry_timeout_ms: 2_000,
            stream_prefixes: false,
            log_level: "warn".to_string(),
        }
    }
}

impl ConsoleConfig {
    /// Loads the file named by `TASK_CONSOLE_CONFIG`, or the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::from_path(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Config file {} not found, using defaults.", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: ConsoleConfig = toml::from_str(contents)?;
        config.level_filter()?;
        Ok(config)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_timeout_ms)
    }

    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        self.log_level
            .parse()
            .map_err(|_| ConfigError::LogLevel(self.log_level.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = ConsoleConfig::from_toml("shell = \"bash\"\nregistry_timeout_ms = 500\n").unwrap();
        assert_eq!(config.shell, "bash");
        assert_eq!(config.registry_timeout(), Duration::from_millis(500));
        assert!(!config.stream_prefixes);
        assert_eq!(config.level_filter().unwrap(), LevelFilter::Warn);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConsoleConfig::from_path(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ConsoleConfig::default());
    }

    #[test]
    fn reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "stream_prefixes = true\nlog_level = \"debug\"").unwrap();
        let config = ConsoleConfig::from_path(file.path()).unwrap();
        assert!(config.stream_prefixes);
        assert_eq!(config.level_filter().unwrap(), LevelFilter::Debug);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(matches!(
            ConsoleConfig::from_toml("registry_timeout_ms = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ConsoleConfig::from_toml("log_level = \"loud\""),
            Err(ConfigError::LogLevel(level)) if level == "loud"
        ));
    }
}
