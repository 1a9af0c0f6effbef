//! Daemon configuration: defaults, then the TOML file, then the command line

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

pub const DEFAULT_PORT: u16 = 6390;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub bind: String,
    pub port: u16,
    pub log_level: String,
    /// PostgreSQL backing store; the relay is in-memory without one
    pub database_url: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            log_level: "info".into(),
            database_url: None,
        }
    }
}

/// Values given on the command line or through the environment
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub database_url: Option<String>,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn load(path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(base.merge(overrides))
    }

    pub fn merge(mut self, overrides: Overrides) -> Self {
        if let Some(bind) = overrides.bind {
            self.bind = bind;
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
        if overrides.database_url.is_some() {
            self.database_url = overrides.database_url;
        }
        self
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.bind, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::load(None, Overrides::default()).unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.listen_addr().unwrap().port(), DEFAULT_PORT);
    }

    #[test]
    fn test_file_then_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 7000\nlog_level = \"debug\"").unwrap();

        let config = DaemonConfig::load(
            Some(file.path()),
            Overrides {
                log_level: Some("warn".into()),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.bind, "0.0.0.0");
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "prot = 7000").unwrap();
        assert!(DaemonConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_bad_bind_address() {
        let config = DaemonConfig::default().merge(Overrides {
            bind: Some("not an address".into()),
            ..Default::default()
        });
        assert!(config.listen_addr().is_err());
    }
}
