//! YAML-backed runtime configuration.
//!
//! All keys have defaults so a missing config file yields a usable setup;
//! a file that exists but fails to parse is a boot error.

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub global: Global,
    pub services: Services,
    pub credentials: Credentials,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Global {
    #[serde(rename = "logLevel")]
    pub log_level: String,
}

impl Default for Global {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Services {
    pub proxy: String,
    pub api: String,
    pub sync: Sync,
    pub storage: Storage,
    pub database: Database,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            proxy: "localhost:8080".to_string(),
            api: "localhost:8081".to_string(),
            sync: Sync::default(),
            storage: Storage::default(),
            database: Database::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Sync {
    /// Sync period in seconds.
    pub interval: u64,
}

impl Default for Sync {
    fn default() -> Self {
        Self { interval: 600 }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Storage {
    pub dir: PathBuf,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Database {
    pub file: String,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            file: "db.sqlite3".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// Optional token injected into intercepted github requests.
    pub github: Option<String>,
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("no config file at `{}`, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading `{}`", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing `{}`", path.display()))
    }

    /// Maps the configured (logrus-flavored) level names onto the `log`
    /// crate's filters. PANIC and FATAL have no direct analog and collapse
    /// into `Error`.
    pub fn log_level(&self) -> Result<LevelFilter> {
        match self.global.log_level.to_ascii_uppercase().as_str() {
            "PANIC" | "FATAL" | "ERROR" => Ok(LevelFilter::Error),
            "WARN" | "WARNING" => Ok(LevelFilter::Warn),
            "INFO" => Ok(LevelFilter::Info),
            "DEBUG" => Ok(LevelFilter::Debug),
            "TRACE" => Ok(LevelFilter::Trace),
            other => anyhow::bail!("unknown log level `{}`", other),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.services.sync.interval)
    }

    /// Root of the on-disk artifact tree.
    pub fn package_root(&self) -> PathBuf {
        self.services.storage.dir.join("packages")
    }

    pub fn database_path(&self) -> PathBuf {
        self.services.storage.dir.join(&self.services.database.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!("localhost:8080", settings.services.proxy);
        assert_eq!("localhost:8081", settings.services.api);
        assert_eq!(600, settings.services.sync.interval);
        assert_eq!("INFO", settings.global.log_level);
        assert_eq!(PathBuf::from("./data/packages"), settings.package_root());
        assert_eq!(PathBuf::from("./data/db.sqlite3"), settings.database_path());
        assert!(settings.credentials.github.is_none());
    }

    #[test]
    fn test_parse_overrides() {
        let raw = r#"
global:
  logLevel: DEBUG
services:
  proxy: 0.0.0.0:3128
  sync:
    interval: 60
  storage:
    dir: /var/lib/lagoon
credentials:
  github: hunter2
"#;
        let settings: Settings = serde_yaml::from_str(raw).unwrap();
        assert_eq!("0.0.0.0:3128", settings.services.proxy);
        // Unset keys keep their defaults.
        assert_eq!("localhost:8081", settings.services.api);
        assert_eq!(Duration::from_secs(60), settings.sync_interval());
        assert_eq!(
            PathBuf::from("/var/lib/lagoon/db.sqlite3"),
            settings.database_path()
        );
        assert_eq!(Some("hunter2".to_string()), settings.credentials.github);
        assert_eq!(LevelFilter::Debug, settings.log_level().unwrap());
    }

    #[test]
    fn test_log_level_mapping() {
        let mut settings = Settings::default();
        for (name, expected) in &[
            ("PANIC", LevelFilter::Error),
            ("FATAL", LevelFilter::Error),
            ("info", LevelFilter::Info),
            ("TRACE", LevelFilter::Trace),
        ] {
            settings.global.log_level = name.to_string();
            assert_eq!(*expected, settings.log_level().unwrap());
        }
        settings.global.log_level = "LOUD".to_string();
        assert!(settings.log_level().is_err());
    }
}
