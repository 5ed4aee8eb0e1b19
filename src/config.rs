use crate::api::models::Session;
use crate::error::ConfigError;
use crate::identity::DEFAULT_PRIVILEGED;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const FILE_NAME: &str = "adda-support.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// SQLite file; `path` defaults to the user data dir.
    Local {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
    Firestore {
        project_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
        /// Host or URL; emulators need an explicit `http://`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Local { path: None }
    }
}

fn default_collection() -> String {
    "support_chats".to_string()
}

fn default_admins() -> Vec<String> {
    let mut admins: Vec<String> = DEFAULT_PRIVILEGED.iter().cloned().collect();
    admins.sort();
    admins
}

fn default_poll_interval_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_admins")]
    pub admins: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            admins: default_admins(),
            poll_interval_ms: default_poll_interval_ms(),
            backend: BackendConfig::default(),
            session: None,
        }
    }
}

impl Config {
    pub fn path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join(FILE_NAME))
    }

    /// Missing or unreadable config falls back to defaults.
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            log::warn!("no config directory, using defaults");
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::from_path(&path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("ignoring {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::path().ok_or(ConfigError::NoConfigDir)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn privileged(&self) -> HashSet<String> {
        self.admins.iter().cloned().collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(250))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.collection, "support_chats");
        assert!(config.privileged().contains("thepremanshu@gmail.com"));
        assert_eq!(config.backend, BackendConfig::Local { path: None });
    }

    #[test]
    fn parses_firestore_backend_and_session() {
        let config = Config::from_toml(
            r#"
            admins = ["ops@adda.in"]
            poll_interval_ms = 10

            [backend]
            kind = "firestore"
            project_id = "apna-adda1"
            endpoint = "http://localhost:8080"

            [session]
            uid = "u1"
            email = "u1@adda.in"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.backend,
            BackendConfig::Firestore {
                project_id: "apna-adda1".into(),
                api_key: None,
                endpoint: Some("http://localhost:8080".into()),
            }
        );
        assert!(!config.privileged().contains("thepremanshu@gmail.com"));
        assert_eq!(config.session.as_ref().unwrap().uid, "u1");
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = Config::default();
        config.backend = BackendConfig::Local {
            path: Some(PathBuf::from("/tmp/support.sqlite")),
        };
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(Config::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let err = Config::from_toml("[backend]\nkind = \"mongo\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
