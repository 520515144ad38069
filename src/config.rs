//! Startup configuration. Built once (TOML file, then CLI overrides) and
//! passed around by reference afterwards.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::remote::WriteMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    pub root: PathBuf,
    pub allow_anonymous: bool,
    pub password_file: Option<PathBuf>, // user:password per line
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 21,
            root: PathBuf::from("."),
            allow_anonymous: true,
            password_file: None,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub folder: String,
    pub token: Option<String>,
    pub mode: WriteMode,
    pub dry_run: bool, // upload into memory instead of Dropbox
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            folder: "scandocs".to_string(),
            token: None,
            mode: WriteMode::Add,
            dry_run: false,
        }
    }
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("folder", &self.folder)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("mode", &self.mode)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

/// Everything the serve daemon needs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub listener: ListenerConfig,
    pub remote: RemoteConfig,
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.listener.allow_anonymous && self.listener.password_file.is_none() {
            return Err(ConfigError::Invalid(
                "anonymous login is disabled and no password file was given".into(),
            ));
        }
        if !self.remote.dry_run && self.remote.token.as_deref().map_or(true, |t| t.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "a Dropbox access token is required (--token, DROPBOX_TOKEN or the config file); use --dry-run to run without one".into(),
            ));
        }
        Ok(())
    }
}

/// Connection settings for the probe client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub passive: bool,
    pub debug: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 21,
            username: "anonymous".to_string(),
            password: "anonymous@".to_string(),
            passive: false,
            debug: 1,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("passive", &self.passive)
            .field("debug", &self.debug)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = BridgeConfig::default();
        assert_eq!(c.listener.host, "0.0.0.0");
        assert_eq!(c.listener.port, 21);
        assert!(c.listener.allow_anonymous);
        assert_eq!(c.remote.folder, "scandocs");
        assert_eq!(c.remote.mode, WriteMode::Add);

        let p = ClientConfig::default();
        assert_eq!(p.host, "localhost");
        assert_eq!(p.username, "anonymous");
        assert_eq!(p.password, "anonymous@");
        assert!(!p.passive);
        assert_eq!(p.debug, 1);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = BridgeConfig::from_toml_str(
            r#"
            [listener]
            port = 2121

            [remote]
            mode = "overwrite"
            token = "abc"
            "#,
        )
        .unwrap();
        assert_eq!(c.listener.port, 2121);
        assert_eq!(c.listener.host, "0.0.0.0");
        assert_eq!(c.remote.mode, WriteMode::Overwrite);
        assert_eq!(c.remote.folder, "scandocs");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let mut c = BridgeConfig::default();
        assert!(c.validate().is_err(), "token required outside dry-run");
        c.remote.dry_run = true;
        assert!(c.validate().is_ok());
        c.listener.allow_anonymous = false;
        assert!(c.validate().is_err());
        c.listener.password_file = Some(PathBuf::from("users.txt"));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_bad_toml_and_missing_file() {
        assert!(matches!(
            BridgeConfig::from_toml_str("listener = 5"),
            Err(ConfigError::Parse { .. })
        ));
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            BridgeConfig::load(&tmp.path().join("none.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_secrets_not_in_debug() {
        let mut c = BridgeConfig::default();
        c.remote.token = Some("sl.very-secret".into());
        assert!(!format!("{:?}", c).contains("very-secret"));
        let mut p = ClientConfig::default();
        p.password = "hunter2".into();
        assert!(!format!("{:?}", p).contains("hunter2"));
    }
}
