//! Command-line options for the serve daemon and the probe harness

use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::{BridgeConfig, ClientConfig, ConfigError};
use crate::remote::WriteMode;

/// FTP ingestion endpoint that forwards received files to Dropbox
#[derive(Clone, Debug, Parser)]
#[command(name = "dropbridge", version)]
pub struct ServeOpts {
    /// TOML config file; command-line flags override its values
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Address to bind the FTP listener to
    #[arg(long)]
    pub host: Option<String>,

    /// FTP control port
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Directory uploads are written into
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Refuse anonymous logins
    #[arg(long)]
    pub no_anonymous: bool,

    /// Credential file with one user:password per line
    #[arg(long)]
    pub password_file: Option<PathBuf>,

    /// Remote folder uploads are placed under
    #[arg(long)]
    pub folder: Option<String>,

    /// Dropbox access token
    #[arg(long, env = "DROPBOX_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Replace existing remote files instead of failing
    #[arg(long)]
    pub overwrite: bool,

    /// Keep uploads in memory instead of sending them to Dropbox
    #[arg(long)]
    pub dry_run: bool,

    /// More logging (info by default; -d debug, -dd trace)
    #[arg(long, short = 'd', action = ArgAction::Count)]
    pub debug: u8,

    /// Append log lines to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Once listening, run the probe sequence against this listener
    #[arg(long)]
    pub self_check: bool,
}

impl ServeOpts {
    /// Merge the config file (if any) with command-line overrides.
    pub fn into_config(self) -> Result<BridgeConfig, ConfigError> {
        let mut cfg = match &self.config {
            Some(path) => BridgeConfig::load(path)?,
            None => BridgeConfig::default(),
        };
        if let Some(host) = self.host {
            cfg.listener.host = host;
        }
        if let Some(port) = self.port {
            cfg.listener.port = port;
        }
        if let Some(root) = self.root {
            cfg.listener.root = root;
        }
        if self.no_anonymous {
            cfg.listener.allow_anonymous = false;
        }
        if self.password_file.is_some() {
            cfg.listener.password_file = self.password_file;
        }
        if let Some(folder) = self.folder {
            cfg.remote.folder = folder;
        }
        if self.token.is_some() {
            cfg.remote.token = self.token;
        }
        if self.overwrite {
            cfg.remote.mode = WriteMode::Overwrite;
        }
        if self.dry_run {
            cfg.remote.dry_run = true;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Connect to an FTP listener and run PWD, LIST, CDUP, NLST and QUIT
#[derive(Clone, Debug, Parser)]
#[command(name = "dropbridge-probe", version)]
pub struct ProbeOpts {
    /// Server host name
    #[arg(long = "host", short = 'H', default_value = "localhost")]
    pub host: String,

    /// Server port
    #[arg(long, short = 'p', default_value_t = 21)]
    pub port: u16,

    /// Login name
    #[arg(long, short = 'u', default_value = "anonymous")]
    pub username: String,

    /// Login password
    #[arg(long, default_value = "anonymous@")]
    pub password: String,

    /// Use passive (PASV) data connections instead of active (PORT)
    #[arg(long)]
    pub passive: bool,

    /// Log verbosity level (0 warn, 1 info, 2 debug, 3 trace)
    #[arg(long, short = 'd', default_value_t = 1)]
    pub debug: u8,
}

impl ProbeOpts {
    pub fn into_config(self) -> ClientConfig {
        ClientConfig {
            host: self.host,
            port: self.port,
            username: self.username,
            password: self.password,
            passive: self.passive,
            debug: self.debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_defaults() {
        let c = ProbeOpts::parse_from(["dropbridge-probe"]).into_config();
        assert_eq!(c, ClientConfig::default());
    }

    #[test]
    fn test_probe_flags() {
        let c = ProbeOpts::parse_from([
            "dropbridge-probe", "-H", "scanner.lan", "-p", "2121", "-u", "bob", "--password", "pw", "--passive", "-d", "3",
        ])
        .into_config();
        assert_eq!(c.host, "scanner.lan");
        assert_eq!(c.port, 2121);
        assert_eq!(c.username, "bob");
        assert!(c.passive);
        assert_eq!(c.debug, 3);
    }

    #[test]
    fn test_serve_overrides_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bridge.toml");
        std::fs::write(
            &path,
            "[listener]\nport = 2121\nhost = \"127.0.0.1\"\n[remote]\nfolder = \"from-file\"\ndry_run = true\n",
        )
        .unwrap();
        let opts = ServeOpts::parse_from([
            "dropbridge",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "2200",
            "--overwrite",
        ]);
        let cfg = opts.into_config().unwrap();
        assert_eq!(cfg.listener.port, 2200);
        assert_eq!(cfg.listener.host, "127.0.0.1");
        assert_eq!(cfg.remote.folder, "from-file");
        assert_eq!(cfg.remote.mode, WriteMode::Overwrite);
        assert!(cfg.remote.dry_run);
    }

    #[test]
    fn test_serve_debug_counts() {
        let opts = ServeOpts::parse_from(["dropbridge", "-dd", "--dry-run"]);
        assert_eq!(opts.debug, 2);
    }
}
