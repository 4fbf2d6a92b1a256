//! Configuration for takstream clients.
//!
//! A configuration file lists the TAK servers to stream from and how to log.
//! Files are YAML; [`StreamConfig::from_config_builder`] additionally layers
//! `TAKSTREAM__*` environment variables over the file.
//!
//! ```yaml
//! logging:
//!   level: debug
//!   format: json
//! servers:
//!   - name: primary
//!     url: ssl://tak.example.com:8089
//!     cert_path: /etc/takstream/client.pem
//!     key_path: /etc/takstream/client.key
//!     ca_path: /etc/takstream/ca.pem
//! ```

use crate::error::{CertificateError, ConfigError, Result};
use crate::types::{ServerUrl, TakAuth};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Servers to connect to
    #[serde(default)]
    pub servers: Vec<ServerEntry>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl StreamConfig {
    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path.display().to_string()).into());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let config = Self::from_yaml(&contents)?;
        debug!(path = %path.display(), servers = config.servers.len(), "Loaded configuration");
        Ok(config)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Loads configuration with the `config` crate so that environment
    /// variables (`TAKSTREAM__LOGGING__LEVEL=debug`) override the file.
    pub fn from_config_builder<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(
                config::Environment::with_prefix("TAKSTREAM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates every server entry and checks names are unique.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers.into());
        }

        let mut names = HashSet::new();
        for server in &self.servers {
            if !names.insert(server.name.as_str()) {
                return Err(ConfigError::DuplicateServerName {
                    name: server.name.clone(),
                }
                .into());
            }
            server.validate()?;
        }

        Ok(())
    }

    /// Looks up a server by name.
    pub fn get_server(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// One TAK server to stream from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Unique name, also used as the connection id
    pub name: String,

    /// Server URL, `ssl://host:port`
    pub url: String,

    /// Client certificate (PEM)
    pub cert_path: PathBuf,

    /// Client private key (PEM)
    pub key_path: PathBuf,

    /// CA bundle for the server certificate (PEM)
    #[serde(default)]
    pub ca_path: Option<PathBuf>,

    /// Passphrase for the private key
    #[serde(default)]
    pub passphrase: Option<String>,

    /// Verify the server certificate chain and hostname
    #[serde(default)]
    pub reject_unauthorized: bool,

    /// Heartbeat period in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Handshake timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Extra SHA-256 fingerprints of acceptable server certificates
    #[serde(default)]
    pub pins: Vec<String>,

    /// Free-form type tag carried by the connection
    #[serde(default)]
    pub connection_type: Option<String>,
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl ServerEntry {
    /// Validates the entry without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::missing_field("name").into());
        }

        let url = ServerUrl::parse(&self.url)?;
        if !url.is_ssl() {
            return Err(ConfigError::UnsupportedProtocol {
                scheme: url.scheme().to_string(),
            }
            .into());
        }

        if self.heartbeat_secs == 0 {
            return Err(ConfigError::invalid_value(
                "heartbeat_secs",
                "must be greater than zero",
            )
            .into());
        }

        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "connect_timeout_secs",
                "must be greater than zero",
            )
            .into());
        }

        Ok(())
    }

    /// Parsed server URL.
    pub fn server_url(&self) -> Result<ServerUrl> {
        ServerUrl::parse(&self.url)
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Handshake timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Reads the PEM files into a credential bundle.
    pub fn load_auth(&self) -> Result<TakAuth> {
        let mut auth = TakAuth::new(read_pem(&self.cert_path)?, read_pem(&self.key_path)?)
            .with_reject_unauthorized(self.reject_unauthorized);

        if let Some(ca_path) = &self.ca_path {
            auth = auth.with_ca(read_pem(ca_path)?);
        }
        if let Some(passphrase) = &self.passphrase {
            auth = auth.with_passphrase(passphrase.clone());
        }

        Ok(auth)
    }
}

fn read_pem(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(CertificateError::not_found(path.display().to_string()).into());
    }
    std::fs::read_to_string(path)
        .map_err(|e| CertificateError::load_failed(path.display().to_string(), e.to_string()).into())
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text
    #[default]
    Text,
    /// One JSON object per line
    Json,
}
