//! Configuration for the SFTP server

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// SFTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address (all interfaces by default)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// SSH host key path
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,

    /// Idle timeout in seconds before the transport is dropped
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// What `remove`, `rename`, `mkdir`, `rmdir`, `setstat` and `symlink` do
    #[serde(default)]
    pub mutations: MutationPolicy,

    /// Customers allowed to log in, keyed by username
    #[serde(default)]
    pub customers: BTreeMap<String, CustomerConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One `[customers.<username>]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerConfig {
    /// Home directory; becomes the customer's `/`
    pub home: PathBuf,
    /// File whose first line holds the customer's public key
    pub authorized_key_file: PathBuf,
}

/// Policy for the mutating SFTP requests
///
/// NIST 800-53: CM-5 (Access Restrictions for Change)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationPolicy {
    /// Report success to the peer without touching the filesystem.
    /// Uploads through `open`/`write` still land on disk.
    #[default]
    Inert,
    /// Perform the requested change inside the customer's sandbox
    Apply,
}

/// Logging configuration
///
/// NIST 800-53: AU-2 (Audit Events), AU-12 (Audit Generation)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            host_key_path: default_host_key_path(),
            timeout_secs: default_timeout(),
            mutations: MutationPolicy::default(),
            customers: BTreeMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if the file cannot be
    /// read or is not valid TOML for this schema.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) on a parse failure.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Validate configuration
    ///
    /// Every customer needs a non-empty username and an absolute home that
    /// exists and is a directory. The key file is not checked here: a broken
    /// key file only fails that customer's logins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) naming the first
    /// problem found.
    pub fn validate(&self) -> crate::Result<()> {
        if self.port == 0 {
            return Err(crate::Error::Config("port must not be 0".to_string()));
        }

        if self.timeout_secs == 0 {
            return Err(crate::Error::Config(
                "timeout_secs must be at least 1".to_string(),
            ));
        }

        for (username, customer) in &self.customers {
            if username.trim().is_empty() {
                return Err(crate::Error::Config("Empty customer username".to_string()));
            }

            if !customer.home.is_absolute() {
                return Err(crate::Error::Config(format!(
                    "Home directory for '{username}' must be absolute: {:?}",
                    customer.home
                )));
            }

            if !customer.home.is_dir() {
                return Err(crate::Error::Config(format!(
                    "Home directory for '{username}' is not a directory: {:?}",
                    customer.home
                )));
            }
        }

        Ok(())
    }

    /// Socket address string the acceptor binds
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    2200
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("/etc/ssh/ssh_host_rsa_key")
}

const fn default_timeout() -> u64 {
    300 // 5 minutes
}
