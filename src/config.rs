//! Daemon configuration.
//!
//! Loaded from an optional YAML file; every field has a default so an empty
//! file (or no file at all) is a valid configuration once `dbid` and
//! `addresses` are filled in, typically from the command line.
//!
//! ```yaml
//! dbid: 2
//! content_id: 0
//! addresses: "1:-1:10.0.0.1:2000,2:0:10.0.0.2:2001"
//! instance_port: 6000
//! ```
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    addr::{AddrError, AddressTable},
    packet::{DEFAULT_BLOCK_SIZE, HEADER_SIZE},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Addr(#[from] AddrError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Physical instance id of this node.
    pub dbid: u16,
    /// Logical shard id of this node; -1 is the coordinator.
    pub content_id: i16,
    /// `dbid:contentId:host:port` entries, comma separated.
    pub addresses: String,
    /// Names the backend socket `<socket_dir>/.s.proxy.<instance_port>`.
    pub instance_port: u16,
    pub socket_dir: PathBuf,
    pub block_size: usize,
    pub pool_capacity: Option<usize>,
    pub timer_delay_ms: u64,
    pub timer_period_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dbid: 0,
            content_id: -1,
            addresses: String::new(),
            instance_port: 0,
            socket_dir: PathBuf::from("/tmp"),
            block_size: DEFAULT_BLOCK_SIZE,
            pool_capacity: None,
            timer_delay_ms: 100,
            timer_period_ms: 1000,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size <= HEADER_SIZE || self.block_size > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "block_size must be in {}..={}, got {}",
                HEADER_SIZE + 1,
                u16::MAX,
                self.block_size
            )));
        }
        if self.pool_capacity == Some(0) {
            return Err(ConfigError::Invalid("pool_capacity must not be 0".into()));
        }
        if self.timer_period_ms == 0 {
            return Err(ConfigError::Invalid("timer_period_ms must not be 0".into()));
        }
        Ok(())
    }

    /// Parses `addresses` into a fresh table.
    pub fn address_table(&self) -> Result<AddressTable, ConfigError> {
        Ok(AddressTable::parse(&self.addresses)?)
    }

    /// Unix socket backends connect to.
    pub fn socket_path(&self) -> PathBuf {
        socket_path(&self.socket_dir, self.instance_port)
    }

    pub fn timer_delay(&self) -> Duration {
        Duration::from_millis(self.timer_delay_ms)
    }

    pub fn timer_period(&self) -> Duration {
        Duration::from_millis(self.timer_period_ms)
    }
}

pub fn socket_path(dir: &Path, instance_port: u16) -> PathBuf {
    dir.join(format!(".s.proxy.{instance_port}"))
}

/// Values given on the command line; they win over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub dbid: Option<u16>,
    pub content_id: Option<i16>,
    pub addresses: Option<String>,
    pub instance_port: Option<u16>,
    pub socket_dir: Option<PathBuf>,
}

impl Overrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(dbid) = self.dbid {
            config.dbid = dbid;
        }
        if let Some(content_id) = self.content_id {
            config.content_id = content_id;
        }
        if let Some(addresses) = &self.addresses {
            config.addresses = addresses.clone();
        }
        if let Some(port) = self.instance_port {
            config.instance_port = port;
        }
        if let Some(dir) = &self.socket_dir {
            config.socket_dir = dir.clone();
        }
    }
}

/// Where the configuration comes from, kept around to reload it.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    pub path: Option<PathBuf>,
    pub overrides: Overrides,
}

impl ConfigSource {
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.path {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        self.overrides.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}
