//! Harness configuration
//!
//! A JSON file (every field optional) overlaid with `BLUET_*` environment
//! variables. The command line applies its own flags on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sim::DEFAULT_PEER_NAME;
use crate::transport::HciEndpoint;

pub const ENV_DUT_PROGRAM: &str = "BLUET_DUT_PROGRAM";
pub const ENV_HCI_PORT: &str = "BLUET_HCI_PORT";
pub const ENV_PAIRING_TIMEOUT_MS: &str = "BLUET_PAIRING_TIMEOUT_MS";
pub const ENV_MARKER_TIMEOUT_MS: &str = "BLUET_MARKER_TIMEOUT_MS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("No DUT program configured")]
    MissingProgram,
}

fn default_hci_host() -> String {
    "127.0.0.1".to_string()
}

fn default_controller_name() -> String {
    "DUT".to_string()
}

fn default_peer_name() -> String {
    DEFAULT_PEER_NAME.to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_queue_capacity() -> usize {
    8
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// DUT executable. Started as `<program> --bt-dev=<host>:<port> <args...>`.
    #[serde(default)]
    pub dut_program: Option<PathBuf>,
    #[serde(default)]
    pub dut_args: Vec<String>,
    #[serde(default = "default_hci_host")]
    pub hci_host: String,
    /// 0 picks an ephemeral port.
    #[serde(default)]
    pub hci_port: u16,
    #[serde(default = "default_controller_name")]
    pub controller_name: String,
    #[serde(default = "default_peer_name")]
    pub peer_name: String,
    #[serde(default = "default_timeout_ms")]
    pub pairing_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub marker_timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub relay_queue_capacity: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            dut_program: None,
            dut_args: Vec::new(),
            hci_host: default_hci_host(),
            hci_port: 0,
            controller_name: default_controller_name(),
            peer_name: default_peer_name(),
            pairing_timeout_ms: default_timeout_ms(),
            marker_timeout_ms: default_timeout_ms(),
            relay_queue_capacity: default_queue_capacity(),
        }
    }
}

impl HarnessConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loaded harness config from {}", path.display());
        Ok(config)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values found through `lookup`. Blank values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(program) = get(ENV_DUT_PROGRAM) {
            self.dut_program = Some(PathBuf::from(program));
        }
        if let Some(port) = get(ENV_HCI_PORT) {
            self.hci_port = parse_env(ENV_HCI_PORT, &port)?;
        }
        if let Some(ms) = get(ENV_PAIRING_TIMEOUT_MS) {
            self.pairing_timeout_ms = parse_env(ENV_PAIRING_TIMEOUT_MS, &ms)?;
        }
        if let Some(ms) = get(ENV_MARKER_TIMEOUT_MS) {
            self.marker_timeout_ms = parse_env(ENV_MARKER_TIMEOUT_MS, &ms)?;
        }
        Ok(())
    }

    pub fn program(&self) -> Result<&Path, ConfigError> {
        self.dut_program.as_deref().ok_or(ConfigError::MissingProgram)
    }

    pub fn endpoint(&self) -> HciEndpoint {
        HciEndpoint::new(self.hci_host.clone(), self.hci_port)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout_ms)
    }

    pub fn marker_timeout(&self) -> Duration {
        Duration::from_millis(self.marker_timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}
