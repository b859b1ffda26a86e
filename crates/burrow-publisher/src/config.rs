//! Publisher configuration file

use burrow_proto::ServiceInfo;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Credentials for the external token authority
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorityConfig {
    pub url: String,
    pub secret: String,
}

/// Publisher process configuration, loaded from a JSON file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherConfig {
    /// Broker host, also the target of data-socket dial-backs
    pub host: String,
    /// Broker control port
    pub port: u16,
    /// Stable identity across reconnects; generated when absent
    #[serde(default)]
    pub identity: Option<String>,
    pub services: Vec<ServiceInfo>,
    #[serde(default)]
    pub authority: Option<AuthorityConfig>,
}

impl PublisherConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
