use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use log::debug;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Result;
use crate::record::ProtocolVersion;

pub const DEFAULT_PORT: u16 = 2052;

/// Server settings. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Clients must present exactly this version.
    pub version: ProtocolVersion,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            version: ProtocolVersion::CURRENT,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] on malformed JSON.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// # Errors
    ///
    /// Fails if the file cannot be read or does not parse.
    pub fn load(path: &Path) -> Result<Self> {
        load(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ClientConfig {
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] on malformed JSON.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// # Errors
    ///
    /// Fails if the file cannot be read or does not parse.
    pub fn load(path: &Path) -> Result<Self> {
        load(path)
    }
}

fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    let config = serde_json::from_str(&text)?;
    debug!("Loaded configuration from {}", path.display());
    Ok(config)
}
