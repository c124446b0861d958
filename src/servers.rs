//! The registry of configured cache servers.

use crate::backend::{Backend, Name};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("No servers configured")]
    NoServers,

    #[error("Invalid server address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: &'static str },

    #[error("Configured {weights} weights for {servers} servers")]
    WeightMismatch { servers: usize, weights: usize },

    #[error("Server {0} configured more than once")]
    Duplicate(Name),
}

/// The server list, as an application configures it.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ServerConfig {
    /// Servers, as `"host:port"` strings. Order matters: it is part of the
    /// ring's identity.
    pub servers: Vec<String>,

    /// Weights parallel to `servers`. When absent, every server has weight 1.
    pub weights: Option<Vec<u32>>,
}

impl ServerConfig {
    pub fn new<S: ToString>(servers: impl IntoIterator<Item = S>) -> Self {
        Self {
            servers: servers.into_iter().map(|s| s.to_string()).collect(),
            weights: None,
        }
    }

    pub fn with_weights(mut self, weights: impl IntoIterator<Item = u32>) -> Self {
        self.weights = Some(weights.into_iter().collect());
        self
    }
}

/// An immutable, ordered list of servers.
#[derive(Clone, Debug)]
pub struct ServerList {
    servers: Vec<Backend>,
}

impl ServerList {
    pub fn new(config: &ServerConfig) -> Result<Self, Error> {
        if config.servers.is_empty() {
            return Err(Error::NoServers);
        }
        if let Some(weights) = &config.weights {
            if weights.len() != config.servers.len() {
                return Err(Error::WeightMismatch {
                    servers: config.servers.len(),
                    weights: weights.len(),
                });
            }
        }

        let mut servers: Vec<Backend> = Vec::with_capacity(config.servers.len());
        for (i, address) in config.servers.iter().enumerate() {
            let (host, port) = parse_address(address)?;
            let weight = config
                .weights
                .as_ref()
                .map(|weights| weights[i])
                .unwrap_or(1);
            let backend = Backend::new(host, port, weight);
            if servers.iter().any(|s| s.name == backend.name) {
                return Err(Error::Duplicate(backend.name));
            }
            servers.push(backend);
        }
        Ok(Self { servers })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Backend> {
        self.servers.iter()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Backend> {
        self.servers.iter().find(|s| s.name.as_str() == name)
    }

    pub fn total_weight(&self) -> u64 {
        self.servers.iter().map(|s| u64::from(s.weight)).sum()
    }
}

impl<'a> IntoIterator for &'a ServerList {
    type Item = &'a Backend;
    type IntoIter = std::slice::Iter<'a, Backend>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// Splits "host:port" or "[v6-host]:port".
fn parse_address(address: &str) -> Result<(&str, u16), Error> {
    let invalid = |reason| Error::InvalidAddress {
        address: address.to_string(),
        reason,
    };
    let address = address.trim();
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    let host = match host.strip_prefix('[') {
        Some(v6) => v6
            .strip_suffix(']')
            .ok_or_else(|| invalid("unterminated '['"))?,
        None => host,
    };
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
    Ok((host, port))
}
