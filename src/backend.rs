//! The interface for identifying and connecting to cache servers.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    #[error("Timed out connecting to {0}")]
    Timeout(Name),

    #[error(transparent)]
    Other(anyhow::Error),
}

/// Describes the name of a backend, as it was configured ("host:port").
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct Name(pub Arc<str>);

impl Name {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Name {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl From<String> for Name {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl From<&str> for Name {
    fn from(name: &str) -> Self {
        Self(Arc::from(name))
    }
}

impl std::borrow::Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A single cache server.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct Backend {
    pub name: Name,
    pub host: Arc<str>,
    pub port: u16,
    pub weight: u32,
}

impl Backend {
    pub fn new(host: impl Into<Arc<str>>, port: u16, weight: u32) -> Self {
        let host = host.into();
        let name = if host.contains(':') {
            Name::new(format!("[{host}]:{port}"))
        } else {
            Name::new(format!("{host}:{port}"))
        };
        Self {
            name,
            host,
            port,
            weight,
        }
    }

    /// Returns the address in a form accepted by `tokio::net::lookup_host`.
    pub fn address(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

/// Anything a [Connector] produces, and a pool can hold.
pub trait Connection: Send + 'static {}

impl<T> Connection for T where T: Send + 'static {}

/// Opens connections to cache servers, and checks that they still work.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    /// Opens a new connection to `backend`.
    async fn connect(&self, backend: &Backend) -> Result<Self::Connection, Error>;

    /// Checks that an idle connection still works.
    ///
    /// This is the liveness probe: implementations send a harmless command
    /// and read until the protocol's end marker. It is invoked on idle
    /// connections as they are borrowed, when
    /// [crate::policy::PoolConfig::test_on_borrow] is set, and can run for
    /// [crate::policy::PoolConfig::health_check_timeout] before timing out.
    ///
    /// The default accepts every connection.
    async fn is_valid(&self, _conn: &mut Self::Connection) -> Result<(), Error> {
        Ok(())
    }
}

pub type SharedConnector<Conn> = Arc<dyn Connector<Connection = Conn>>;
