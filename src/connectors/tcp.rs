//! Implementation of [Connector] for TCP.

use crate::backend::{self, Backend, Connector, Error};
use crate::codec::{Codec, TextCodec};
use crate::connection::Connection;

use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::Duration;
use tracing::{event, Level};

/// Connects to backends over TCP, producing buffered [Connection]s.
#[derive(Clone)]
pub struct TcpConnector {
    /// How long establishing a connection may take.
    pub connect_timeout: Duration,

    /// How long any single read may take. `None` waits forever.
    pub read_timeout: Option<Duration>,

    /// Disables Nagle's algorithm on new sockets.
    pub nodelay: bool,

    /// Capacity of the read and write buffers of each connection.
    pub buffer_size: usize,

    /// Decides the liveness probe sent by [Connector::is_valid].
    pub codec: Arc<dyn Codec>,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            read_timeout: Some(Duration::from_secs(3)),
            nodelay: true,
            buffer_size: 32 * 1024,
            codec: Arc::new(TextCodec),
        }
    }
}

impl TcpConnector {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            codec,
            ..Default::default()
        }
    }
}

#[async_trait]
impl backend::Connector for TcpConnector {
    type Connection = Connection;

    async fn connect(&self, backend: &Backend) -> Result<Self::Connection, Error> {
        let stream =
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(backend.address()))
                .await
                .map_err(|_| Error::Timeout(backend.name.clone()))??;
        stream.set_nodelay(self.nodelay)?;
        event!(Level::TRACE, backend = %backend.name, "Connected");
        Ok(Connection::new(stream, self.buffer_size, self.read_timeout))
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Error> {
        let mut probe = BytesMut::new();
        self.codec.encode_probe(&mut probe);
        conn.write(&probe).await?;
        conn.flush().await?;

        let mut response = BytesMut::new();
        loop {
            if conn.read_buf(&mut response).await? == 0 {
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            match self.codec.probe_complete(&response) {
                Ok(true) => return Ok(()),
                Ok(false) => continue,
                Err(err) => return Err(Error::Other(err.into())),
            }
        }
    }
}
