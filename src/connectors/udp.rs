//! Implementation of [Connector] for UDP.

use crate::backend::{self, Backend, Error};
use crate::reassembly::{FrameHeader, Reassembly, FRAME_HEADER_LEN};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::net::UdpSocket;
use tokio::time::Duration;
use tracing::{event, Level};

// Large enough for any datagram.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Creates [UdpConnection]s: sockets connected to one backend.
#[derive(Clone, Debug)]
pub struct UdpConnector {
    /// How long a whole request may take. `None` waits forever.
    pub read_timeout: Option<Duration>,

    /// Responses collected at once, per connection.
    pub max_pending: usize,

    /// How long a partially received response is kept.
    pub max_age: Duration,
}

impl Default for UdpConnector {
    fn default() -> Self {
        Self {
            read_timeout: Some(Duration::from_secs(3)),
            max_pending: 16,
            max_age: Duration::from_secs(10),
        }
    }
}

/// A UDP socket exchanging framed requests with one backend.
///
/// Payloads are text protocol requests; responses may span several
/// datagrams, and are reassembled before being returned.
#[derive(Debug)]
pub struct UdpConnection {
    socket: UdpSocket,
    next_request_id: u16,
    reassembly: Reassembly,
    read_timeout: Option<Duration>,
}

impl UdpConnection {
    /// Sends one request, and waits for its complete response.
    ///
    /// Datagrams belonging to other (abandoned) requests are collected but
    /// otherwise ignored.
    pub async fn request(&mut self, payload: &[u8]) -> io::Result<Bytes> {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);

        let mut datagram = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        FrameHeader {
            request_id,
            seq: 0,
            total: 1,
        }
        .encode(&mut datagram);
        datagram.extend_from_slice(payload);
        self.socket.send(&datagram).await?;

        let result = match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.receive(request_id))
                .await
                .unwrap_or_else(|_| {
                    Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
                }),
            None => self.receive(request_id).await,
        };
        if result.is_err() {
            self.reassembly.discard(request_id);
        }
        result
    }

    async fn receive(&mut self, request_id: u16) -> io::Result<Bytes> {
        let mut buf = vec![0; MAX_DATAGRAM];
        loop {
            let n = self.socket.recv(&mut buf).await?;
            match self.reassembly.accept(&buf[..n]) {
                Ok(Some((id, payload))) if id == request_id => return Ok(payload),
                Ok(Some((id, _))) => {
                    event!(Level::DEBUG, request_id = id, "Dropped stale response");
                }
                Ok(None) => {}
                Err(err) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, err));
                }
            }
        }
    }

    pub fn get_ref(&self) -> &UdpSocket {
        &self.socket
    }
}

#[async_trait]
impl backend::Connector for UdpConnector {
    type Connection = UdpConnection;

    async fn connect(&self, backend: &Backend) -> Result<Self::Connection, Error> {
        let address = tokio::net::lookup_host(backend.address())
            .await?
            .next()
            .ok_or_else(|| {
                Error::Other(anyhow::anyhow!("{} did not resolve", backend.name))
            })?;
        let local: std::net::SocketAddr = if address.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(address).await?;
        Ok(UdpConnection {
            socket,
            next_request_id: rand::random(),
            reassembly: Reassembly::new(self.max_pending, self.max_age),
            read_timeout: self.read_timeout,
        })
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Error> {
        let response = conn.request(b"version\r\n").await?;
        if response.starts_with(b"VERSION ") {
            Ok(())
        } else {
            Err(Error::Other(anyhow::anyhow!(
                "unexpected probe response: {}",
                String::from_utf8_lossy(&response)
            )))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::Connector;

    // Answers every request with its response split over two datagrams,
    // sent in reverse order.
    async fn split_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0; MAX_DATAGRAM];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let header = FrameHeader::parse(&buf[..n]).unwrap();
                let body: &[u8] = if &buf[8..n] == b"version\r\n" {
                    b"VERSION 1.6.21\r\n"
                } else {
                    b"VALUE k 0 2\r\nhi\r\nEND\r\n"
                };
                let (first, second) = body.split_at(body.len() / 2);
                for (seq, part) in [(1, second), (0, first)] {
                    let mut out = BytesMut::new();
                    FrameHeader {
                        request_id: header.request_id,
                        seq,
                        total: 2,
                    }
                    .encode(&mut out);
                    out.extend_from_slice(part);
                    socket.send_to(&out, peer).await.unwrap();
                }
            }
        });
        (address, handle)
    }

    #[tokio::test]
    async fn test_request_reassembles_response() {
        let (address, server) = split_server().await;
        let backend = Backend::new(address.ip().to_string(), address.port(), 1);
        let connector = UdpConnector::default();

        let mut conn = connector.connect(&backend).await.unwrap();
        let response = conn.request(b"get k\r\n").await.unwrap();
        assert_eq!(&response[..], b"VALUE k 0 2\r\nhi\r\nEND\r\n");

        connector.is_valid(&mut conn).await.expect("probe should pass");
        server.abort();
    }

    #[tokio::test]
    async fn test_request_times_out() {
        // Nothing ever answers on this socket.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = silent.local_addr().unwrap();
        let backend = Backend::new(address.ip().to_string(), address.port(), 1);
        let connector = UdpConnector {
            read_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };

        let mut conn = connector.connect(&backend).await.unwrap();
        let err = conn.request(b"get k\r\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
