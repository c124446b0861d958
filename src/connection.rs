//! A buffered TCP connection to a single cache server.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream, ReadBuf,
};
use tokio::net::TcpStream;
use tokio::time::Duration;

/// One TCP stream, with read and write buffers, bound to one backend.
///
/// Every read is bounded by the connection's read timeout, and fails with
/// [io::ErrorKind::TimedOut] once it elapses. A connection which returned
/// any error should be released as not reusable.
#[derive(Debug)]
pub struct Connection {
    stream: BufStream<TcpStream>,
    read_timeout: Option<Duration>,
}

impl Connection {
    pub fn new(stream: TcpStream, buffer_size: usize, read_timeout: Option<Duration>) -> Self {
        Self {
            stream: BufStream::with_capacity(buffer_size, buffer_size, stream),
            read_timeout,
        }
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Buffers bytes to be sent. Nothing is sent until [Self::flush].
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }

    pub async fn read_byte(&mut self) -> io::Result<u8> {
        let limit = self.read_timeout;
        with_limit(limit, self.stream.read_u8()).await
    }

    /// Reads one line, without its trailing `"\r\n"`.
    ///
    /// The end of the stream before a line terminator is an error.
    pub async fn read_line(&mut self) -> io::Result<String> {
        let limit = self.read_timeout;
        let mut line = vec![];
        let n = with_limit(limit, self.stream.read_until(b'\n', &mut line)).await?;
        if n == 0 || !line.ends_with(b"\n") {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-line",
            ));
        }
        line.pop();
        if line.ends_with(b"\r") {
            line.pop();
        }
        String::from_utf8(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Reads exactly `n` bytes.
    pub async fn read_exact_vec(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let limit = self.read_timeout;
        let mut buf = vec![0; n];
        with_limit(limit, self.stream.read_exact(&mut buf)).await?;
        Ok(buf)
    }

    /// Reads whatever is available into `buf`, returning the number of bytes
    /// read (zero at the end of the stream).
    pub async fn read_buf(&mut self, buf: &mut bytes::BytesMut) -> io::Result<usize> {
        let limit = self.read_timeout;
        with_limit(limit, self.stream.read_buf(buf)).await
    }

    /// Raw access to the underlying socket.
    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut TcpStream {
        self.stream.get_mut()
    }
}

async fn with_limit<T>(
    limit: Option<Duration>,
    op: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, op)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?,
        None => op.await,
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
