//! Encoding of batched fetches, and decoding of their responses.
//!
//! A codec only deals in bytes: the caller owns the connection, writes what
//! the codec encodes, and feeds everything read back to the codec until it
//! reports a complete response.

pub mod binary;
pub mod text;

pub use binary::BinaryCodec;
pub use text::TextCodec;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// A value read from a cache server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Value {
    /// Opaque flags stored alongside the value.
    pub flags: u32,
    pub data: Bytes,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Server replied with an error: {0}")]
    Server(String),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Translates batched fetches to and from one wire protocol.
pub trait Codec: Send + Sync {
    /// Appends one request fetching every key in `keys`.
    fn encode_get_multi(&self, keys: &[String], buf: &mut BytesMut);

    /// Decodes the response to [Self::encode_get_multi].
    ///
    /// Returns `Ok(None)` while the response is incomplete. Keys the server
    /// does not hold are simply absent from the result.
    fn decode_get_multi(&self, buf: &[u8]) -> Result<Option<Vec<(String, Value)>>, DecodeError>;

    /// Checks the tail of a partial response for the end-of-response marker.
    ///
    /// This must be cheap, as it runs after every read. It may return true
    /// before the response is actually complete, in which case
    /// [Self::decode_get_multi] returns `Ok(None)`, but never returns false
    /// for a complete response.
    fn response_complete(&self, buf: &[u8]) -> bool;

    /// Appends a harmless request used to check that a connection is alive.
    fn encode_probe(&self, buf: &mut BytesMut);

    /// Returns true once `buf` holds the complete response to
    /// [Self::encode_probe].
    fn probe_complete(&self, buf: &[u8]) -> Result<bool, DecodeError>;
}
