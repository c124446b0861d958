//! Reassembly of responses which arrive as several UDP datagrams.
//!
//! Each datagram starts with an 8-byte frame header:
//!
//! ```text
//! | request id | sequence number | total datagrams | reserved |
//! |   u16 BE   |      u16 BE     |      u16 BE     |  u16 BE  |
//! ```
//!
//! A response is complete once every sequence number in `0..total` has
//! arrived, in any order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{event, Level};

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Datagram of {0} bytes is shorter than its frame header")]
    Truncated(usize),

    #[error("Sequence number {seq} is out of range for {total} datagrams")]
    BadSequence { seq: u16, total: u16 },

    #[error("Request {id} changed its datagram count from {expected} to {actual}")]
    TotalMismatch { id: u16, expected: u16, actual: u16 },
}

/// The frame header at the start of every datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub request_id: u16,
    pub seq: u16,
    pub total: u16,
}

impl FrameHeader {
    pub fn parse(datagram: &[u8]) -> Result<Self, Error> {
        if datagram.len() < FRAME_HEADER_LEN {
            return Err(Error::Truncated(datagram.len()));
        }
        let mut buf = &datagram[..FRAME_HEADER_LEN];
        Ok(Self {
            request_id: buf.get_u16(),
            seq: buf.get_u16(),
            total: buf.get_u16(),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.request_id);
        buf.put_u16(self.seq);
        buf.put_u16(self.total);
        buf.put_u16(0);
    }
}

#[derive(Debug)]
struct Partial {
    total: u16,
    started: Instant,
    chunks: BTreeMap<u16, Bytes>,
}

/// Collects datagrams until a response is complete.
///
/// At most `max_pending` responses are collected at once; beginning another
/// evicts the oldest. Responses still incomplete after `max_age` are
/// discarded.
#[derive(Debug)]
pub struct Reassembly {
    pending: HashMap<u16, Partial>,
    max_pending: usize,
    max_age: Duration,
}

impl Reassembly {
    pub fn new(max_pending: usize, max_age: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            max_pending: max_pending.max(1),
            max_age,
        }
    }

    /// Accepts one datagram.
    ///
    /// Returns the request id and reassembled payload once the final
    /// datagram of a response arrives. Duplicate datagrams are ignored.
    pub fn accept(&mut self, datagram: &[u8]) -> Result<Option<(u16, Bytes)>, Error> {
        let header = FrameHeader::parse(datagram)?;
        if header.total == 0 || header.seq >= header.total {
            return Err(Error::BadSequence {
                seq: header.seq,
                total: header.total,
            });
        }
        let body = Bytes::copy_from_slice(&datagram[FRAME_HEADER_LEN..]);
        if header.total == 1 {
            self.pending.remove(&header.request_id);
            return Ok(Some((header.request_id, body)));
        }

        self.expire();
        if !self.pending.contains_key(&header.request_id) && self.pending.len() >= self.max_pending
        {
            self.evict_oldest();
        }
        let partial = self
            .pending
            .entry(header.request_id)
            .or_insert_with(|| Partial {
                total: header.total,
                started: Instant::now(),
                chunks: BTreeMap::new(),
            });
        if partial.total != header.total {
            return Err(Error::TotalMismatch {
                id: header.request_id,
                expected: partial.total,
                actual: header.total,
            });
        }
        partial.chunks.entry(header.seq).or_insert(body);
        if partial.chunks.len() < usize::from(partial.total) {
            return Ok(None);
        }

        let Some(partial) = self.pending.remove(&header.request_id) else {
            return Ok(None);
        };
        let mut payload = BytesMut::new();
        for chunk in partial.chunks.into_values() {
            payload.extend_from_slice(&chunk);
        }
        Ok(Some((header.request_id, payload.freeze())))
    }

    /// Forgets any datagrams collected for a request.
    pub fn discard(&mut self, request_id: u16) {
        self.pending.remove(&request_id);
    }

    /// Number of responses currently being collected.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn expire(&mut self) {
        let max_age = self.max_age;
        let before = self.pending.len();
        self.pending
            .retain(|_, partial| partial.started.elapsed() < max_age);
        let expired = before - self.pending.len();
        if expired > 0 {
            event!(Level::DEBUG, expired, "Discarded stale partial responses");
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, partial)| partial.started)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            event!(Level::DEBUG, request_id = id, "Evicted oldest partial response");
            self.pending.remove(&id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn datagram(request_id: u16, seq: u16, total: u16, body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        FrameHeader {
            request_id,
            seq,
            total,
        }
        .encode(&mut buf);
        buf.extend_from_slice(body);
        buf.to_vec()
    }

    #[test]
    fn test_single_datagram() {
        let mut r = Reassembly::new(4, Duration::from_secs(1));
        let out = r.accept(&datagram(7, 0, 1, b"END\r\n")).unwrap();
        assert_eq!(out, Some((7, Bytes::from_static(b"END\r\n"))));
        assert!(r.is_empty());
    }

    #[test]
    fn test_out_of_order_and_duplicates() {
        let mut r = Reassembly::new(4, Duration::from_secs(1));
        assert_eq!(r.accept(&datagram(1, 2, 3, b"c")).unwrap(), None);
        assert_eq!(r.accept(&datagram(1, 0, 3, b"a")).unwrap(), None);
        assert_eq!(r.accept(&datagram(1, 0, 3, b"x")).unwrap(), None);
        assert_eq!(r.len(), 1);
        let out = r.accept(&datagram(1, 1, 3, b"b")).unwrap();
        assert_eq!(out, Some((1, Bytes::from_static(b"abc"))));
        assert!(r.is_empty());
    }

    #[test]
    fn test_rejects_bad_frames() {
        let mut r = Reassembly::new(4, Duration::from_secs(1));
        assert_eq!(r.accept(b"abc"), Err(Error::Truncated(3)));
        assert_eq!(
            r.accept(&datagram(1, 3, 3, b"")),
            Err(Error::BadSequence { seq: 3, total: 3 })
        );
        r.accept(&datagram(1, 0, 3, b"")).unwrap();
        assert_eq!(
            r.accept(&datagram(1, 1, 2, b"")),
            Err(Error::TotalMismatch {
                id: 1,
                expected: 3,
                actual: 2
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_oldest_when_full() {
        let mut r = Reassembly::new(2, Duration::from_secs(60));
        r.accept(&datagram(1, 0, 2, b"")).unwrap();
        tokio::time::advance(Duration::from_millis(1)).await;
        r.accept(&datagram(2, 0, 2, b"")).unwrap();
        tokio::time::advance(Duration::from_millis(1)).await;
        r.accept(&datagram(3, 0, 2, b"")).unwrap();
        assert_eq!(r.len(), 2);

        // Request 1 was evicted, so its last datagram starts over.
        assert_eq!(r.accept(&datagram(1, 1, 2, b"")).unwrap(), None);
        assert!(r.accept(&datagram(3, 1, 2, b"")).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_stale_responses() {
        let mut r = Reassembly::new(8, Duration::from_secs(1));
        r.accept(&datagram(1, 0, 2, b"")).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        r.accept(&datagram(2, 0, 2, b"")).unwrap();
        assert_eq!(r.len(), 1);

        r.discard(2);
        assert!(r.is_empty());
    }
}
