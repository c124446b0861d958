//! The memcached binary protocol.
//!
//! A batched fetch is one quiet `GETKQ` per key followed by a `NOOP`. The
//! server only answers the keys it holds, and always answers the `NOOP`,
//! which marks the end of the response.

use super::{Codec, DecodeError, Value};

use bytes::{Buf, BufMut, Bytes, BytesMut};

const HEADER_LEN: usize = 24;

const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;

const OPCODE_NOOP: u8 = 0x0a;
const OPCODE_GETKQ: u8 = 0x0d;

const STATUS_OK: u16 = 0x0000;
const STATUS_KEY_NOT_FOUND: u16 = 0x0001;

#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryCodec;

#[derive(Debug)]
struct Header {
    magic: u8,
    opcode: u8,
    key_len: usize,
    extras_len: usize,
    status: u16,
    body_len: usize,
}

impl Header {
    fn parse(mut buf: &[u8]) -> Self {
        let magic = buf.get_u8();
        let opcode = buf.get_u8();
        let key_len = usize::from(buf.get_u16());
        let extras_len = usize::from(buf.get_u8());
        let _data_type = buf.get_u8();
        let status = buf.get_u16();
        let body_len = buf.get_u32() as usize;
        Self {
            magic,
            opcode,
            key_len,
            extras_len,
            status,
            body_len,
        }
    }
}

fn put_request(buf: &mut BytesMut, opcode: u8, key: &[u8], opaque: u32) {
    buf.reserve(HEADER_LEN + key.len());
    buf.put_u8(MAGIC_REQUEST);
    buf.put_u8(opcode);
    buf.put_u16(key.len() as u16);
    // Extras length, data type, vbucket.
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_u16(0);
    buf.put_u32(key.len() as u32);
    buf.put_u32(opaque);
    buf.put_u64(0);
    buf.put_slice(key);
}

// Returns each complete packet in `buf`, and whether a NOOP ended the
// response.
fn packets(buf: &[u8]) -> Result<(Vec<(Header, &[u8])>, bool), DecodeError> {
    let mut packets = vec![];
    let mut pos = 0;
    while buf.len() - pos >= HEADER_LEN {
        let header = Header::parse(&buf[pos..pos + HEADER_LEN]);
        if header.magic != MAGIC_RESPONSE {
            return Err(DecodeError::Malformed(format!(
                "unexpected magic byte {:#04x}",
                header.magic
            )));
        }
        if header.key_len + header.extras_len > header.body_len {
            return Err(DecodeError::Malformed(
                "key and extras exceed body length".to_string(),
            ));
        }
        let body_start = pos + HEADER_LEN;
        let body_end = body_start + header.body_len;
        if buf.len() < body_end {
            break;
        }
        let noop = header.opcode == OPCODE_NOOP;
        packets.push((header, &buf[body_start..body_end]));
        pos = body_end;
        if noop {
            return Ok((packets, true));
        }
    }
    Ok((packets, false))
}

impl Codec for BinaryCodec {
    fn encode_get_multi(&self, keys: &[String], buf: &mut BytesMut) {
        for (i, key) in keys.iter().enumerate() {
            put_request(buf, OPCODE_GETKQ, key.as_bytes(), i as u32);
        }
        put_request(buf, OPCODE_NOOP, &[], keys.len() as u32);
    }

    fn decode_get_multi(&self, buf: &[u8]) -> Result<Option<Vec<(String, Value)>>, DecodeError> {
        let (packets, complete) = packets(buf)?;
        if !complete {
            return Ok(None);
        }
        let mut values = vec![];
        for (header, body) in packets {
            match (header.opcode, header.status) {
                (OPCODE_NOOP, _) => break,
                (_, STATUS_KEY_NOT_FOUND) => continue,
                (_, STATUS_OK) => {}
                (_, status) => {
                    return Err(DecodeError::Server(format!("status {status:#06x}")));
                }
            }
            if header.extras_len < 4 {
                return Err(DecodeError::Malformed("missing flags".to_string()));
            }
            let mut extras = &body[..header.extras_len];
            let flags = extras.get_u32();
            let key_end = header.extras_len + header.key_len;
            let key = std::str::from_utf8(&body[header.extras_len..key_end])
                .map_err(|_| DecodeError::Malformed("key is not UTF-8".to_string()))?;
            values.push((
                key.to_string(),
                Value {
                    flags,
                    data: Bytes::copy_from_slice(&body[key_end..]),
                },
            ));
        }
        Ok(Some(values))
    }

    fn response_complete(&self, buf: &[u8]) -> bool {
        // A response which does not start with a response packet is
        // malformed, and left for the decoder to reject.
        if buf.first().is_some_and(|magic| *magic != MAGIC_RESPONSE) {
            return true;
        }
        if buf.len() < HEADER_LEN {
            return false;
        }
        let header = Header::parse(&buf[buf.len() - HEADER_LEN..]);
        header.magic == MAGIC_RESPONSE && header.opcode == OPCODE_NOOP && header.body_len == 0
    }

    fn encode_probe(&self, buf: &mut BytesMut) {
        put_request(buf, OPCODE_NOOP, &[], 0);
    }

    fn probe_complete(&self, buf: &[u8]) -> Result<bool, DecodeError> {
        let (_, complete) = packets(buf)?;
        Ok(complete)
    }
}
