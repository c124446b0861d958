//! The memcached ASCII protocol.

use super::{Codec, DecodeError, Value};

use bytes::{Bytes, BytesMut};

const END: &[u8] = b"END";

// How far back from the end of a response an error line is looked for.
const MAX_TAIL_LINE: usize = 1024;

/// Speaks the text protocol: `get k1 k2 ...`, answered by `VALUE` blocks and
/// a terminating `END`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextCodec;

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

// Error replies end the response at once.
fn check_error(line: &[u8]) -> Result<(), DecodeError> {
    for prefix in [&b"SERVER_ERROR"[..], b"CLIENT_ERROR", b"ERROR"] {
        if line.starts_with(prefix) {
            return Err(DecodeError::Server(
                String::from_utf8_lossy(line).into_owned(),
            ));
        }
    }
    Ok(())
}

fn malformed(line: &[u8]) -> DecodeError {
    DecodeError::Malformed(String::from_utf8_lossy(line).into_owned())
}

// Parses "VALUE <key> <flags> <bytes> [<cas>]".
fn parse_value_line(line: &[u8]) -> Result<(String, u32, usize), DecodeError> {
    let text = std::str::from_utf8(line).map_err(|_| malformed(line))?;
    let mut parts = text.split(' ').filter(|p| !p.is_empty());
    if parts.next() != Some("VALUE") {
        return Err(malformed(line));
    }
    let key = parts.next().ok_or_else(|| malformed(line))?;
    let flags = parts
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| malformed(line))?;
    let len = parts
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| malformed(line))?;
    Ok((key.to_string(), flags, len))
}

impl Codec for TextCodec {
    fn encode_get_multi(&self, keys: &[String], buf: &mut BytesMut) {
        buf.extend_from_slice(b"get");
        for key in keys {
            buf.extend_from_slice(b" ");
            buf.extend_from_slice(key.as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
    }

    fn decode_get_multi(&self, buf: &[u8]) -> Result<Option<Vec<(String, Value)>>, DecodeError> {
        let mut values = vec![];
        let mut pos = 0;
        loop {
            let Some(line_len) = find_crlf(&buf[pos..]) else {
                return Ok(None);
            };
            let line = &buf[pos..pos + line_len];
            if line == END {
                return Ok(Some(values));
            }
            check_error(line)?;
            let (key, flags, len) = parse_value_line(line)?;

            let data_start = pos + line_len + 2;
            let data_end = data_start.checked_add(len).ok_or_else(|| malformed(line))?;
            let block_end = data_end.checked_add(2).ok_or_else(|| malformed(line))?;
            if buf.len() < block_end {
                return Ok(None);
            }
            if &buf[data_end..block_end] != b"\r\n" {
                return Err(DecodeError::Malformed(format!(
                    "data block for {key} is not terminated"
                )));
            }
            let data = Bytes::copy_from_slice(&buf[data_start..data_end]);
            values.push((key, Value { flags, data }));
            pos = block_end;
        }
    }

    fn response_complete(&self, buf: &[u8]) -> bool {
        if !buf.ends_with(b"\r\n") {
            return false;
        }
        // Only VALUE blocks continue a response; END, errors and garbage are
        // all for the decoder to judge.
        if !buf.starts_with(b"VALUE ") {
            return true;
        }
        let body = &buf[..buf.len() - 2];
        let tail = &body[body.len().saturating_sub(MAX_TAIL_LINE)..];
        match tail.windows(2).rposition(|w| w == b"\r\n") {
            Some(i) => {
                let last = &tail[i + 2..];
                last == END || check_error(last).is_err()
            }
            None => false,
        }
    }

    fn encode_probe(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(b"version\r\n");
    }

    fn probe_complete(&self, buf: &[u8]) -> Result<bool, DecodeError> {
        let Some(line_len) = find_crlf(buf) else {
            return Ok(false);
        };
        let line = &buf[..line_len];
        check_error(line)?;
        if line.starts_with(b"VERSION ") {
            Ok(true)
        } else {
            Err(malformed(line))
        }
    }
}
