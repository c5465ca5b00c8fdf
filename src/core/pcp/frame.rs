// src/core/pcp/frame.rs

//! The control protocol frame: `tos:1 || length:4-be || payload`, where the
//! length includes the length field itself and the payload is a sequence of
//! NUL-terminated ASCII strings (or raw bytes for the salt).

use crate::core::errors::PoolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frames beyond this size are junk or an attack, not operator traffic.
const MAX_FRAME_PAYLOAD: usize = 4 * 1024 * 1024;

/// One control protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcpFrame {
    pub tos: u8,
    pub payload: Bytes,
}

impl PcpFrame {
    pub fn new(tos: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            tos,
            payload: payload.into(),
        }
    }

    /// Builds a frame whose payload is the given strings, NUL-terminated.
    pub fn from_strings(tos: u8, strings: &[&str]) -> Self {
        let mut payload = BytesMut::new();
        for s in strings {
            payload.put_slice(s.as_bytes());
            payload.put_u8(0);
        }
        Self {
            tos,
            payload: payload.freeze(),
        }
    }

    /// Splits the payload back into its NUL-terminated strings.
    pub fn strings(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut rest: &[u8] = &self.payload;
        while let Some(pos) = rest.iter().position(|&b| b == 0) {
            out.push(String::from_utf8_lossy(&rest[..pos]).to_string());
            rest = &rest[pos + 1..];
        }
        out
    }

    /// The first payload string, for single-token requests.
    pub fn first_string(&self) -> Option<String> {
        self.strings().into_iter().next()
    }
}

/// A `tokio_util::codec` implementation for control protocol frames.
#[derive(Debug, Default)]
pub struct PcpCodec;

impl Encoder<PcpFrame> for PcpCodec {
    type Error = PoolError;

    fn encode(&mut self, item: PcpFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.payload.len() + 5);
        dst.put_u8(item.tos);
        dst.put_i32(item.payload.len() as i32 + 4);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for PcpCodec {
    type Item = PcpFrame;
    type Error = PoolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 5 {
            return Ok(None);
        }
        let tos = src[0];
        let len = i32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        if len < 4 {
            return Err(PoolError::Protocol(format!(
                "control frame length {len} is too short"
            )));
        }
        let payload_len = (len - 4) as usize;
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(PoolError::Protocol(format!(
                "control frame payload of {payload_len} bytes exceeds the limit"
            )));
        }
        if src.len() < 5 + payload_len {
            src.reserve(5 + payload_len - src.len());
            return Ok(None);
        }
        src.advance(5);
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(PcpFrame { tos, payload }))
    }
}

/// Builds the tagged-field error payload: `S`/`M`/`D` fields, each a tag
/// byte and a NUL-terminated string, closed by a zero byte.
pub fn error_payload(severity: &str, message: &str, detail: Option<&str>) -> Bytes {
    let mut payload = BytesMut::new();
    for (tag, value) in [(b'S', severity), (b'M', message)] {
        payload.put_u8(tag);
        payload.put_slice(value.as_bytes());
        payload.put_u8(0);
    }
    if let Some(detail) = detail {
        payload.put_u8(b'D');
        payload.put_slice(detail.as_bytes());
        payload.put_u8(0);
    }
    payload.put_u8(0);
    payload.freeze()
}

/// Parses an error payload back into (severity, message, detail).
pub fn parse_error_payload(payload: &[u8]) -> (String, String, Option<String>) {
    let mut severity = String::new();
    let mut message = String::new();
    let mut detail = None;
    let mut rest = payload;
    while let Some((&tag, after)) = rest.split_first() {
        if tag == 0 {
            break;
        }
        rest = after;
        let Some(pos) = rest.iter().position(|&b| b == 0) else {
            break;
        };
        let value = String::from_utf8_lossy(&rest[..pos]).to_string();
        rest = &rest[pos + 1..];
        match tag {
            b'S' => severity = value,
            b'M' => message = value,
            b'D' => detail = Some(value),
            _ => {}
        }
    }
    (severity, message, detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips() {
        let mut codec = PcpCodec;
        let frame = PcpFrame::from_strings(b'i', &["db0", "5432", "2"]);
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.strings(), vec!["db0", "5432", "2"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = PcpCodec;
        let frame = PcpFrame::from_strings(b'l', &["3"]);
        let mut full = BytesMut::new();
        codec.encode(frame.clone(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[3..]);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), frame);
    }

    #[test]
    fn error_payload_round_trips() {
        let payload = error_payload("ERROR", "node id 9 is out of range", Some("3 nodes"));
        let (severity, message, detail) = parse_error_payload(&payload);
        assert_eq!(severity, "ERROR");
        assert_eq!(message, "node id 9 is out of range");
        assert_eq!(detail.as_deref(), Some("3 nodes"));
    }

    #[test]
    fn short_length_is_a_protocol_error() {
        let mut codec = PcpCodec;
        let mut buf = BytesMut::from(&b"M\x00\x00\x00\x01"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
