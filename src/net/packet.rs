//! Packet framing for stream transports.
//!
//! TCP delivers a byte stream; a [`PacketCodec`] turns it back into discrete
//! packets ("sticky packet" splitting). Datagram transports bypass framing.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::connection::NetError;

/// Length of the big-endian size header used by [`LengthPrefixed`].
pub const HEADER_LEN: usize = 4;

/// Splits stream bytes into packets and frames outgoing packets.
pub trait PacketCodec: Send + Sync + fmt::Debug {
    /// Drain every complete packet from `buf`, leaving a partial tail in place.
    fn split(&self, buf: &mut Vec<u8>) -> Result<Vec<Vec<u8>>, NetError>;

    /// Frame a payload for writing.
    fn frame(&self, payload: &[u8]) -> Vec<u8>;
}

/// No framing: whatever one read returns is one packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl PacketCodec for RawCodec {
    fn split(&self, buf: &mut Vec<u8>) -> Result<Vec<Vec<u8>>, NetError> {
        if buf.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![std::mem::take(buf)])
    }

    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }
}

/// 4-byte big-endian length header followed by the payload.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixed {
    max_len: usize,
}

impl LengthPrefixed {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl Default for LengthPrefixed {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl PacketCodec for LengthPrefixed {
    fn split(&self, buf: &mut Vec<u8>) -> Result<Vec<Vec<u8>>, NetError> {
        let mut packets = Vec::new();
        let mut offset = 0;

        while buf.len() - offset >= HEADER_LEN {
            let head = &buf[offset..offset + HEADER_LEN];
            let len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
            if len > self.max_len {
                return Err(NetError::FrameTooLarge {
                    len,
                    max: self.max_len,
                });
            }
            let start = offset + HEADER_LEN;
            if buf.len() - start < len {
                break;
            }
            packets.push(buf[start..start + len].to_vec());
            offset = start + len;
        }

        buf.drain(..offset);
        Ok(packets)
    }

    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

/// Framing strategy as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    Raw,
    #[default]
    LengthPrefixed,
}

impl Framing {
    pub fn codec(&self, max_len: usize) -> Arc<dyn PacketCodec> {
        match self {
            Framing::Raw => Arc::new(RawCodec),
            Framing::LengthPrefixed => Arc::new(LengthPrefixed::new(max_len)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefixed_keeps_partial_tail() {
        let codec = LengthPrefixed::default();
        let mut buf = codec.frame(b"hello");
        buf.extend(codec.frame(b"world"));
        let tail = codec.frame(b"partial");
        buf.extend_from_slice(&tail[..6]);

        let packets = codec.split(&mut buf).unwrap();
        assert_eq!(packets, vec![b"hello".to_vec(), b"world".to_vec()]);
        assert_eq!(buf, tail[..6].to_vec());

        buf.extend_from_slice(&tail[6..]);
        let packets = codec.split(&mut buf).unwrap();
        assert_eq!(packets, vec![b"partial".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn length_prefixed_rejects_oversize() {
        let codec = LengthPrefixed::new(4);
        let mut buf = LengthPrefixed::default().frame(b"too long");
        assert!(matches!(
            codec.split(&mut buf),
            Err(NetError::FrameTooLarge { len: 8, max: 4 })
        ));
    }

    #[test]
    fn raw_codec_passes_chunks_through() {
        let mut buf = b"abc".to_vec();
        assert_eq!(RawCodec.split(&mut buf).unwrap(), vec![b"abc".to_vec()]);
        assert!(buf.is_empty());
        assert!(RawCodec.split(&mut buf).unwrap().is_empty());
    }
}
