//! Wire message: `[flags:1][sequence:4 BE][payload]`.
//!
//! Flag `0x80` marks a reply, `0x40` an error reply. A reply carries the
//! sequence number of the request it answers.

const FLAG_REPLY: u8 = 0x80;
const FLAG_ERROR: u8 = 0x40;
/// Size of the fixed header.
pub const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub reply: bool,
    pub error: bool,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn request(sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            reply: false,
            error: false,
            sequence,
            payload,
        }
    }

    /// Empty reply correlated to this message.
    pub fn create_reply(&self) -> Self {
        Self {
            reply: true,
            error: false,
            sequence: self.sequence,
            payload: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.reply {
            flags |= FLAG_REPLY;
        }
        if self.error {
            flags |= FLAG_ERROR;
        }
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(flags);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a packet. Returns `None` when it is shorter than the header.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let flags = bytes[0];
        let sequence = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Some(Self {
            reply: flags & FLAG_REPLY != 0,
            error: flags & FLAG_ERROR != 0,
            sequence,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_keeps_sequence_and_flags() {
        let request = Message::request(7, b"{}".to_vec());
        let mut reply = request.create_reply();
        reply.error = true;
        reply.payload = b"x".to_vec();

        let bytes = reply.to_bytes();
        assert_eq!(bytes[0], 0xC0);
        let parsed = Message::from_bytes(&bytes).unwrap();
        assert!(parsed.reply && parsed.error);
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.payload, b"x");
    }

    #[test]
    fn short_packet_is_rejected() {
        assert!(Message::from_bytes(&[0x80, 0, 0]).is_none());
    }
}
