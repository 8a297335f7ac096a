//! RFC 6455 frame encoding and incremental parsing.
//!
//! This layer knows nothing about messages: it turns bytes into single frames
//! and back. Reassembly of fragmented messages happens in [`super::Reader`].

/// Frame opcodes understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Opcode> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    /// Control frames may not be fragmented and carry at most 125 bytes.
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// Errors that make the byte stream unusable.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Opcode not supported: {0:#x}")]
    UnsupportedOpcode(u8),
    #[error("Reserved header bits set without a negotiated extension")]
    ReservedBits,
    #[error("Control frame is fragmented or longer than 125 bytes")]
    InvalidControlFrame,
    #[error("Frame of {0} bytes does not fit in memory")]
    TooLong(u64),
}

/// A single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A complete (FIN) frame.
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Frame {
        Frame {
            fin: true,
            opcode,
            payload,
        }
    }

    /// Serializes the frame.
    ///
    /// Frames sent from client to server must be masked; frames sent from
    /// server to client must not be.
    pub fn encode(&self, mask: Option<[u8; 4]>) -> Vec<u8> {
        //https://datatracker.ietf.org/doc/html/rfc6455#section-5.2
        let mut frame = Vec::with_capacity(self.payload.len() + 14);
        let fin = if self.fin { 0b1000_0000 } else { 0 };
        frame.push(fin | self.opcode.bits());
        const MASK_ON: u8 = 0b1000_0000;
        const MASK_OFF: u8 = 0b0000_0000;
        let mask_current = if mask.is_some() { MASK_ON } else { MASK_OFF };
        let len = self.payload.len();
        if len <= 125 {
            frame.push(len as u8 | mask_current);
        } else if len <= 65535 {
            frame.push(126 | mask_current);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            frame.push(127 | mask_current);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
        match mask {
            Some(key) => {
                frame.extend_from_slice(&key);
                let data_begin = frame.len();
                frame.extend_from_slice(&self.payload);
                apply_mask(&mut frame[data_begin..], key);
            }
            None => frame.extend_from_slice(&self.payload),
        }
        frame
    }
}

/// XORs `data` in place with the masking key.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Accumulates bytes from the socket and pops complete frames.
#[derive(Debug, Default)]
pub struct FrameParser {
    unparsed: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> FrameParser {
        FrameParser::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.unparsed.extend_from_slice(data);
    }

    /// Number of bytes received but not yet consumed by a frame.
    pub fn buffered(&self) -> usize {
        self.unparsed.len()
    }

    /// Pops the next frame, or `Ok(None)` if more bytes are needed.
    pub fn parse(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.unparsed.len() < 2 {
            return Ok(None);
        }
        let first = self.unparsed[0];
        let fin = first & 0b1000_0000 != 0;
        if first & 0b0111_0000 != 0 {
            return Err(FrameError::ReservedBits);
        }
        let opcode_bits = first & 0b0000_1111;
        let opcode =
            Opcode::from_bits(opcode_bits).ok_or(FrameError::UnsupportedOpcode(opcode_bits))?;

        //second byte is the mask bit and the payload length
        let payload_length = self.unparsed[1] & 0b0111_1111;
        let mask = self.unparsed[1] & 0b1000_0000 != 0;
        let (len, mask_begin) = if payload_length < 126 {
            (u64::from(payload_length), 2)
        } else if payload_length == 126 {
            if self.unparsed.len() < 4 {
                return Ok(None);
            }
            let len_bytes = [self.unparsed[2], self.unparsed[3]];
            (u64::from(u16::from_be_bytes(len_bytes)), 4)
        } else {
            if self.unparsed.len() < 10 {
                return Ok(None);
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&self.unparsed[2..10]);
            (u64::from_be_bytes(len_bytes), 10)
        };
        if opcode.is_control() && (!fin || len > 125) {
            return Err(FrameError::InvalidControlFrame);
        }
        let len = usize::try_from(len).map_err(|_| FrameError::TooLong(len))?;
        let mask_bytes = if mask { 4 } else { 0 };
        let data_begin: usize = mask_begin + mask_bytes;
        let frame_end = data_begin
            .checked_add(len)
            .ok_or(FrameError::TooLong(len as u64))?;
        if self.unparsed.len() < frame_end {
            return Ok(None);
        }

        let mut payload = self.unparsed[data_begin..frame_end].to_vec();
        if mask {
            let mut key = [0u8; 4];
            key.copy_from_slice(&self.unparsed[mask_begin..data_begin]);
            apply_mask(&mut payload, key);
        }
        self.unparsed.drain(..frame_end);
        Ok(Some(Frame {
            fin,
            opcode,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_unmasked_header() {
        let bytes = Frame::new(Opcode::Text, b"hi".to_vec()).encode(None);
        assert_eq!(bytes, vec![0x81, 0x02, b'h', b'i']);
    }

    #[test]
    fn extended_lengths_use_the_right_header() {
        let medium = Frame::new(Opcode::Binary, vec![7; 4096]).encode(None);
        assert_eq!(&medium[..4], &[0x82, 126, 0x10, 0x00]);
        assert_eq!(medium.len(), 4 + 4096);

        let large = Frame::new(Opcode::Binary, vec![7; 70_000]).encode(None);
        assert_eq!(large[1], 127);
        assert_eq!(&large[2..10], &70_000u64.to_be_bytes());
    }

    #[test]
    fn parses_masked_frame_fed_byte_by_byte() {
        let payload = b"{\"from\":\"web\"}".to_vec();
        let bytes = Frame::new(Opcode::Text, payload.clone()).encode(Some([1, 2, 3, 4]));
        assert_ne!(&bytes[6..], payload.as_slice());

        let mut parser = FrameParser::new();
        for (i, byte) in bytes.iter().enumerate() {
            assert_eq!(parser.parse(), Ok(None), "frame completed early at byte {i}");
            parser.push(&[*byte]);
        }
        let frame = parser.parse().unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, payload);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn leaves_following_frame_buffered() {
        let mut bytes = Frame::new(Opcode::Ping, vec![]).encode(None);
        bytes.extend(Frame::new(Opcode::Binary, vec![1, 2, 3]).encode(Some([9, 9, 9, 9])));
        let mut parser = FrameParser::new();
        parser.push(&bytes);
        assert_eq!(parser.parse().unwrap().unwrap().opcode, Opcode::Ping);
        let second = parser.parse().unwrap().unwrap();
        assert_eq!(second.opcode, Opcode::Binary);
        assert_eq!(second.payload, vec![1, 2, 3]);
        assert_eq!(parser.parse(), Ok(None));
    }

    #[test]
    fn rejects_unknown_opcode_and_reserved_bits() {
        let mut parser = FrameParser::new();
        parser.push(&[0x83, 0x00]);
        assert_eq!(parser.parse(), Err(FrameError::UnsupportedOpcode(0x3)));

        let mut parser = FrameParser::new();
        parser.push(&[0xC1, 0x00]);
        assert_eq!(parser.parse(), Err(FrameError::ReservedBits));
    }

    #[test]
    fn rejects_fragmented_control_frame() {
        let mut parser = FrameParser::new();
        parser.push(&[0x09, 0x00]);
        assert_eq!(parser.parse(), Err(FrameError::InvalidControlFrame));
    }
}
