//! Protocol codec for encoding/decoding messages
//!
//! Handles serialization and framing of channel messages.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;

use super::{Message, MAGIC_BYTES, MAX_FRAME_SIZE};

/// Header size: magic(4) + type(1) + length(4) + sequence(4) = 13 bytes
pub const HEADER_SIZE: usize = 13;

/// Largest bincode payload a frame may carry
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Message type mismatch: header says {header:#04x}, payload is {payload:#04x}")]
    TypeMismatch { header: u8, payload: u8 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Message frame with metadata
#[derive(Debug, Clone)]
pub struct Frame {
    /// Sequence number for ordering
    pub sequence: u32,
    /// The actual message
    pub message: Message,
}

impl Frame {
    pub fn new(sequence: u32, message: Message) -> Self {
        Self { sequence, message }
    }
}

/// Encodes messages into the wire format
pub struct Encoder {
    sequence: u32,
}

impl Encoder {
    pub fn new() -> Self {
        Self { sequence: 0 }
    }

    /// Encode a message into a buffer
    pub fn encode(&mut self, message: &Message, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(message)?;

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len(), MAX_PAYLOAD_SIZE));
        }

        buf.reserve(HEADER_SIZE + payload.len());
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(message.type_id());
        buf.put_u32(payload.len() as u32);
        buf.put_u32(self.sequence);
        buf.put_slice(&payload);

        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes messages from the wire format
pub struct Decoder {
    state: DecodeState,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Payload {
        message_type: u8,
        length: usize,
        sequence: u32,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
        }
    }

    /// True when no partially decoded frame is pending
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Header)
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    if buf[0..4] != MAGIC_BYTES {
                        return Err(CodecError::InvalidMagic);
                    }

                    let message_type = buf[4];
                    let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
                    let sequence = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]);

                    if length > MAX_PAYLOAD_SIZE {
                        return Err(CodecError::MessageTooLarge(length, MAX_PAYLOAD_SIZE));
                    }

                    buf.advance(HEADER_SIZE);

                    self.state = DecodeState::Payload {
                        message_type,
                        length,
                        sequence,
                    };
                }
                DecodeState::Payload { message_type, length, sequence } => {
                    if buf.len() < *length {
                        return Ok(None);
                    }

                    let payload = buf.split_to(*length);
                    let header_type = *message_type;
                    let seq = *sequence;
                    self.state = DecodeState::Header;

                    let message: Message = bincode::deserialize(&payload)?;
                    if message.type_id() != header_type {
                        return Err(CodecError::TypeMismatch {
                            header: header_type,
                            payload: message.type_id(),
                        });
                    }

                    return Ok(Some(Frame::new(seq, message)));
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_CHUNK_SIZE;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();

        let original = Message::ReplyHeader {
            id: 7,
            status: 20,
            meta: "text/gemini".to_string(),
        };
        encoder.encode(&original, &mut buf).unwrap();

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.message, original);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_sequence_numbers() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();

        let messages = vec![
            Message::Stop { id: 1 },
            Message::TrustVerdict { id: 2, accept: true },
            Message::Quit,
        ];

        for msg in &messages {
            encoder.encode(msg, &mut buf).unwrap();
        }

        for (i, original) in messages.iter().enumerate() {
            let frame = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.sequence, i as u32);
            assert_eq!(&frame.message, original);
        }
    }

    #[test]
    fn test_partial_frame_needs_more() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut full = BytesMut::new();
        encoder.encode(&Message::EndOfStream { id: 3 }, &mut full).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..HEADER_SIZE + 1]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[HEADER_SIZE + 1..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.message, Message::EndOfStream { id: 3 });
    }

    #[test]
    fn test_invalid_magic() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&b"NOPE\x01\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        assert!(matches!(decoder.decode(&mut buf), Err(CodecError::InvalidMagic)));
    }

    #[test]
    fn test_full_chunk_fits_in_frame() {
        let mut encoder = Encoder::new();
        let mut buf = BytesMut::new();
        let msg = Message::BodyChunk {
            id: u32::MAX,
            data: vec![0xAB; MAX_CHUNK_SIZE],
        };
        encoder.encode(&msg, &mut buf).unwrap();
        assert!(buf.len() <= MAX_FRAME_SIZE);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut encoder = Encoder::new();
        let mut buf = BytesMut::new();
        let msg = Message::BodyChunk {
            id: 1,
            data: vec![0; MAX_FRAME_SIZE],
        };
        assert!(matches!(
            encoder.encode(&msg, &mut buf),
            Err(CodecError::MessageTooLarge(_, _))
        ));
        assert!(buf.is_empty());
    }
}
