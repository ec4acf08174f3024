//! Protocol codec for encoding/decoding packets
//!
//! Handles framing of packets. Decoding is resumable: on partial input the
//! buffer is left untouched until a whole frame has arrived.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;

use super::{peek_var_u32, var_u32_len, BufReadExt, BufWriteExt, Packet, MAX_FRAME_SIZE};

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Var-int exceeds 32 bits")]
    VarIntTooLong,

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Body length mismatch: declared {declared}, frame holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Malformed packet: {0}")]
    Malformed(&'static str),
}

/// Encodes packets into the wire format
#[derive(Debug, Clone)]
pub struct Encoder {
    max_frame_size: usize,
}

impl Encoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Size of the frame interior for a packet
    pub fn frame_len(packet: &Packet) -> usize {
        let body_len = packet.body().len();
        var_u32_len(packet.channel())
            + 2
            + if packet.correlation_id().is_some() { 16 } else { 0 }
            + var_u32_len(body_len as u32)
            + body_len
    }

    /// Encode a packet, including its outer length prefix, into a buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), CodecError> {
        let frame_len = Self::frame_len(packet);
        if frame_len > self.max_frame_size || packet.body().len() > u32::MAX as usize {
            return Err(CodecError::FrameTooLarge(frame_len, self.max_frame_size));
        }

        buf.reserve(var_u32_len(frame_len as u32) + frame_len);
        buf.put_var_u32(frame_len as u32);
        buf.put_var_u32(packet.channel());
        buf.put_bool(packet.is_prioritized());
        match packet.correlation_id() {
            Some(id) => {
                buf.put_bool(true);
                buf.put_uuid(&id);
            }
            None => buf.put_bool(false),
        }
        buf.put_var_u32(packet.body().len() as u32);
        buf.put_slice(packet.body());
        Ok(())
    }

    /// Encode into a freshly allocated buffer
    pub fn encode_to_bytes(&self, packet: &Packet) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode(packet, &mut buf)?;
        Ok(buf.freeze())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

/// Decodes packets from the wire format
#[derive(Debug, Clone)]
pub struct Decoder {
    max_frame_size: usize,
}

impl Decoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Attempt to decode a packet from the buffer.
    /// Returns Ok(None) if more data is needed; nothing is consumed in that case.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        loop {
            let (frame_len, prefix_len) = match peek_var_u32(&buf[..])? {
                Some(header) => header,
                None => return Ok(None),
            };
            let frame_len = frame_len as usize;

            if frame_len > self.max_frame_size {
                return Err(CodecError::FrameTooLarge(frame_len, self.max_frame_size));
            }

            // Empty frames are keepalives
            if frame_len == 0 {
                buf.advance(prefix_len);
                continue;
            }

            if buf.len() < prefix_len + frame_len {
                return Ok(None);
            }

            buf.advance(prefix_len);
            let frame = buf.split_to(frame_len).freeze();
            return decode_frame(frame).map(Some);
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

/// Parse the interior of one complete frame
fn decode_frame(mut frame: Bytes) -> Result<Packet, CodecError> {
    let channel = frame.get_var_u32_checked()?;
    let prioritized = frame.get_bool_checked()?;
    let correlation_id = if frame.get_bool_checked()? {
        Some(frame.get_uuid_checked()?)
    } else {
        None
    };

    let declared = frame.get_var_u32_checked()? as usize;
    if frame.remaining() != declared {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: frame.remaining(),
        });
    }

    let body = frame.copy_to_bytes(declared);
    Ok(Packet::from_parts(channel, prioritized, correlation_id, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CHANNEL_MESSAGE_CHANNEL, FIRST_USER_CHANNEL};
    use uuid::Uuid;

    fn sample_packets() -> Vec<Packet> {
        vec![
            Packet::new(CHANNEL_MESSAGE_CHANNEL, Bytes::new()),
            Packet::prioritized(FIRST_USER_CHANNEL, &b"hello"[..]),
            Packet::new((1 << 31) - 1, vec![7u8; 300]).with_correlation(Uuid::new_v4()),
            Packet::prioritized(128, vec![0xAB; 1024 * 1024]).with_correlation(Uuid::new_v4()),
        ]
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let encoder = Encoder::default();
        let mut decoder = Decoder::default();

        for original in sample_packets() {
            let mut buf = BytesMut::new();
            encoder.encode(&original, &mut buf).unwrap();

            let decoded = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, original);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_every_split_point() {
        let encoder = Encoder::default();
        let packet = Packet::prioritized(4242, &b"split me anywhere"[..]).with_correlation(Uuid::new_v4());
        let wire = encoder.encode_to_bytes(&packet).unwrap();

        for split in 0..wire.len() {
            let mut decoder = Decoder::default();
            let mut buf = BytesMut::from(&wire[..split]);

            assert!(decoder.decode(&mut buf).unwrap().is_none(), "split at {split}");
            assert_eq!(buf.len(), split, "partial input must not be consumed");

            buf.extend_from_slice(&wire[split..]);
            assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), packet);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_multiple_packets_no_over_read() {
        let encoder = Encoder::default();
        let mut decoder = Decoder::default();
        let mut buf = BytesMut::new();

        let packets = sample_packets();
        for packet in &packets {
            encoder.encode(packet, &mut buf).unwrap();
        }
        // A partial trailing frame must stay buffered
        buf.extend_from_slice(&[0x05, 0x40]);

        for packet in &packets {
            assert_eq!(&decoder.decode(&mut buf).unwrap().unwrap(), packet);
        }
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], &[0x05, 0x40]);
    }

    #[test]
    fn test_keepalive_frames_skipped() {
        let encoder = Encoder::default();
        let mut decoder = Decoder::default();
        let packet = Packet::new(FIRST_USER_CHANNEL, &b"after keepalive"[..]);

        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        buf.extend_from_slice(&[0]);
        encoder.encode(&packet, &mut buf).unwrap();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), packet);
    }

    #[test]
    fn test_frame_too_large() {
        let mut decoder = Decoder::new(16);
        let mut buf = BytesMut::new();
        buf.put_var_u32(17);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(CodecError::FrameTooLarge(17, 16))
        ));

        let encoder = Encoder::new(16);
        let mut out = BytesMut::new();
        assert!(encoder.encode(&Packet::new(70, vec![0u8; 32]), &mut out).is_err());
    }

    #[test]
    fn test_body_length_mismatch() {
        // Interior: channel 70, not prioritized, no correlation, declared body 4, only 2 bytes
        let interior = [70u8, 0, 0, 4, 1, 2];
        let mut buf = BytesMut::new();
        buf.put_var_u32(interior.len() as u32);
        buf.put_slice(&interior);

        let mut decoder = Decoder::default();
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(CodecError::LengthMismatch { declared: 4, actual: 2 })
        ));
    }
}
