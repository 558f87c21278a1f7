//! Codec for encoding and decoding presence frames.
//!
//! This module provides MessagePack-based serialization with length-prefixed framing.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Decode a frame from bytes.
///
/// The buffer must contain exactly one frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, has trailing bytes,
/// or is not a valid frame.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }
    if data.len() > total_size {
        return Err(ProtocolError::Invalid(format!(
            "{} trailing bytes",
            data.len() - total_size
        )));
    }

    let frame = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(frame)
}

/// Decode a payload if it is a presence frame.
///
/// Application payloads share the channel with presence frames, so anything
/// that does not decode cleanly is simply not a frame.
#[must_use]
pub fn try_decode(data: &[u8]) -> Option<Frame> {
    decode(data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::RosterEntry;

    #[test]
    fn test_encode_decode_roundtrip() {
        let frames = vec![
            Frame::presence(
                "lobby",
                1_700_000_000_000,
                vec![
                    RosterEntry::new("7c1e", "Alex"),
                    RosterEntry::new("9f02", "Sam"),
                ],
            ),
            Frame::presence("survival", 5, vec![]),
            Frame::departure("lobby", 1_700_000_000_500),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::departure("lobby", 1);
        let encoded = encode(&frame).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let frame = Frame::departure("lobby", 1);
        let mut encoded = encode(&frame).unwrap().to_vec();
        encoded.push(0);

        assert!(matches!(decode(&encoded), Err(ProtocolError::Invalid(_))));
    }

    #[test]
    fn test_frame_too_large() {
        let mut data = vec![0u8; 8];
        data[..4].copy_from_slice(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes());

        match decode(&data) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_application_payloads_are_not_frames() {
        assert!(try_decode(b"").is_none());
        assert!(try_decode(b"hello, world").is_none());
        assert!(try_decode(&[0, 0, 0, 2, 0x81, 0x00]).is_none());
    }
}
