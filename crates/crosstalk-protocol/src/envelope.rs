//! Envelope line codec.
//!
//! Every message published on the bus is a single text line of the form
//! `sender|base64(payload)`. The sender is the process identifier of the
//! publishing server; the payload is opaque to Crosstalk.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use thiserror::Error;

/// Separator between the sender identifier and the encoded payload.
pub const SEPARATOR: char = '|';

/// Errors produced while decoding an envelope line.
///
/// Bus channels may carry unrelated traffic, so callers on the receive path
/// treat these as "drop the message", never as failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The line has no `|` separator.
    #[error("Missing sender separator")]
    MissingSeparator,

    /// The payload part is not valid base64.
    #[error("Invalid payload encoding: {0}")]
    InvalidPayload(#[from] base64::DecodeError),

    /// The sender identifier is empty or contains the separator.
    #[error("Invalid sender id: {0:?}")]
    InvalidSender(String),
}

/// One sender identity plus one opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Process identifier of the publishing server.
    pub sender: String,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(sender: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            sender: sender.into(),
            payload: payload.into(),
        }
    }

    /// Encode this envelope as a bus line.
    #[must_use]
    pub fn encode(&self) -> String {
        encode(&self.sender, &self.payload)
    }

    /// Check whether this envelope was published by `server_name`.
    #[must_use]
    pub fn is_from(&self, server_name: &str) -> bool {
        self.sender == server_name
    }
}

/// Validate a process identifier for use as an envelope sender.
///
/// # Errors
///
/// Returns [`EnvelopeError::InvalidSender`] if the id is empty or contains `|`.
pub fn validate_sender_id(sender: &str) -> Result<(), EnvelopeError> {
    if sender.is_empty() || sender.contains(SEPARATOR) {
        return Err(EnvelopeError::InvalidSender(sender.to_string()));
    }
    Ok(())
}

/// Encode a sender and payload as a bus line.
///
/// The sender is not escaped; identifiers containing `|` must be rejected
/// up front with [`validate_sender_id`].
#[must_use]
pub fn encode(sender: &str, payload: &[u8]) -> String {
    let encoded = STANDARD.encode(payload);
    let mut line = String::with_capacity(sender.len() + 1 + encoded.len());
    line.push_str(sender);
    line.push(SEPARATOR);
    line.push_str(&encoded);
    line
}

/// Decode a bus line into an envelope.
///
/// The line is split at the first `|`: everything before it is the sender,
/// everything after it is the base64 payload.
///
/// # Errors
///
/// Returns an error if the separator is missing or the payload is not valid
/// base64.
pub fn decode(line: &str) -> Result<Envelope, EnvelopeError> {
    let (sender, encoded) = line
        .split_once(SEPARATOR)
        .ok_or(EnvelopeError::MissingSeparator)?;
    let payload = STANDARD.decode(encoded)?;

    Ok(Envelope {
        sender: sender.to_string(),
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_format() {
        assert_eq!(encode("lobby", b"hi"), "lobby|aGk=");
        assert_eq!(encode("lobby", b""), "lobby|");
    }

    #[test]
    fn test_decode_splits_on_first_separator() {
        // base64 never contains '|', so anything after the first one is payload
        let envelope = decode("survival|aGk=").unwrap();
        assert_eq!(envelope.sender, "survival");
        assert_eq!(&envelope.payload[..], b"hi");

        assert!(matches!(
            decode("a|b|c"),
            Err(EnvelopeError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_decode_missing_separator() {
        assert_eq!(
            decode("no separator here"),
            Err(EnvelopeError::MissingSeparator)
        );
        assert_eq!(decode(""), Err(EnvelopeError::MissingSeparator));
    }

    #[test]
    fn test_decode_invalid_base64() {
        assert!(matches!(
            decode("lobby|not base64!"),
            Err(EnvelopeError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_empty_sender_is_decodable() {
        let envelope = decode("|aGk=").unwrap();
        assert_eq!(envelope.sender, "");
    }

    #[test]
    fn test_validate_sender_id() {
        assert!(validate_sender_id("lobby-1").is_ok());
        assert!(validate_sender_id("").is_err());
        assert!(validate_sender_id("lob|by").is_err());
    }

    #[test]
    fn test_is_from() {
        let envelope = Envelope::new("lobby", b"x".to_vec());
        assert!(envelope.is_from("lobby"));
        assert!(!envelope.is_from("survival"));
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            sender in "[^|]{0,32}",
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let line = encode(&sender, &payload);
            let envelope = decode(&line).unwrap();
            prop_assert_eq!(envelope.sender, sender);
            prop_assert_eq!(&envelope.payload[..], &payload[..]);
        }
    }
}
