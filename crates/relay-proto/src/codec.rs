//! Codec for encoding and decoding cluster envelopes.
//!
//! MessagePack serialization with length-prefixed framing. Transport-backed
//! brokers put these bytes on one ordered stream per channel.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum envelope size (16 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    EnvelopeTooLarge(usize),

    /// Not enough data to decode an envelope.
    #[error("Incomplete envelope: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encode an envelope to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded envelope
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(envelope)?;

    if payload.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Encode an envelope into an existing buffer.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(envelope)?;

    if payload.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode an envelope from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let envelope = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(envelope)
}

/// Try to decode an envelope from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(envelope))` if a complete envelope was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the envelope is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let envelope = rmp_serde::from_slice(&payload)?;

    Ok(Some(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ClientInfo, NodeId, Publication};

    fn sample_publication() -> Publication {
        let mut p = Publication::new("chat:lobby", b"Hello, world!".to_vec(), NodeId::new("n1"));
        p.seq = 7;
        p
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let envelopes = vec![
            Envelope::Publication(sample_publication()),
            Envelope::Join {
                channel: "chat:lobby".to_string(),
                info: ClientInfo::new("42", "conn-1").with_conn_info(b"meta".to_vec()),
            },
            Envelope::Leave {
                channel: "chat:lobby".to_string(),
                info: ClientInfo::new("42", "conn-1"),
            },
            Envelope::Unsubscribe {
                channel: "news".to_string(),
                user: "42".to_string(),
            },
        ];

        for envelope in envelopes {
            let encoded = encode(&envelope).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(envelope, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let envelope = Envelope::Publication(sample_publication());
        let encoded = encode(&envelope).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_envelope_too_large() {
        let p = Publication::new("test", vec![0u8; MAX_ENVELOPE_SIZE + 1], NodeId::new("n1"));
        let envelope = Envelope::Publication(p);

        match encode(&envelope) {
            Err(ProtocolError::EnvelopeTooLarge(_)) => {}
            other => panic!("Expected EnvelopeTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let e1 = Envelope::Publication(sample_publication());
        let e2 = Envelope::Unsubscribe {
            channel: "news".to_string(),
            user: "7".to_string(),
        };

        let mut buf = BytesMut::new();
        encode_into(&e1, &mut buf).unwrap();
        encode_into(&e2, &mut buf).unwrap();

        let decoded1 = decode_from(&mut buf).unwrap().unwrap();
        let decoded2 = decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(e1, decoded1);
        assert_eq!(e2, decoded2);
        assert!(buf.is_empty());

        // Nothing left to decode
        assert!(decode_from(&mut buf).unwrap().is_none());
    }
}
