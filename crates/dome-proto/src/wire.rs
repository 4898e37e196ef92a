// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Broker link framing and CBOR helpers.
//!
//! Packet layout:
//!
//! ``MAGIC(4) || VERSION(2) || FLAGS(2) || LENGTH(4) || PAYLOAD || CHECKSUM(32)``
//!
//! * PAYLOAD is a CBOR-encoded [`BrokerMessage`]
//! * CHECKSUM = blake3-256 over HEADER (first 12 bytes) || PAYLOAD

use blake3::Hasher;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::BrokerMessage;

/// Protocol magic constant "DOME".
pub const MAGIC: [u8; 4] = *b"DOME";
/// Wire protocol version (big-endian u16).
pub const VERSION: u16 = 0x0001;
/// Reserved flags (zero for v1).
pub const FLAGS: u16 = 0x0000;
/// Header length in bytes.
pub const HEADER_BYTES: usize = 12;
/// Trailing checksum length in bytes.
pub const CHECKSUM_BYTES: usize = 32;
/// Largest payload accepted on the link.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Framing and codec failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than the header or declared length requires.
    #[error("incomplete packet")]
    Incomplete,
    /// Magic bytes do not match.
    #[error("bad magic")]
    BadMagic,
    /// Unknown protocol version.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    /// Declared payload exceeds the configured maximum.
    #[error("payload too large ({len} > {max})")]
    PayloadTooLarge {
        /// Declared length.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },
    /// Checksum does not cover header||payload.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// CBOR serialization failed.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR deserialization failed.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Encode a value to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decode a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    ciborium::de::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

/// A full packet (header + payload + checksum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw header (12 bytes).
    pub header: [u8; HEADER_BYTES],
    /// CBOR payload bytes.
    pub payload: Vec<u8>,
    /// blake3 checksum over header||payload.
    pub checksum: [u8; CHECKSUM_BYTES],
}

impl Packet {
    /// Build a packet around a payload.
    pub fn from_payload(payload: Vec<u8>) -> Result<Self, WireError> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len as usize <= MAX_PAYLOAD)
            .ok_or(WireError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            })?;
        let mut header = [0u8; HEADER_BYTES];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_be_bytes());
        header[6..8].copy_from_slice(&FLAGS.to_be_bytes());
        header[8..12].copy_from_slice(&len.to_be_bytes());

        let checksum = checksum(&header, &payload);
        Ok(Packet {
            header,
            payload,
            checksum,
        })
    }

    /// Serialize to contiguous bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_BYTES + self.payload.len() + CHECKSUM_BYTES);
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.checksum);
        out
    }

    /// Parse and verify one packet at the start of `bytes`, returning it and
    /// the number of bytes consumed.
    pub fn parse(bytes: &[u8]) -> Result<(Packet, usize), WireError> {
        let Some(frame_len) = try_frame_len(bytes, MAX_PAYLOAD)? else {
            return Err(WireError::Incomplete);
        };
        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        if bytes.len() < frame_len {
            return Err(WireError::Incomplete);
        }
        let mut header = [0u8; HEADER_BYTES];
        header.copy_from_slice(&bytes[..HEADER_BYTES]);
        let payload = bytes[HEADER_BYTES..frame_len - CHECKSUM_BYTES].to_vec();
        let mut sum = [0u8; CHECKSUM_BYTES];
        sum.copy_from_slice(&bytes[frame_len - CHECKSUM_BYTES..frame_len]);

        if checksum(&header, &payload) != sum {
            return Err(WireError::ChecksumMismatch);
        }
        Ok((
            Packet {
                header,
                payload,
                checksum: sum,
            },
            frame_len,
        ))
    }
}

fn checksum(header: &[u8], payload: &[u8]) -> [u8; CHECKSUM_BYTES] {
    let mut hasher = Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

/// Encode a broker message into packet bytes.
pub fn encode_message(msg: &BrokerMessage) -> Result<Vec<u8>, WireError> {
    let payload = to_cbor(msg)?;
    Ok(Packet::from_payload(payload)?.to_bytes())
}

/// Decode bytes into `(message, bytes_consumed)`.
pub fn decode_message(bytes: &[u8]) -> Result<(BrokerMessage, usize), WireError> {
    let (packet, used) = Packet::parse(bytes)?;
    Ok((from_cbor(&packet.payload)?, used))
}

/// Total frame length announced by the header in `buf`, or `None` when the
/// header is not complete yet.
pub fn try_frame_len(buf: &[u8], max_payload: usize) -> Result<Option<usize>, WireError> {
    if buf.len() < HEADER_BYTES {
        return Ok(None);
    }
    if buf[..4] != MAGIC {
        return Err(WireError::BadMagic);
    }
    let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    if payload_len > max_payload {
        return Err(WireError::PayloadTooLarge {
            len: payload_len,
            max: max_payload,
        });
    }
    Ok(Some(HEADER_BYTES + payload_len + CHECKSUM_BYTES))
}

/// Drain one complete frame from the front of `acc`, if present.
pub fn try_extract_frame(acc: &mut Vec<u8>, max: usize) -> Result<Option<Vec<u8>>, WireError> {
    let Some(frame_len) = try_frame_len(acc, max)? else {
        return Ok(None);
    };
    if acc.len() < frame_len {
        return Ok(None);
    }
    Ok(Some(acc.drain(..frame_len).collect()))
}

/// Accumulates stream reads and yields whole broker messages.
#[derive(Debug, Default)]
pub struct FrameReader {
    acc: Vec<u8>,
}

impl FrameReader {
    /// Empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.acc.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.acc.len()
    }

    /// Pop the next complete message. `Ok(None)` means more bytes are needed;
    /// an error means the stream is unusable.
    pub fn next_message(&mut self) -> Result<Option<BrokerMessage>, WireError> {
        match try_extract_frame(&mut self.acc, MAX_PAYLOAD)? {
            Some(frame) => decode_message(&frame).map(|(msg, _)| Some(msg)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::{PeerErrorKind, PeerId};

    fn sample() -> BrokerMessage {
        BrokerMessage::Data {
            peer: PeerId::from("domeInteraction"),
            payload: br#"{"orientation":[0,0,0,1],"touching":true}"#.to_vec(),
        }
    }

    #[test]
    fn decodes_what_it_encodes_and_reports_length() {
        let bytes = encode_message(&sample()).unwrap();
        let (msg, used) = decode_message(&bytes).unwrap();
        assert_eq!(msg, sample());
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn corrupted_packets_are_rejected() {
        let mut bytes = encode_message(&sample()).unwrap();

        assert_eq!(
            decode_message(&bytes[..bytes.len() - 1]),
            Err(WireError::Incomplete)
        );

        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert_eq!(decode_message(&bytes), Err(WireError::ChecksumMismatch));
        bytes[last] ^= 0xff;

        bytes[0] = b'X';
        assert_eq!(decode_message(&bytes), Err(WireError::BadMagic));
        bytes[0] = MAGIC[0];

        bytes[5] = 9;
        assert_eq!(decode_message(&bytes), Err(WireError::UnsupportedVersion(9)));
    }

    #[test]
    fn oversized_length_is_refused_before_buffering() {
        let mut header = vec![0u8; HEADER_BYTES];
        header[..4].copy_from_slice(&MAGIC);
        header[8..12].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            try_frame_len(&header, MAX_PAYLOAD),
            Err(WireError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn try_extract_frame_drains_one_frame_and_preserves_remainder() {
        let f1 = encode_message(&sample()).unwrap();
        let f2 = encode_message(&BrokerMessage::Error {
            kind: PeerErrorKind::UnavailableId,
            detail: None,
        })
        .unwrap();
        let mut acc = [f1.clone(), f2.clone()].concat();

        let pkt1 = try_extract_frame(&mut acc, MAX_PAYLOAD).unwrap().expect("pkt1");
        assert_eq!(pkt1, f1);
        assert_eq!(acc, f2);

        let pkt2 = try_extract_frame(&mut acc, MAX_PAYLOAD).unwrap().expect("pkt2");
        assert_eq!(pkt2, f2);
        assert!(acc.is_empty());
    }

    #[test]
    fn frame_reader_handles_split_reads() {
        let bytes = encode_message(&sample()).unwrap();
        let mut reader = FrameReader::new();

        reader.push(&bytes[..5]);
        assert_eq!(reader.next_message(), Ok(None));
        reader.push(&bytes[5..]);
        assert_eq!(reader.next_message(), Ok(Some(sample())));
        assert_eq!(reader.buffered(), 0);
        assert_eq!(reader.next_message(), Ok(None));
    }
}
