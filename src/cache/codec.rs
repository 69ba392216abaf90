//! Envelope codec for byte-addressed cache backends.
//!
//! Layout: `MAGIC (4 bytes) | VERSION (u16, big endian) | JSON payload`.
//! A magic or version mismatch is reported as [`CacheError::Decode`] so that
//! stale entries written by an older build are never mistaken for misses.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

use super::error::CacheError;

pub const MAGIC: [u8; 4] = *b"TRLS";
pub const VERSION: u16 = 1;
const HEADER_LEN: usize = MAGIC.len() + 2;

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, CacheError> {
    let payload = serde_json::to_vec(value).map_err(|err| CacheError::Encode(err.to_string()))?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&MAGIC);
    buf.put_u16(VERSION);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheError> {
    if bytes.len() < HEADER_LEN {
        return Err(CacheError::Decode(format!(
            "entry of {} bytes is shorter than the envelope header",
            bytes.len()
        )));
    }
    if bytes[..MAGIC.len()] != MAGIC {
        return Err(CacheError::Decode("envelope magic mismatch".to_string()));
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(CacheError::Decode(format!(
            "envelope version {version} is not supported (expected {VERSION})"
        )));
    }
    serde_json::from_slice(&bytes[HEADER_LEN..]).map_err(|err| CacheError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Sample {
        name: String,
        tags: Vec<String>,
        score: Option<i64>,
    }

    #[test]
    fn encoded_entries_carry_the_envelope_header() {
        let bytes = encode(&42_u32).expect("encode");
        assert_eq!(&bytes[..4], b"TRLS");
        assert_eq!(u16::from_be_bytes([bytes[4], bytes[5]]), VERSION);
        assert_eq!(&bytes[6..], b"42");
    }

    #[test]
    fn structured_values_survive_encoding() {
        let value = Sample {
            name: "u1".into(),
            tags: vec!["a".into()],
            score: None,
        };
        let bytes = encode(&value).expect("encode");
        assert_eq!(decode::<Sample>(&bytes).expect("decode"), value);
    }

    #[test]
    fn foreign_bytes_are_a_decode_error() {
        let err = decode::<u32>(b"CKIT\x00\x00\x00\x01").unwrap_err();
        assert!(matches!(err, CacheError::Decode(_)));
    }

    #[test]
    fn version_mismatch_is_a_decode_error() {
        let mut bytes = encode(&1_u8).expect("encode").to_vec();
        bytes[5] = 9;
        let err = decode::<u8>(&bytes).unwrap_err();
        assert!(matches!(err, CacheError::Decode(message) if message.contains("version 9")));
    }

    #[test]
    fn truncated_entries_are_a_decode_error() {
        assert!(matches!(decode::<u8>(b"TR"), Err(CacheError::Decode(_))));
    }
}
