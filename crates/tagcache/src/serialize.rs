//! Uniform value encoding for raw commands and Lua `ARGV`
//!
//! Values are encoded as JSON bytes. JSON integers and floats are emitted
//! as their raw decimal text, so a stored counter is directly usable by
//! Redis's native `INCRBY`/`DECRBY`. NaN and the infinities are rejected.
//!
//! Lua `ARGV` bypasses any driver-side encoding, so [`serialize_for_lua`]
//! must return a finished byte string on every path; it is also where the
//! optional gzip compression is applied. Compressed payloads are detected
//! on read by the gzip magic bytes, so [`deserialize`] handles both forms.

use crate::{CacheError, CacheResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{de::DeserializeOwned, Serialize};
use std::io::{Read, Write};

/// Leading bytes of a gzip stream.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Encode a value for storage through a raw Redis command.
pub fn serialize<T: Serialize>(value: &T) -> CacheResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| CacheError::SerializationFailure(e.to_string()))
}

/// Decode a value previously written by [`serialize`] or
/// [`serialize_for_lua`].
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> CacheResult<T> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut decoder = GzDecoder::new(bytes);
        let mut plain = Vec::new();
        decoder
            .read_to_end(&mut plain)
            .map_err(|e| CacheError::SerializationFailure(format!("gzip decode: {}", e)))?;
        return serde_json::from_slice(&plain)
            .map_err(|e| CacheError::SerializationFailure(e.to_string()));
    }
    serde_json::from_slice(bytes).map_err(|e| CacheError::SerializationFailure(e.to_string()))
}

/// Encode a value destined for a Lua script's `ARGV`.
///
/// Compression only happens here: raw-command writes stay uncompressed so
/// `INCRBY` keeps working on counters, while bulk tagged writes (which all
/// travel through Lua) benefit from smaller payloads.
pub fn serialize_for_lua<T: Serialize>(
    value: &T,
    compression: bool,
    threshold: usize,
) -> CacheResult<Vec<u8>> {
    let plain = serialize(value)?;
    if !compression || plain.len() < threshold {
        return Ok(plain);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&plain)
        .and_then(|_| encoder.finish())
        .map_err(|e| CacheError::SerializationFailure(format!("gzip encode: {}", e)))
}

/// True when the bytes hold a bare JSON number, i.e. a value that Redis
/// `INCRBY`/`DECRBY` can operate on directly.
pub fn is_numeric(bytes: &[u8]) -> bool {
    match std::str::from_utf8(bytes) {
        Ok(text) => {
            let text = text.trim();
            !text.is_empty() && text.parse::<f64>().map(f64::is_finite).unwrap_or(false)
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let bytes = serialize(&"hello".to_string()).unwrap();
        assert_eq!(bytes, b"\"hello\"");
        let back: String = deserialize(&bytes).unwrap();
        assert_eq!(back, "hello");
    }

    #[test]
    fn test_integers_encode_raw() {
        // Counters must be stored as the bare decimal so INCRBY applies.
        assert_eq!(serialize(&0i64).unwrap(), b"0");
        assert_eq!(serialize(&42i64).unwrap(), b"42");
        assert_eq!(serialize(&-7i64).unwrap(), b"-7");
        assert!(is_numeric(b"42"));
        assert!(is_numeric(b"3.25"));
        assert!(!is_numeric(b"\"42\""));
    }

    #[test]
    fn test_non_finite_floats_rejected() {
        assert!(serialize(&f64::NAN).is_err());
        assert!(serialize(&f64::INFINITY).is_err());
        assert!(!is_numeric(b"inf"));
    }

    #[test]
    fn test_lua_path_without_compression_matches_serialize() {
        let value = vec![1u32, 2, 3];
        assert_eq!(
            serialize_for_lua(&value, false, 0).unwrap(),
            serialize(&value).unwrap()
        );
    }

    #[test]
    fn test_lua_path_compresses_above_threshold() {
        let value = "x".repeat(4096);
        let encoded = serialize_for_lua(&value, true, 1024).unwrap();
        assert!(encoded.starts_with(&GZIP_MAGIC));
        assert!(encoded.len() < 4096);
        let back: String = deserialize(&encoded).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_small_values_stay_plain_under_compression() {
        let encoded = serialize_for_lua(&"tiny", true, 1024).unwrap();
        assert_eq!(encoded, b"\"tiny\"");
    }
}
