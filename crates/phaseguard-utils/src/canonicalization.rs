use blake3::Hasher;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::CanonicalError;

/// Identifier recorded beside every hash so readers know how it was produced.
pub const CANONICALIZATION_BACKEND: &str = "jcs-rfc8785";

/// Emit a value as JCS-canonical JSON (RFC 8785).
///
/// This is the standard way to emit JSON for session state, envelopes, audit
/// records and anything that gets hashed. JCS gives deterministic output
/// regardless of field ordering in the source struct.
///
/// ```rust
/// use phaseguard_utils::canonicalization::emit_jcs;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Out { z: u8, a: u8 }
///
/// assert_eq!(emit_jcs(&Out { z: 1, a: 2 }).unwrap(), r#"{"a":2,"z":1}"#);
/// ```
pub fn emit_jcs<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let bytes = jcs_bytes(value)?;
    String::from_utf8(bytes).map_err(|_| CanonicalError::InvalidUtf8)
}

/// Canonical JCS bytes for a value.
pub fn jcs_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    let json_value = serde_json::to_value(value)?;
    serde_json_canonicalizer::to_vec(&json_value)
        .map_err(|e| CanonicalError::Canonicalize(e.to_string()))
}

/// Lowercase hex BLAKE3 digest of raw bytes.
#[must_use]
pub fn blake3_hex(bytes: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize().to_hex().to_string()
}

/// BLAKE3 digest of the JCS form of a value.
pub fn hash_jcs<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    Ok(blake3_hex(&jcs_bytes(value)?))
}

/// Lowercase hex SHA-256 of raw bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// SHA-256 of the JCS form of a value.
pub fn sha256_jcs<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    Ok(sha256_hex(&jcs_bytes(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_change_hash() {
        let a = json!({"b": 1, "a": [1, 2, {"y": true, "x": null}]});
        let b = json!({"a": [1, 2, {"x": null, "y": true}], "b": 1});
        assert_eq!(emit_jcs(&a).unwrap(), emit_jcs(&b).unwrap());
        assert_eq!(hash_jcs(&a).unwrap(), hash_jcs(&b).unwrap());
        assert_eq!(sha256_jcs(&a).unwrap(), sha256_jcs(&b).unwrap());
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_blake3_is_64_hex_chars() {
        let h = blake3_hex(b"phaseguard");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_numbers_are_canonical() {
        assert_eq!(emit_jcs(&json!({"n": 1.0})).unwrap(), r#"{"n":1}"#);
    }
}
