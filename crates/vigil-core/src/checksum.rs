//! Envelope integrity checksum.
//!
//! The checksum is a 32-bit FNV-1a hash over the envelope identity fields
//! `{type, id, timestamp, payload}`, rendered as an 8-digit lowercase hex
//! string. The payload contribution is its canonical JSON serialization
//! (object keys sorted), so that sender and receiver hash the same bytes
//! regardless of struct field order.

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over a byte slice.
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Compute the envelope checksum over the identity fields.
///
/// `payload_json` must be the canonical (key-sorted) JSON serialization of
/// the payload; [`crate::envelope::Envelope`] produces it via
/// `serde_json::Value`, whose object representation sorts keys.
#[must_use]
pub fn envelope_checksum(message_type: &str, id: &str, timestamp: u64, payload_json: &str) -> String {
    let canonical = format!("{message_type}:{id}:{timestamp}:{payload_json}");
    let hash = fnv1a(canonical.as_bytes());
    hex::encode(hash.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_vectors() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_checksum_is_hex8() {
        let sum = envelope_checksum("heartbeat", "id-1", 12345, "{}");
        assert_eq!(sum.len(), 8);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_checksum_deterministic() {
        let a = envelope_checksum("transcript", "abc", 99, r#"{"text":"hi"}"#);
        let b = envelope_checksum("transcript", "abc", 99, r#"{"text":"hi"}"#);
        assert_eq!(a, b);
    }

    #[test]
    fn test_checksum_sensitive_to_every_field() {
        let base = envelope_checksum("transcript", "abc", 99, "{}");
        assert_ne!(base, envelope_checksum("ack", "abc", 99, "{}"));
        assert_ne!(base, envelope_checksum("transcript", "abd", 99, "{}"));
        assert_ne!(base, envelope_checksum("transcript", "abc", 100, "{}"));
        assert_ne!(base, envelope_checksum("transcript", "abc", 99, "[]"));
    }
}
