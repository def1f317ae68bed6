//! ULID-based identifiers for forwarded messages.
//!
//! A pending message id is `{origin}:{ulid}`: the origin server's canonical
//! name followed by a 26-character Crockford base32 ULID (48 bits of
//! milliseconds since the epoch, 80 random bits). Ids sort by creation time
//! within one origin and never collide across origins.

use rand::Rng;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Generate a new ULID string.
pub fn generate() -> String {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    encode(now_ms, rand::thread_rng().r#gen())
}

fn encode(now_ms: u64, random: u128) -> String {
    let mut out = String::with_capacity(26);

    // 48-bit timestamp in 10 chars, most significant first
    for i in (0..10).rev() {
        out.push(CROCKFORD[((now_ms >> (i * 5)) & 0x1F) as usize] as char);
    }
    // 80 random bits in 16 chars
    let random = random & ((1u128 << 80) - 1);
    for i in (0..16).rev() {
        out.push(CROCKFORD[((random >> (i * 5)) & 0x1F) as usize] as char);
    }
    out
}

/// Message id for a message forwarded by `origin`.
pub fn pending_id(origin: &str) -> String {
    format!("{origin}:{}", generate())
}

/// The origin portion of a pending message id, if it has one.
pub fn origin_of(message_id: &str) -> Option<&str> {
    message_id.rsplit_once(':').map(|(origin, _)| origin).filter(|o| !o.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulid_length_and_uniqueness() {
        let a = generate();
        let b = generate();
        assert_eq!(a.len(), 26);
        assert_ne!(a, b);
    }

    #[test]
    fn ulid_is_ascii_crockford() {
        for c in generate().chars() {
            assert!(
                c.is_ascii_digit() || (c.is_ascii_uppercase() && !"ILOU".contains(c)),
                "Invalid Crockford char: {c}"
            );
        }
    }

    #[test]
    fn encoding_is_time_ordered() {
        let a = encode(1_700_000_000_000, u128::MAX);
        let b = encode(1_700_000_000_001, 0);
        assert!(a < b, "{a} should sort before {b}");
        assert_eq!(encode(0, 0), "0".repeat(26));
    }

    #[test]
    fn pending_id_carries_origin() {
        let id = pending_id("alpha@10.0.0.2");
        assert!(id.starts_with("alpha@10.0.0.2:"));
        assert_eq!(origin_of(&id), Some("alpha@10.0.0.2"));
        assert_eq!(origin_of("no-separator"), None);
    }
}
