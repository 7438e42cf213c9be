//! Expiring license keys.
//!
//! A key is 48 lowercase hex characters: the expiry in milliseconds since the
//! Unix epoch as 16 hex digits, then the first 32 hex digits of
//! `SHA-256(LICENSE_PROJECT || expiry_hex)`.

use sha2::{Digest, Sha256};

pub const LICENSE_PROJECT: &str = "streamd";

const EXPIRY_HEX_LEN: usize = 16;
const CHECKSUM_HEX_LEN: usize = 32;
pub const LICENSE_KEY_LEN: usize = EXPIRY_HEX_LEN + CHECKSUM_HEX_LEN;

fn checksum(expiry_hex: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(LICENSE_PROJECT.as_bytes());
    hasher.update(expiry_hex.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(CHECKSUM_HEX_LEN);
    digest
}

/// Issue a key expiring at `expiry_ms`.
#[must_use]
pub fn make_key(expiry_ms: i64) -> String {
    let expiry_hex = hex::encode(expiry_ms.to_be_bytes());
    let sum = checksum(&expiry_hex);
    format!("{expiry_hex}{sum}")
}

/// Expiry encoded in `key`, or `None` if the key is malformed or its checksum
/// does not match.
#[must_use]
pub fn expire_time(key: &str) -> Option<i64> {
    if key.len() != LICENSE_KEY_LEN || !key.is_ascii() {
        return None;
    }
    let (expiry_hex, sum) = key.split_at(EXPIRY_HEX_LEN);
    if checksum(&expiry_hex.to_ascii_lowercase()) != sum.to_ascii_lowercase() {
        return None;
    }
    let bytes: [u8; 8] = hex::decode(expiry_hex).ok()?.try_into().ok()?;
    Some(i64::from_be_bytes(bytes))
}

/// Whether `key` decodes and expires after `now_ms`.
#[must_use]
pub fn is_active(key: &str, now_ms: i64) -> bool {
    expire_time(key).is_some_and(|expiry| expiry > now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPIRY: i64 = 1_893_456_000_000;

    #[test]
    fn test_key_shape() {
        let key = make_key(EXPIRY);
        assert_eq!(key.len(), LICENSE_KEY_LEN);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_expire_time_decodes_issued_key() {
        assert_eq!(expire_time(&make_key(EXPIRY)), Some(EXPIRY));
    }

    #[test]
    fn test_uppercase_key_accepted() {
        let key = make_key(EXPIRY).to_ascii_uppercase();
        assert_eq!(expire_time(&key), Some(EXPIRY));
    }

    #[test]
    fn test_tampered_expiry_rejected() {
        let key = make_key(EXPIRY);
        let forged = format!(
            "{}{}",
            &make_key(EXPIRY + 1)[..EXPIRY_HEX_LEN],
            &key[EXPIRY_HEX_LEN..]
        );
        assert_eq!(expire_time(&forged), None);
    }

    #[test]
    fn test_malformed_keys_rejected() {
        assert_eq!(expire_time(""), None);
        assert_eq!(expire_time("deadbeef"), None);
        assert_eq!(expire_time(&"z".repeat(LICENSE_KEY_LEN)), None);
        assert_eq!(expire_time(&"é".repeat(LICENSE_KEY_LEN / 2)), None);
    }

    #[test]
    fn test_is_active() {
        let key = make_key(EXPIRY);
        assert!(is_active(&key, EXPIRY - 1));
        assert!(!is_active(&key, EXPIRY));
        assert!(!is_active("garbage", 0));
    }
}
