//! Idempotency key validation, normalization, and generation.
//!
//! Keys are opaque client-chosen strings of 1–255 bytes drawn from
//! `[A-Za-z0-9_.-]`. Keys that look like a canonical UUID (`8-4-4-4-12`)
//! must additionally parse as one and are normalized to lower-case, so the
//! upper- and lower-cased spellings of the same UUID identify the same
//! operation.

use crate::{Error, Result};
use uuid::Uuid;

/// Maximum accepted key length in bytes.
pub const MAX_KEY_LEN: usize = 255;

/// Returns true iff the byte is allowed in an idempotency key.
fn is_key_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-'
}

/// Returns true iff the string has the canonical `8-4-4-4-12` UUID shape
/// (hyphen positions only; the hex check happens in [`validate`]).
fn is_uuid_shaped(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 36 && b[8] == b'-' && b[13] == b'-' && b[18] == b'-' && b[23] == b'-'
}

/// Normalizes a key: trims surrounding whitespace and lower-cases keys in
/// canonical UUID form.
///
/// Idempotent: `normalize(normalize(x)) == normalize(x)`.
///
/// # Example
///
/// ```rust
/// use axum_idem::key;
///
/// let k = key::normalize("  550E8400-E29B-41D4-A716-446655440000 ");
/// assert_eq!(k, "550e8400-e29b-41d4-a716-446655440000");
/// ```
pub fn normalize(key: &str) -> String {
    let trimmed = key.trim();
    if is_uuid_shaped(trimmed) && Uuid::parse_str(trimmed).is_ok() {
        trimmed.to_ascii_lowercase()
    } else {
        trimmed.to_string()
    }
}

/// Validates a key, applying [`normalize`] first so that
/// `validate(normalize(x))` and `validate(x)` always agree.
///
/// Fails with an `InvalidKey` error when the normalized key is empty, longer
/// than [`MAX_KEY_LEN`] bytes, contains a character outside `[A-Za-z0-9_.-]`,
/// or is UUID-shaped but not a well-formed UUID.
pub fn validate(key: &str) -> Result<()> {
    let key = key.trim();

    if key.is_empty() {
        return Err(Error::invalid_key("idempotency key is empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::invalid_key(format!(
            "idempotency key exceeds {MAX_KEY_LEN} bytes ({} bytes)",
            key.len()
        )));
    }
    if let Some(bad) = key.bytes().find(|b| !is_key_byte(*b)) {
        return Err(Error::invalid_key(format!(
            "idempotency key contains disallowed byte 0x{bad:02x}"
        )));
    }
    if is_uuid_shaped(key) && Uuid::parse_str(key).is_err() {
        return Err(Error::invalid_key(
            "idempotency key is UUID-shaped but not a well-formed UUID",
        ));
    }
    Ok(())
}

/// Generates a fresh idempotency key: a random UUID in canonical lower-case
/// hyphenated form.
pub fn generate() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use proptest::prelude::*;

    #[test]
    fn test_validate_plain_key() {
        assert!(validate("order-2024_07.001").is_ok());
        assert!(validate("a").is_ok());
    }

    #[test]
    fn test_validate_empty() {
        let err = validate("").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidKey);
    }

    #[test]
    fn test_validate_whitespace_only() {
        assert!(validate("   ").is_err());
    }

    #[test]
    fn test_validate_length_boundaries() {
        assert!(validate(&"k".repeat(255)).is_ok());
        assert!(validate(&"k".repeat(256)).is_err());
    }

    #[test]
    fn test_validate_disallowed_characters() {
        assert!(validate("has space").is_err());
        assert!(validate("has/slash").is_err());
        assert!(validate("has:colon").is_err());
        assert!(validate("héllo").is_err());
    }

    #[test]
    fn test_validate_uuid_cased_variants() {
        assert!(validate("550E8400-E29B-41D4-A716-446655440000").is_ok());
        assert!(validate("550e8400-e29b-41d4-a716-446655440000").is_ok());
    }

    #[test]
    fn test_validate_uuid_shaped_but_malformed() {
        // Right hyphen positions, but 'z' is not hex.
        let err = validate("zzzzzzzz-zzzz-zzzz-zzzz-zzzzzzzzzzzz").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidKey);
    }

    #[test]
    fn test_normalize_trims_and_lowercases_uuids() {
        assert_eq!(
            normalize(" 550E8400-E29B-41D4-A716-446655440000 "),
            "550e8400-e29b-41d4-a716-446655440000"
        );
    }

    #[test]
    fn test_normalize_leaves_plain_keys_alone() {
        assert_eq!(normalize("My-Key-001"), "My-Key-001");
    }

    #[test]
    fn test_generate_is_valid_and_canonical() {
        let key = generate();
        assert!(validate(&key).is_ok());
        assert_eq!(key, normalize(&key));
        assert_eq!(key.len(), 36);
    }

    proptest! {
        /// normalize is idempotent over arbitrary input.
        #[test]
        fn normalize_idempotent(s in ".{0,64}") {
            let once = normalize(&s);
            prop_assert_eq!(normalize(&once), once);
        }

        /// validate agrees before and after normalization.
        #[test]
        fn validate_stable_under_normalize(s in ".{0,64}") {
            prop_assert_eq!(validate(&normalize(&s)).is_ok(), validate(&s).is_ok());
        }

        /// Keys drawn from the allowed alphabet always validate.
        #[test]
        fn allowed_alphabet_validates(s in "[A-Za-z0-9_.-]{1,255}") {
            // 36-char strings may accidentally be UUID-shaped with non-hex
            // characters, which is the one rejection inside the alphabet.
            if validate(&s).is_err() {
                prop_assert!(super::is_uuid_shaped(&s));
            }
        }

        /// Generated keys round-trip validation.
        #[test]
        fn generated_keys_validate(_n in 0u8..8) {
            prop_assert!(validate(&generate()).is_ok());
        }
    }
}
