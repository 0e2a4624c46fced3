use data_encoding::BASE32_NOPAD;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Base32 characters kept from the hash; 16 characters carry 80 bits.
const SUFFIX_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum IdError {
    #[error("system entropy source unavailable: {0}")]
    RandomSource(#[from] rand::Error),
}

/// Produce a message identifier: a decimal microsecond timestamp, a dash,
/// and a base32 digest over the instance name, username, and a random nonce.
///
/// The timestamp prefix makes directory listings sort roughly by arrival;
/// the hashed suffix makes collisions vanishingly unlikely and keeps the
/// username out of the identifier.
///
/// # Errors
///
/// `IdError::RandomSource` when the OS entropy source fails; callers treat
/// this as fatal to the submission at hand.
pub fn generate(instance: &str, username: &str) -> Result<String, IdError> {
    let timestamp = chrono::Utc::now().timestamp_micros();

    let mut nonce = [0; 16];
    OsRng.try_fill_bytes(&mut nonce)?;

    let mut hasher = Sha256::new();
    hasher.update(instance.as_bytes());
    hasher.update(b"-");
    hasher.update(username.as_bytes());
    hasher.update(b"-");
    hasher.update(nonce);

    let hash = BASE32_NOPAD.encode(&hasher.finalize());

    Ok(format!("{timestamp}-{}", &hash[..SUFFIX_LEN]))
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::generate;

    #[test]
    fn format() {
        let id = generate("mx1", "alice").unwrap();
        let (timestamp, suffix) = id.split_once('-').unwrap();

        assert!(timestamp.parse::<i64>().unwrap() > 0);
        assert_eq!(suffix.len(), 16);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn does_not_embed_username() {
        let id = generate("mx1", "alice").unwrap();
        assert!(!id.contains("alice"));
    }

    #[test]
    fn unique_across_many_generations() {
        let mut seen = HashSet::new();

        for _ in 0..10_000 {
            assert!(seen.insert(generate("mx1", "alice").unwrap()));
        }
    }

    #[test]
    fn unique_for_identical_inputs_and_instant() {
        let a = generate("mx1", "alice").unwrap();
        let b = generate("mx1", "alice").unwrap();
        assert_ne!(a, b);
    }
}
