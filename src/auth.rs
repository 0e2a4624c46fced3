use std::{
    collections::HashMap,
    path::Path,
    sync::{PoisonError, RwLock},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("reading credentials file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid credentials format at line {line}: {reason}")]
    Format { line: usize, reason: String },
}

/// Username to secret mapping, loaded wholesale from a credentials file and
/// read concurrently by every session.
#[derive(Debug, Default)]
pub struct CredentialStore {
    entries: RwLock<HashMap<String, String>>,
}

impl CredentialStore {
    /// Replace the mapping with the contents of `path`.
    ///
    /// The whole file is parsed before anything is swapped in, so a
    /// malformed entry leaves the previously loaded mapping untouched.
    /// Returns the number of entries loaded.
    ///
    /// # Errors
    ///
    /// `AuthError::Io` if the file cannot be read, `AuthError::Format` on a
    /// malformed line.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<usize, AuthError> {
        let raw = std::fs::read_to_string(path)?;
        let parsed = Self::parse(&raw)?;
        let count = parsed.len();

        *self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner) = parsed;

        Ok(count)
    }

    /// Parse `username:secret` lines. Blank lines and `#` comments are
    /// skipped; on duplicate usernames the last entry wins.
    fn parse(raw: &str) -> Result<HashMap<String, String>, AuthError> {
        let mut entries = HashMap::new();

        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = line.split(':').collect();
            if parts.len() != 2 {
                return Err(AuthError::Format {
                    line: idx + 1,
                    reason: "expected username:secret".to_string(),
                });
            }

            let username = parts[0].trim();
            let secret = parts[1].trim();

            if username.is_empty() || secret.is_empty() {
                return Err(AuthError::Format {
                    line: idx + 1,
                    reason: "username and secret cannot be empty".to_string(),
                });
            }

            entries.insert(username.to_string(), secret.to_string());
        }

        Ok(entries)
    }

    /// True iff the store currently holds exactly this pair. Unknown
    /// usernames and wrong secrets are observably identical: both compare
    /// the full candidate against a reference without short-circuiting.
    pub fn authenticate(&self, username: &str, secret: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);

        let stored = entries.get(username);
        let reference = stored.map_or("", String::as_str);

        stored.is_some() && secrets_match(reference.as_bytes(), secret.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn secrets_match(stored: &[u8], candidate: &[u8]) -> bool {
    stored.len() == candidate.len()
        && stored
            .iter()
            .zip(candidate.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
