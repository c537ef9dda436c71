//! Advisory-lock identity derived from the database namespace.
//!
//! The key is SHA-256 over
//! `"outbox-store:advisory-lock" NUL database NUL schema`, truncated to the
//! first eight digest bytes read big-endian as a signed 64-bit integer, the
//! width of a PostgreSQL advisory-lock key. NUL cannot appear in PostgreSQL
//! identifiers, so distinct `(database, schema)` pairs always hash distinct
//! inputs. Any other implementation that follows these steps contends for the
//! same lock.

use std::fmt;

use sha2::{Digest, Sha256};

const KEY_NAMESPACE: &[u8] = b"outbox-store:advisory-lock";

/// Resource key of a session-scoped advisory lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey(i64);

impl LockKey {
    /// Derive the key guarding schema changes in `schema` of `database`.
    ///
    /// Both names are expected to be non-empty; sessions reject blank names
    /// before a key is ever derived.
    pub fn derive(database: &str, schema: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_NAMESPACE);
        hasher.update([0u8]);
        hasher.update(database.as_bytes());
        hasher.update([0u8]);
        hasher.update(schema.as_bytes());
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        LockKey(i64::from_be_bytes(prefix))
    }

    /// The value bound into the advisory-lock calls.
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
