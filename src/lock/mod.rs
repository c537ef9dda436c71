//! Session-scoped advisory locking.
//!
//! The database arbitrates exclusion between sessions. [`AdvisoryLock`] only
//! mirrors whether *this* session holds its lock, to reject re-entrant
//! acquires and to make release idempotent.

mod key;

pub use key::LockKey;

use std::time::Duration;

use tracing::{debug, warn};

use crate::interfaces::{Result, StoreConnection, StoreError};

/// Local view of the advisory lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    /// An acquire was started and never returned.
    ///
    /// The request may still be granted to the connection, so the server
    /// side state is unknown. Only discarding the connection resolves it.
    Acquiring,
    Locked,
}

/// Advisory lock guarding schema changes in one `(database, schema)` pair.
///
/// The lock is shared by every session on the same database and schema,
/// whatever table they provision. It operates through the caller's
/// connection and never owns one.
#[derive(Debug)]
pub struct AdvisoryLock {
    key: LockKey,
    state: LockState,
}

impl AdvisoryLock {
    /// Create an unlocked manager for the given namespace.
    pub fn new(database: &str, schema: &str) -> Self {
        Self::with_key(LockKey::derive(database, schema))
    }

    /// Create an unlocked manager for a precomputed key.
    pub fn with_key(key: LockKey) -> Self {
        Self {
            key,
            state: LockState::Unlocked,
        }
    }

    pub fn key(&self) -> LockKey {
        self.key
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        self.state == LockState::Locked
    }

    /// Block until the lock is granted.
    ///
    /// Fails with [`StoreError::AlreadyLocked`] without touching the database
    /// when this manager already holds the lock.
    ///
    /// If the future is dropped before the server answers, the request stays
    /// queued on the connection and may be granted later. The manager is left
    /// in [`LockState::Acquiring`] and refuses further calls; drop the
    /// connection, which frees whatever the session ended up holding.
    pub async fn acquire<C: StoreConnection>(&mut self, conn: &mut C) -> Result<()> {
        self.acquire_timeout(conn, None).await
    }

    /// Like [`acquire`](Self::acquire), giving up after `timeout`.
    ///
    /// The server enforces the bound, so on [`StoreError::LockTimeout`] the
    /// request is withdrawn and the connection stays usable.
    pub async fn acquire_timeout<C: StoreConnection>(
        &mut self,
        conn: &mut C,
        timeout: Option<Duration>,
    ) -> Result<()> {
        match self.state {
            LockState::Locked => return Err(StoreError::AlreadyLocked { key: self.key }),
            LockState::Acquiring => return Err(StoreError::AcquireAbandoned { key: self.key }),
            LockState::Unlocked => {}
        }

        debug!(key = %self.key, ?timeout, "Acquiring advisory lock");

        self.state = LockState::Acquiring;
        let outcome = conn.advisory_lock(self.key, timeout).await;
        self.state = LockState::Unlocked;

        let granted = outcome.map_err(|source| StoreError::LockAcquire {
            key: self.key,
            source,
        })?;

        if !granted {
            return Err(StoreError::LockTimeout {
                key: self.key,
                timeout: timeout.unwrap_or_default(),
            });
        }

        self.state = LockState::Locked;
        debug!(key = %self.key, "Advisory lock acquired");
        Ok(())
    }

    /// Release the lock if held.
    ///
    /// A no-op when unlocked. When the unlock call fails the state stays
    /// [`LockState::Locked`]: the lock may still be held server side. After an
    /// abandoned acquire fails with [`StoreError::AcquireAbandoned`].
    pub async fn release<C: StoreConnection>(&mut self, conn: &mut C) -> Result<()> {
        match self.state {
            LockState::Unlocked => return Ok(()),
            LockState::Acquiring => return Err(StoreError::AcquireAbandoned { key: self.key }),
            LockState::Locked => {}
        }

        let held = conn
            .advisory_unlock(self.key)
            .await
            .map_err(|source| StoreError::LockRelease {
                key: self.key,
                source,
            })?;

        if held {
            debug!(key = %self.key, "Advisory lock released");
        } else {
            warn!(key = %self.key, "Advisory lock was not held by this session at release");
        }

        self.state = LockState::Unlocked;
        Ok(())
    }
}
