use crate::error::StorageError;
use serde_json::Value;
use std::{collections::HashMap, time::Duration};
use tokio::time::Instant;

/// A backend for client session records.
///
/// Drivers are owned by the broker event loop and are called synchronously
/// from it, so implementations must not block. Drivers that front an
/// external cache should keep a local connection and fail fast with
/// [`StorageError::Unavailable`] rather than wait on the network.
///
/// The `now` argument is the loop's notion of the current time. Drivers that
/// delegate expiry to an external cache may ignore it, but a driver must never
/// return a record whose TTL has elapsed.
///
/// Drivers compose by wrapping: a decorator holds an inner driver and
/// forwards to it, see [`TtlDecorator`].
///
/// [`TtlDecorator`]: crate::storage::TtlDecorator
pub trait ClientDriver: Send + 'static {
    /// Fetch a live record.
    fn fetch(&mut self, key: &str, now: Instant) -> Result<Option<Value>, StorageError>;

    /// Insert or replace a record, expiring `ttl` after `now`.
    fn save(
        &mut self,
        key: &str,
        value: Value,
        ttl: Duration,
        now: Instant,
    ) -> Result<(), StorageError>;

    /// Delete a record. Returns `true` if a record was present.
    fn delete(&mut self, key: &str) -> Result<bool, StorageError>;

    /// Push back the expiry of a live record. Returns `false` if the record
    /// is absent or already expired.
    fn touch(&mut self, key: &str, ttl: Duration, now: Instant) -> Result<bool, StorageError>;

    /// Evict expired records eagerly, returning how many were dropped.
    /// Drivers that expire lazily or remotely may leave this as a no-op.
    fn prune(&mut self, _now: Instant) -> usize {
        0
    }
}

impl<D> ClientDriver for Box<D>
where
    D: ClientDriver + ?Sized,
{
    fn fetch(&mut self, key: &str, now: Instant) -> Result<Option<Value>, StorageError> {
        (**self).fetch(key, now)
    }

    fn save(
        &mut self,
        key: &str,
        value: Value,
        ttl: Duration,
        now: Instant,
    ) -> Result<(), StorageError> {
        (**self).save(key, value, ttl, now)
    }

    fn delete(&mut self, key: &str) -> Result<bool, StorageError> {
        (**self).delete(key)
    }

    fn touch(&mut self, key: &str, ttl: Duration, now: Instant) -> Result<bool, StorageError> {
        (**self).touch(key, ttl, now)
    }

    fn prune(&mut self, now: Instant) -> usize {
        (**self).prune(now)
    }
}

/// A stored record. `expires_at` is `None` when the TTL reaches past the
/// clock's range, and such a record never expires.
#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// In-process session storage. Expired records are dropped when read, and in
/// bulk by [`ClientDriver::prune`].
#[derive(Debug, Default)]
pub struct InMemoryDriver {
    entries: HashMap<String, Entry>,
}

impl InMemoryDriver {
    /// Create an empty driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, including expired ones not yet pruned.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ClientDriver for InMemoryDriver {
    fn fetch(&mut self, key: &str, now: Instant) -> Result<Option<Value>, StorageError> {
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn save(
        &mut self,
        key: &str,
        value: Value,
        ttl: Duration,
        now: Instant,
    ) -> Result<(), StorageError> {
        self.entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: now.checked_add(ttl),
            },
        );
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.remove(key).is_some())
    }

    fn touch(&mut self, key: &str, ttl: Duration, now: Instant) -> Result<bool, StorageError> {
        match self.entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = now.checked_add(ttl);
                Ok(true)
            }
            Some(_) => {
                self.entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn prune(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before - self.entries.len()
    }
}
