//! Client session storage.
//!
//! Every open connection gets a session record, keyed by the configured
//! prefix followed by the connection id, so that a backend shared by several
//! broker instances does not see key collisions between them.
//!
//! The [`ClientStorage`] façade is owned by the broker event loop. It is
//! backed by a [`ClientDriver`], which may be a chain of decorators around a
//! raw driver:
//!
//! ```
//! use std::time::Duration;
//! use wsbroker::storage::{ClientStorage, InMemoryDriver, TtlDecorator};
//!
//! let driver = TtlDecorator::new(
//!     InMemoryDriver::new(),
//!     Duration::from_secs(900),
//!     Duration::from_secs(3600),
//! );
//! let storage = ClientStorage::new(driver, "broker-a:", Duration::from_secs(900));
//! assert_eq!(storage.key(7), "broker-a:7");
//! ```

mod decorator;
pub use decorator::TtlDecorator;

mod driver;
pub use driver::{ClientDriver, InMemoryDriver};

use crate::{error::StorageError, primitives::ConnectionId};
use serde_json::Value;
use std::{fmt, time::Duration};
use tokio::time::Instant;

/// Session storage façade used by the event loop.
pub struct ClientStorage {
    driver: Box<dyn ClientDriver>,
    prefix: String,
    ttl: Duration,
}

impl fmt::Debug for ClientStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStorage")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ClientStorage {
    /// Create a storage façade over `driver`.
    pub fn new(driver: impl ClientDriver, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            driver: Box::new(driver),
            prefix: prefix.into(),
            ttl,
        }
    }

    /// Create a storage façade over an [`InMemoryDriver`].
    pub fn in_memory(prefix: impl Into<String>, ttl: Duration) -> Self {
        Self::new(InMemoryDriver::new(), prefix, ttl)
    }

    /// The session key for a connection.
    pub fn key(&self, id: ConnectionId) -> String {
        format!("{}{}", self.prefix, id)
    }

    /// The configured session TTL.
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a session record with the configured TTL.
    pub fn put(&mut self, id: ConnectionId, value: Value) -> Result<(), StorageError> {
        self.put_with_ttl(id, value, self.ttl)
    }

    /// Store a session record with an explicit TTL.
    pub fn put_with_ttl(
        &mut self,
        id: ConnectionId,
        value: Value,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let key = self.key(id);
        self.driver.save(&key, value, ttl, Instant::now())
    }

    /// Fetch a live session record. Expired records read as `None`.
    pub fn get(&mut self, id: ConnectionId) -> Result<Option<Value>, StorageError> {
        let key = self.key(id);
        self.driver.fetch(&key, Instant::now())
    }

    /// Remove a session record.
    pub fn remove(&mut self, id: ConnectionId) -> Result<bool, StorageError> {
        let key = self.key(id);
        self.driver.delete(&key)
    }

    /// Extend a live session record by the configured TTL.
    pub fn refresh(&mut self, id: ConnectionId) -> Result<bool, StorageError> {
        let key = self.key(id);
        self.driver.touch(&key, self.ttl, Instant::now())
    }

    /// Evict expired records.
    pub fn prune(&mut self) -> usize {
        self.driver.prune(Instant::now())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    /// A driver whose backend is always down.
    struct Unreachable;

    impl ClientDriver for Unreachable {
        fn fetch(&mut self, _: &str, _: Instant) -> Result<Option<Value>, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }

        fn save(&mut self, _: &str, _: Value, _: Duration, _: Instant) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }

        fn delete(&mut self, _: &str) -> Result<bool, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }

        fn touch(&mut self, _: &str, _: Duration, _: Instant) -> Result<bool, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn session_round_trip_and_expiry() {
        let ttl = Duration::from_secs(30);
        let mut storage = ClientStorage::in_memory("test:", ttl);
        storage.put(1, json!({"principal": "alice"})).unwrap();

        tokio::time::advance(ttl - Duration::from_millis(1)).await;
        assert_eq!(storage.get(1).unwrap(), Some(json!({"principal": "alice"})));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(storage.get(1).unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_keeps_active_sessions_alive() {
        let ttl = Duration::from_secs(30);
        let mut storage = ClientStorage::in_memory("", ttl);
        storage.put(2, json!(true)).unwrap();

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(20)).await;
            assert!(storage.refresh(2).unwrap());
        }
        assert_eq!(storage.get(2).unwrap(), Some(json!(true)));

        assert!(storage.remove(2).unwrap());
        assert_eq!(storage.get(2).unwrap(), None);
    }

    #[test]
    fn backend_failures_surface_as_unavailable() {
        let mut storage = ClientStorage::new(Unreachable, "", Duration::from_secs(1));
        assert!(matches!(
            storage.put(1, json!(null)),
            Err(StorageError::Unavailable(_))
        ));
        assert!(storage.get(1).is_err());
        assert_eq!(storage.prune(), 0);
    }
}
