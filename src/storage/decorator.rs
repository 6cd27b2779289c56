use crate::{error::StorageError, storage::ClientDriver};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// A driver decorator that normalises TTLs before forwarding to an inner
/// driver.
///
/// A zero TTL is replaced by the default TTL, and TTLs above the maximum are
/// clamped. This keeps records from living forever in backends that treat a
/// zero TTL as "no expiry".
#[derive(Debug)]
pub struct TtlDecorator<D> {
    inner: D,
    default_ttl: Duration,
    max_ttl: Duration,
}

impl<D> TtlDecorator<D> {
    /// Wrap `inner`. `max_ttl` is raised to `default_ttl` if lower.
    pub fn new(inner: D, default_ttl: Duration, max_ttl: Duration) -> Self {
        Self {
            inner,
            default_ttl,
            max_ttl: max_ttl.max(default_ttl),
        }
    }

    /// Get a reference to the inner driver.
    pub const fn inner(&self) -> &D {
        &self.inner
    }

    /// Unwrap the decorator, returning the inner driver.
    pub fn into_inner(self) -> D {
        self.inner
    }

    fn normalize(&self, ttl: Duration) -> Duration {
        if ttl.is_zero() {
            self.default_ttl
        } else {
            ttl.min(self.max_ttl)
        }
    }
}

impl<D: ClientDriver> ClientDriver for TtlDecorator<D> {
    fn fetch(&mut self, key: &str, now: Instant) -> Result<Option<Value>, StorageError> {
        self.inner.fetch(key, now)
    }

    fn save(
        &mut self,
        key: &str,
        value: Value,
        ttl: Duration,
        now: Instant,
    ) -> Result<(), StorageError> {
        let ttl = self.normalize(ttl);
        self.inner.save(key, value, ttl, now)
    }

    fn delete(&mut self, key: &str) -> Result<bool, StorageError> {
        self.inner.delete(key)
    }

    fn touch(&mut self, key: &str, ttl: Duration, now: Instant) -> Result<bool, StorageError> {
        let ttl = self.normalize(ttl);
        self.inner.touch(key, ttl, now)
    }

    fn prune(&mut self, now: Instant) -> usize {
        self.inner.prune(now)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::InMemoryDriver;
    use serde_json::json;

    #[test]
    fn zero_ttl_uses_default_and_large_ttl_is_clamped() {
        let start = Instant::now();
        let mut driver = TtlDecorator::new(
            InMemoryDriver::new(),
            Duration::from_secs(5),
            Duration::from_secs(60),
        );

        driver.save("zero", json!(0), Duration::ZERO, start).unwrap();
        driver
            .save("huge", json!(1), Duration::from_secs(3600), start)
            .unwrap();

        let t = start + Duration::from_secs(4);
        assert_eq!(driver.fetch("zero", t).unwrap(), Some(json!(0)));
        let t = start + Duration::from_secs(6);
        assert_eq!(driver.fetch("zero", t).unwrap(), None);

        let t = start + Duration::from_secs(59);
        assert_eq!(driver.fetch("huge", t).unwrap(), Some(json!(1)));
        let t = start + Duration::from_secs(61);
        assert_eq!(driver.fetch("huge", t).unwrap(), None);
    }

    #[test]
    fn decorators_chain() {
        let start = Instant::now();
        let inner = TtlDecorator::new(
            InMemoryDriver::new(),
            Duration::from_secs(5),
            Duration::from_secs(10),
        );
        let mut outer = TtlDecorator::new(inner, Duration::from_secs(30), Duration::from_secs(30));

        // the outer decorator turns zero into 30s, the inner clamps to 10s
        outer.save("k", json!(1), Duration::ZERO, start).unwrap();
        let t = start + Duration::from_secs(11);
        assert_eq!(outer.fetch("k", t).unwrap(), None);
    }
}
