use crate::{
    error::{PeriodicError, RegistrationError},
    periodic::{PeriodicCtx, PeriodicHandler, PeriodicTask},
};
use futures_util::future::BoxFuture;
use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// A liveness check against an external resource, e.g. a database
/// connection kept open by application handlers.
pub trait Probe: Send + Sync + 'static {
    /// Check the resource once.
    fn probe(&self) -> BoxFuture<'static, Result<(), PeriodicError>>;
}

impl<F, Fut> Probe for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PeriodicError>> + Send + 'static,
{
    fn probe(&self) -> BoxFuture<'static, Result<(), PeriodicError>> {
        Box::pin(self())
    }
}

/// A periodic handler that runs a [`Probe`] and tracks consecutive failures.
///
/// Reaching the failure threshold logs an error once per outage. The first
/// success after that logs the recovery.
#[derive(Clone)]
pub struct HealthCheck {
    name: Arc<str>,
    probe: Arc<dyn Probe>,
    threshold: u32,
    failures: Arc<AtomicU32>,
}

impl fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheck")
            .field("name", &self.name)
            .field("threshold", &self.threshold)
            .field("failures", &self.failures())
            .finish_non_exhaustive()
    }
}

impl HealthCheck {
    /// Create a health check. A threshold of zero is treated as one.
    pub fn new(name: impl Into<Arc<str>>, probe: Arc<dyn Probe>, threshold: u32) -> Self {
        Self {
            name: name.into(),
            probe,
            threshold: threshold.max(1),
            failures: Default::default(),
        }
    }

    /// Consecutive failures so far.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// False once the failure threshold has been reached.
    pub fn is_healthy(&self) -> bool {
        self.failures() < self.threshold
    }

    /// Wrap the check in a periodic task named after the probe.
    pub fn into_task(self, interval: Duration) -> Result<PeriodicTask, RegistrationError> {
        PeriodicTask::new(self.name.clone(), interval, self)
    }

    /// Run the probe once and update the failure count.
    pub async fn check(&self) {
        match self.probe.probe().await {
            Ok(()) => {
                let failures = self.failures.swap(0, Ordering::AcqRel);
                if failures >= self.threshold {
                    info!(probe = %self.name, failures, "probe recovered");
                } else if failures > 0 {
                    debug!(probe = %self.name, failures, "probe succeeded after failures");
                }
            }
            Err(err) => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures == self.threshold {
                    error!(probe = %self.name, %err, failures, "probe is unhealthy");
                } else {
                    warn!(probe = %self.name, %err, failures, "probe failed");
                }
            }
        }
    }
}

impl PeriodicHandler for HealthCheck {
    fn run(&self, _ctx: PeriodicCtx) -> BoxFuture<'static, Result<(), PeriodicError>> {
        let this = self.clone();
        Box::pin(async move {
            this.check().await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn switchable(up: Arc<AtomicBool>) -> Arc<dyn Probe> {
        Arc::new(move || {
            let up = up.load(Ordering::SeqCst);
            async move {
                if up {
                    Ok(())
                } else {
                    Err(PeriodicError::new("connection refused"))
                }
            }
        })
    }

    #[tokio::test]
    async fn counts_consecutive_failures() {
        let up = Arc::new(AtomicBool::new(false));
        let check = HealthCheck::new("db", switchable(up.clone()), 3);

        check.check().await;
        check.check().await;
        assert_eq!(check.failures(), 2);
        assert!(check.is_healthy());

        check.check().await;
        assert!(!check.is_healthy());
        check.check().await;
        assert_eq!(check.failures(), 4);

        up.store(true, Ordering::SeqCst);
        check.check().await;
        assert_eq!(check.failures(), 0);
        assert!(check.is_healthy());
    }

    #[test]
    fn zero_threshold_is_one() {
        let check = HealthCheck::new("db", switchable(Default::default()), 0);
        assert_eq!(check.threshold, 1);
        assert_eq!(check.into_task(Duration::from_secs(5)).unwrap().name(), "db");
    }
}
