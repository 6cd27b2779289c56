use crate::{
    config::MAX_DURATION,
    error::{PeriodicError, RegistrationError},
    BrokerHandle,
};
use futures_util::future::BoxFuture;
use std::{fmt, future::Future, sync::Arc, time::Duration};

/// The context of a periodic task run.
#[derive(Debug, Clone)]
pub struct PeriodicCtx {
    pub(crate) name: Arc<str>,
    pub(crate) broker: BrokerHandle,
}

impl PeriodicCtx {
    /// The task's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A handle to the broker, for publishing from the task.
    pub const fn broker(&self) -> &BrokerHandle {
        &self.broker
    }
}

/// Work run on a fixed interval.
///
/// Implemented for async closures taking a [`PeriodicCtx`]:
///
/// ```
/// use wsbroker::{
///     periodic::{PeriodicCtx, PeriodicTask},
///     PeriodicError, PushMessage,
/// };
///
/// let clock = PeriodicTask::from_secs("clock", 1.5, |ctx: PeriodicCtx| async move {
///     let tick = PushMessage::new("/clock", serde_json::json!("tick"));
///     ctx.broker().publish(tick).await?;
///     Ok::<_, PeriodicError>(())
/// })
/// .unwrap();
/// assert_eq!(clock.interval().as_millis(), 1500);
/// ```
pub trait PeriodicHandler: Send + Sync + 'static {
    /// Run the task once.
    fn run(&self, ctx: PeriodicCtx) -> BoxFuture<'static, Result<(), PeriodicError>>;
}

impl<F, Fut> PeriodicHandler for F
where
    F: Fn(PeriodicCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PeriodicError>> + Send + 'static,
{
    fn run(&self, ctx: PeriodicCtx) -> BoxFuture<'static, Result<(), PeriodicError>> {
        Box::pin(self(ctx))
    }
}

/// A named handler with its interval and optional runtime guard.
#[derive(Clone)]
pub struct PeriodicTask {
    pub(crate) name: Arc<str>,
    pub(crate) interval: Duration,
    pub(crate) max_runtime: Option<Duration>,
    pub(crate) handler: Arc<dyn PeriodicHandler>,
}

impl fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("max_runtime", &self.max_runtime)
            .finish_non_exhaustive()
    }
}

impl PeriodicTask {
    /// Create a task. The interval must be non-zero, and at most
    /// [`MAX_DURATION`].
    ///
    /// [`MAX_DURATION`]: crate::config::MAX_DURATION
    pub fn new(
        name: impl Into<Arc<str>>,
        interval: Duration,
        handler: impl PeriodicHandler,
    ) -> Result<Self, RegistrationError> {
        let name = name.into();
        if interval.is_zero() || interval > MAX_DURATION {
            return Err(RegistrationError::InvalidInterval(name.to_string()));
        }
        Ok(Self {
            name,
            interval,
            max_runtime: None,
            handler: Arc::new(handler),
        })
    }

    /// Create a task with an interval in fractional seconds.
    pub fn from_secs(
        name: impl Into<Arc<str>>,
        secs: f64,
        handler: impl PeriodicHandler,
    ) -> Result<Self, RegistrationError> {
        let name = name.into();
        let Ok(interval) = Duration::try_from_secs_f64(secs) else {
            return Err(RegistrationError::InvalidInterval(name.to_string()));
        };
        Self::new(name, interval, handler)
    }

    /// Warn when a run takes longer than `max_runtime`. Overrunning runs are
    /// not cancelled.
    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = Some(max_runtime);
        self
    }

    /// The task's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Time between the start of one run and the next due instant.
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// The runtime guard, if any.
    pub const fn max_runtime(&self) -> Option<Duration> {
        self.max_runtime
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn noop(_: PeriodicCtx) -> Result<(), PeriodicError> {
        Ok(())
    }

    #[test]
    fn intervals_must_be_positive_and_finite() {
        assert!(PeriodicTask::from_secs("ok", 0.25, noop).is_ok());
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e19] {
            assert_eq!(
                PeriodicTask::from_secs("bad", bad, noop).unwrap_err(),
                RegistrationError::InvalidInterval("bad".into())
            );
        }
        assert!(PeriodicTask::new("year", MAX_DURATION, noop).is_ok());
        assert!(PeriodicTask::new("too long", Duration::MAX, noop).is_err());
    }
}
