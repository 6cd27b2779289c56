//! Periodic tasks.
//!
//! Tasks are registered on the broker builder and driven by the event loop
//! tick. Each due task is spawned onto the broker's task set, so a slow run
//! never stalls message routing, and runs of the same task never overlap.
//! Errors and panics are logged and the task stays scheduled.
//!
//! Three kinds of task are built in: the keepalive ping, which pings every
//! open connection, the stats reporter, which logs and exports live
//! connection and topic counts, and [`HealthCheck`], which probes an
//! external resource.

mod health;
pub use health::{HealthCheck, Probe};

mod scheduler;
pub(crate) use scheduler::Scheduler;

mod task;
pub use task::{PeriodicCtx, PeriodicHandler, PeriodicTask};

use crate::error::{PeriodicError, RegistrationError};
use std::time::Duration;

/// Name of the built-in keepalive task.
pub const KEEPALIVE_TASK: &str = "keepalive";

/// The built-in task that sends a WebSocket ping to every open connection.
pub(crate) fn keepalive(interval: Duration) -> Result<PeriodicTask, RegistrationError> {
    PeriodicTask::new(KEEPALIVE_TASK, interval, |ctx: PeriodicCtx| async move {
        ctx.broker().ping_all().await.map_err(PeriodicError::from)
    })
}

/// Name of the built-in stats reporter.
pub const STATS_TASK: &str = "stats";

/// The built-in task that reports the broker's live counts, as an `info`
/// event and as gauges.
pub(crate) fn stats_report(interval: Duration) -> Result<PeriodicTask, RegistrationError> {
    PeriodicTask::new(STATS_TASK, interval, |ctx: PeriodicCtx| async move {
        let stats = ctx.broker().stats().await?;
        crate::metrics::record_stats(&stats);
        tracing::info!(
            connections = stats.connections,
            topics = stats.topics,
            "broker stats"
        );
        Ok::<_, PeriodicError>(())
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Broker, BrokerConfig, BrokerHandle};
    use std::sync::Arc;

    fn ctx(broker: BrokerHandle) -> PeriodicCtx {
        PeriodicCtx {
            name: Arc::from(STATS_TASK),
            broker,
        }
    }

    #[tokio::test]
    async fn stats_report_queries_the_loop() {
        let task = stats_report(Duration::from_secs(1)).unwrap();
        assert_eq!(task.name(), STATS_TASK);

        let shutdown = Broker::builder(BrokerConfig::default()).build().unwrap().start();
        task.handler.run(ctx(shutdown.broker())).await.unwrap();

        // a stopped broker fails the run, and the scheduler logs it
        assert!(task.handler.run(ctx(BrokerHandle::detached())).await.is_err());
    }
}
