use crate::{tasks::TaskSet, BrokerHandle};
use tokio_util::{sync::WaitForCancellationFuture, task::task_tracker::TaskTrackerWaitFuture};

/// The shutdown signal for a running broker. When dropped, will cancel all
/// tasks associated with the broker. This includes the event loop, every
/// listener, every connection's route and write tasks, in-flight RPC calls
/// and periodic task runs.
///
/// The shutdown wraps a [`TaskTracker`] and a [`CancellationToken`], and
/// exposes methods from those APIs. Please see the documentation for those
/// types for more information.
///
/// [`TaskTracker`]: tokio_util::task::TaskTracker
/// [`CancellationToken`]: tokio_util::sync::CancellationToken
#[derive(Debug)]
pub struct ServerShutdown {
    pub(crate) task_set: TaskSet,
    pub(crate) broker: BrokerHandle,
}

impl ServerShutdown {
    /// Create a new [`ServerShutdown`] with the given [`TaskSet`].
    pub(crate) const fn new(task_set: TaskSet, broker: BrokerHandle) -> Self {
        Self { task_set, broker }
    }

    /// A handle to the running broker.
    pub fn broker(&self) -> BrokerHandle {
        self.broker.clone()
    }

    /// Wait for the tasks spawned by the broker to complete. This is a
    /// wrapper for [`TaskTracker::wait`].
    ///
    /// This future will not resolve until both of the following are true:
    /// - [`Self::close`] has been called.
    /// - The event loop and listeners have finished running.
    ///
    /// [`TaskTracker::wait`]: tokio_util::task::TaskTracker::wait
    pub fn wait(&self) -> TaskTrackerWaitFuture<'_> {
        self.task_set.wait()
    }

    /// Close the internal [`TaskTracker`], allowing [`Self::wait`] futures to
    /// resolve, provided all tasks are complete.
    ///
    /// This will not cancel running tasks.
    ///
    /// [`TaskTracker`]: tokio_util::task::TaskTracker
    pub fn close(&self) {
        self.task_set.close();
    }

    /// Check if the broker's internal [`TaskTracker`] has been closed. This
    /// does not indicate that all tasks have completed, or that the broker
    /// has been cancelled.
    ///
    /// [`TaskTracker`]: tokio_util::task::TaskTracker
    pub fn is_closed(&self) -> bool {
        self.task_set.is_closed()
    }

    /// Issue a cancellation signal to every task spawned by the broker. The
    /// event loop closes every connection, running unsubscribe hooks and
    /// removing session records, before it exits.
    pub fn cancel(&self) {
        self.task_set.cancel();
    }

    /// Check if the broker has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.task_set.is_cancelled()
    }

    /// Get a future that resolves when the broker has been cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.task_set.cancelled()
    }

    /// Shut the broker down, and wait for its tasks to complete.
    ///
    /// This is equivalent to calling [`Self::cancel`], [`Self::close`] and
    /// then awaiting [`Self::wait`].
    pub async fn shutdown(self) {
        self.cancel();
        self.close();
        self.wait().await;
    }
}

impl Drop for ServerShutdown {
    fn drop(&mut self) {
        self.task_set.cancel();
    }
}
