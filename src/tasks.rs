use std::future::Future;

use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::{
    sync::{CancellationToken, WaitForCancellationFuture},
    task::{task_tracker::TaskTrackerWaitFuture, TaskTracker},
};

/// This is a wrapper around a [`TaskTracker`] and a [`CancellationToken`]. It
/// is used to manage a set of tasks, and to signal them to shut down.
///
/// The broker owns a root set. Every connection gets a child set, and every
/// connection's in-flight RPC calls get a grandchild set, so cancelling a
/// parent cancels everything spawned beneath it.
///
/// When a [`Handle`] is provided, tasks are spawned on that handle. Otherwise,
/// they are spawned on the current runtime.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskSet {
    tasks: TaskTracker,
    token: CancellationToken,
    handle: Option<Handle>,
}

impl From<Handle> for TaskSet {
    fn from(handle: Handle) -> Self {
        Self::with_handle(handle)
    }
}

impl TaskSet {
    /// Create a new [`TaskSet`] with a handle.
    pub(crate) fn with_handle(handle: Handle) -> Self {
        Self {
            tasks: TaskTracker::new(),
            token: CancellationToken::new(),
            handle: Some(handle),
        }
    }

    /// Get a handle to the runtime that the task set is running on.
    ///
    /// ## Panics
    ///
    /// This will panic if called outside the context of a Tokio runtime.
    pub(crate) fn handle(&self) -> Handle {
        self.handle
            .clone()
            .unwrap_or_else(tokio::runtime::Handle::current)
    }

    /// Cancel the token, causing all tasks to be cancelled.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// True if the token has been cancelled.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Get a future that resolves when the token is fired.
    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Close the tracker, allowing [`Self::wait`] to resolve once all tasks
    /// have finished.
    pub(crate) fn close(&self) {
        self.tasks.close();
    }

    /// True if the tracker has been closed.
    pub(crate) fn is_closed(&self) -> bool {
        self.tasks.is_closed()
    }

    /// Wait for all tasks to finish. Resolves only after [`Self::close`].
    pub(crate) fn wait(&self) -> TaskTrackerWaitFuture<'_> {
        self.tasks.wait()
    }

    /// Get a child [`TaskSet`]. This set will be fired when the parent
    /// set is fired, or may be fired independently.
    pub(crate) fn child(&self) -> Self {
        Self {
            tasks: TaskTracker::new(),
            token: self.token.child_token(),
            handle: self.handle.clone(),
        }
    }

    /// Prepare a future to be added to the task set, by wrapping it with a
    /// cancellation token.
    fn prep_fut<F>(&self, task: F) -> impl Future<Output = Option<F::Output>> + Send + 'static
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let token = self.token.clone();
        async move {
            tokio::select! {
                _ = token.cancelled() => None,
                result = task => Some(result),
            }
        }
    }

    /// Spawn a future on the provided handle, and add it to the task set. The
    /// future is dropped when the set is cancelled.
    ///
    /// ## Panics
    ///
    /// This will panic if called outside the context of a Tokio runtime when
    /// `self.handle` is `None`.
    pub(crate) fn spawn<F>(&self, task: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn_on(self.prep_fut(task), &self.handle())
    }

    /// Spawn a future that is given the cancellation token instead of being
    /// dropped on cancellation. The future is responsible for observing the
    /// token and running its own cleanup.
    ///
    /// ## Panics
    ///
    /// This will panic if called outside the context of a Tokio runtime when
    /// `self.handle` is `None`.
    pub(crate) fn spawn_graceful<F, Fut>(&self, task: F) -> JoinHandle<Fut::Output>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.tasks
            .spawn_on(task(self.token.clone()), &self.handle())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancelling_a_parent_cancels_children() {
        let root = TaskSet::default();
        let child = root.child();
        let grandchild = child.child();

        let handle = grandchild.spawn(std::future::pending::<()>());
        root.cancel();

        assert!(child.is_cancelled());
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancelling_a_child_leaves_the_parent_running() {
        let root = TaskSet::default();
        let child = root.child();
        child.cancel();

        assert!(!root.is_cancelled());
        let handle = root.spawn(async { 3 });
        assert_eq!(handle.await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn graceful_tasks_run_their_cleanup() {
        let set = TaskSet::default();
        let handle = set.spawn_graceful(|token| async move {
            token.cancelled().await;
            "cleaned up"
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        set.cancel();
        set.close();
        set.wait().await;
        assert_eq!(handle.await.unwrap(), "cleaned up");
    }
}
