use crate::{
    periodic::{PeriodicCtx, PeriodicTask},
    tasks::TaskSet,
    BrokerHandle,
};
use futures_util::FutureExt;
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::time::Instant;
use tracing::{debug, debug_span, error, warn, Instrument};

/// Clears a task's running flag when its run ends, however it ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
struct Slot {
    task: PeriodicTask,
    /// `None` once the next run falls past the clock's range.
    next_due: Option<Instant>,
    running: Arc<AtomicBool>,
}

/// Cooperative scheduler for periodic tasks, driven by the event loop tick.
///
/// The scheduler never runs handlers itself. On each tick, due tasks are
/// spawned and rescheduled one interval from the tick. A task whose previous
/// run has not finished is skipped for that interval.
#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    slots: Vec<Slot>,
}

impl Scheduler {
    /// Schedule every task for its first run one interval after `now`.
    pub(crate) fn new(tasks: Vec<PeriodicTask>, now: Instant) -> Self {
        let slots = tasks
            .into_iter()
            .map(|task| Slot {
                next_due: now.checked_add(task.interval),
                task,
                running: Default::default(),
            })
            .collect();
        Self { slots }
    }

    /// Number of scheduled tasks.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Start every task due at `now`, returning how many were started.
    pub(crate) fn tick(&mut self, now: Instant, broker: &BrokerHandle, tasks: &TaskSet) -> usize {
        let mut started = 0;
        let due = |slot: &&mut Slot| slot.next_due.is_some_and(|at| at <= now);
        for slot in self.slots.iter_mut().filter(due) {
            slot.next_due = now.checked_add(slot.task.interval);

            if slot.running.swap(true, Ordering::AcqRel) {
                debug!(task = %slot.task.name, "previous run still in progress, skipping");
                crate::metrics::record_periodic_skipped(&slot.task.name);
                continue;
            }

            let ctx = PeriodicCtx {
                name: slot.task.name.clone(),
                broker: broker.clone(),
            };
            let guard = RunningGuard(slot.running.clone());
            tasks.spawn(run(slot.task.clone(), ctx, guard));
            started += 1;
        }
        started
    }
}

/// Run a task once, logging its outcome. Errors and panics stop here.
async fn run(task: PeriodicTask, ctx: PeriodicCtx, _guard: RunningGuard) {
    let span = debug_span!("periodic task", task = %task.name);
    async move {
        let handler = task.handler.clone();
        let run = AssertUnwindSafe(async move { handler.run(ctx).await }).catch_unwind();
        tokio::pin!(run);

        let outcome = match task.max_runtime {
            Some(max_runtime) => match tokio::time::timeout(max_runtime, &mut run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(?max_runtime, "periodic task exceeded its max runtime");
                    run.await
                }
            },
            None => run.await,
        };

        let label = match outcome {
            Ok(Ok(())) => {
                debug!("periodic task completed");
                "success"
            }
            Ok(Err(err)) => {
                error!(%err, "periodic task failed");
                "error"
            }
            Err(_) => {
                error!("periodic task panicked");
                "panic"
            }
        };
        crate::metrics::record_periodic_run(&task.name, label);
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::PeriodicError;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    fn counting(name: &str, every: Duration, work: Duration, runs: Arc<AtomicUsize>) -> PeriodicTask {
        PeriodicTask::new(name, every, move |_ctx: PeriodicCtx| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(work).await;
                Ok::<_, PeriodicError>(())
            }
        })
        .unwrap()
    }

    /// Let spawned runs make progress.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_run_once_per_interval() {
        let runs = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        let mut scheduler = Scheduler::new(
            vec![counting("fast", Duration::from_millis(500), Duration::ZERO, runs.clone())],
            start,
        );
        let broker = BrokerHandle::detached();
        let tasks = TaskSet::default();

        assert_eq!(scheduler.tick(start, &broker, &tasks), 0);
        assert_eq!(scheduler.tick(start + Duration::from_millis(500), &broker, &tasks), 1);
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // not due again until a full interval after the last tick
        assert_eq!(scheduler.tick(start + Duration::from_millis(900), &broker, &tasks), 0);
        assert_eq!(scheduler.tick(start + Duration::from_millis(1000), &broker, &tasks), 1);
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_never_overlap() {
        let runs = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        let mut scheduler = Scheduler::new(
            vec![counting("slow", Duration::from_secs(1), Duration::from_secs(3), runs.clone())],
            start,
        );
        let broker = BrokerHandle::detached();
        let tasks = TaskSet::default();

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(scheduler.tick(Instant::now(), &broker, &tasks), 1);
        settle().await;

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(scheduler.tick(Instant::now(), &broker, &tasks), 0);

        // the first run finishes at t=4
        tokio::time::sleep(Duration::from_millis(2100)).await;
        settle().await;
        assert_eq!(scheduler.tick(Instant::now(), &broker, &tasks), 1);
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_and_panics_keep_the_task_scheduled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let flaky = PeriodicTask::new("flaky", Duration::from_secs(1), move |_ctx: PeriodicCtx| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 => Err(PeriodicError::new("first run fails")),
                    1 => panic!("second run panics"),
                    _ => Ok(()),
                }
            }
        })
        .unwrap()
        .with_max_runtime(Duration::from_millis(10));

        let start = Instant::now();
        let mut scheduler = Scheduler::new(vec![flaky], start);
        let broker = BrokerHandle::detached();
        let tasks = TaskSet::default();

        for second in 1..=3 {
            let now = start + Duration::from_secs(second);
            assert_eq!(scheduler.tick(now, &broker, &tasks), 1);
            settle().await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_runs_finish_and_release_their_slot() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let overrun = PeriodicTask::new("overrun", Duration::from_secs(1), move |_ctx: PeriodicCtx| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, PeriodicError>(())
            }
        })
        .unwrap()
        .with_max_runtime(Duration::from_millis(100));

        let start = Instant::now();
        let mut scheduler = Scheduler::new(vec![overrun], start);
        let broker = BrokerHandle::detached();
        let tasks = TaskSet::default();

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(scheduler.tick(Instant::now(), &broker, &tasks), 1);
        settle().await;

        // past the max runtime, the run is still going and not cancelled
        tokio::time::sleep(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        // the slot is free again at the next interval
        tokio::time::advance(Duration::from_millis(650)).await;
        assert_eq!(scheduler.tick(Instant::now(), &broker, &tasks), 1);
        tokio::time::sleep(Duration::from_millis(400)).await;
        settle().await;
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unreachable_due_times_never_fire() {
        let now = Instant::now();
        let mut scheduler = Scheduler::default();
        scheduler.slots.push(Slot {
            task: counting("far", Duration::from_secs(1), Duration::ZERO, Default::default()),
            next_due: None,
            running: Default::default(),
        });
        let broker = BrokerHandle::detached();
        let tasks = TaskSet::default();
        assert_eq!(scheduler.tick(now + Duration::from_secs(3600), &broker, &tasks), 0);
    }
}
