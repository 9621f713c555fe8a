//! Delayed, cancellable task execution.
//!
//! Every scheduled task gets a [`TaskSeq`] from a single monotonic counter, so
//! sequence numbers order tasks by acceptance time. A task sits in the task
//! table until it finishes. Before running it must claim its own entry, and
//! cancellation only removes unclaimed entries under the same lock, so a task
//! either runs to completion or never starts.

use sitebot_core::PrId;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

/// Acceptance order of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskSeq(pub u64);

impl fmt::Display for TaskSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

tokio::task_local! {
    static CURRENT_TASK: TaskSeq;
}

struct ScheduledTask {
    key: Option<PrId>,
    handle: AbortHandle,
    started: bool,
}

/// Drops a started task's entry when it finishes or panics.
struct Finished<'a> {
    scheduler: &'a DelayedScheduler,
    seq: TaskSeq,
}

impl Drop for Finished<'_> {
    fn drop(&mut self) {
        self.scheduler.tasks().remove(&self.seq);
    }
}

#[derive(Default)]
pub struct DelayedScheduler {
    next_seq: AtomicU64,
    tasks: Mutex<HashMap<TaskSeq, ScheduledTask>>,
}

impl DelayedScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskSeq, ScheduledTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a sequence number without scheduling anything.
    pub fn next_seq(&self) -> TaskSeq {
        TaskSeq(self.next_seq.fetch_add(1, Ordering::SeqCst))
    }

    /// Run `make(seq)` once `delay` has elapsed.
    ///
    /// `key` groups tasks that [`cancel_pending`](Self::cancel_pending) can
    /// cancel together. A zero delay still goes through the runtime; the task
    /// never runs synchronously inside this call.
    pub fn schedule<F, Fut>(self: &Arc<Self>, key: Option<PrId>, delay: Duration, make: F) -> TaskSeq
    where
        F: FnOnce(TaskSeq) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let seq = self.next_seq();
        let fire_at = Instant::now() + delay;
        let scheduler = Arc::clone(self);

        // Spawned under the lock so the task cannot claim before it is registered
        let mut tasks = self.tasks();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(fire_at).await;
            if !scheduler.claim(seq) {
                debug!("Task {} was cancelled before it fired", seq);
                return;
            }
            let _finished = Finished {
                scheduler: &scheduler,
                seq,
            };
            CURRENT_TASK.scope(seq, make(seq)).await;
        });
        tasks.insert(
            seq,
            ScheduledTask {
                key,
                handle: handle.abort_handle(),
                started: false,
            },
        );

        seq
    }

    fn claim(&self, seq: TaskSeq) -> bool {
        match self.tasks().get_mut(&seq) {
            Some(task) if !task.started => {
                task.started = true;
                true
            }
            _ => false,
        }
    }

    /// Cancel every not-yet-started task for `key` accepted before `before`.
    ///
    /// Returns the number of tasks cancelled.
    pub fn cancel_pending(&self, key: PrId, before: TaskSeq) -> usize {
        let mut tasks = self.tasks();
        let doomed: Vec<TaskSeq> = tasks
            .iter()
            .filter(|(seq, task)| !task.started && task.key == Some(key) && **seq < before)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in &doomed {
            if let Some(task) = tasks.remove(seq) {
                task.handle.abort();
            }
        }

        doomed.len()
    }

    /// Tasks that have not started yet.
    pub fn pending_count(&self) -> usize {
        self.tasks().values().filter(|task| !task.started).count()
    }

    /// Sequence numbers of tasks for `key` that have not started, in order.
    pub fn pending_for(&self, key: PrId) -> Vec<TaskSeq> {
        let mut seqs: Vec<TaskSeq> = self
            .tasks()
            .iter()
            .filter(|(_, task)| !task.started && task.key == Some(key))
            .map(|(seq, _)| *seq)
            .collect();
        seqs.sort();
        seqs
    }

    /// The task the caller is running inside, if it was scheduled here.
    pub fn current() -> Option<TaskSeq> {
        CURRENT_TASK.try_with(|seq| *seq).ok()
    }

    /// Whether a task for `key` other than the caller's is pending or running.
    pub fn has_other_tasks(&self, key: PrId) -> bool {
        let current = Self::current();
        self.tasks()
            .iter()
            .any(|(seq, task)| task.key == Some(key) && Some(*seq) != current)
    }
}
