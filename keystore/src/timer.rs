/// Deferred task scheduling for the auto-lock timer.
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::clock::Clock;
use crate::errors::{WalletError, WalletResult};

pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task once after a delay.
pub trait Scheduler: fmt::Debug + Send + Sync {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// Handle to a scheduled task. Dropping the handle cancels the task.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        self.cancel_inner();
    }

    fn cancel_inner(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel_inner();
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Scheduler spawning sleeping tasks on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Bind to the runtime of the calling context.
    pub fn current() -> WalletResult<Self> {
        let handle = Handle::try_current().map_err(|_| WalletError::NotInitialized)?;
        Ok(Self::new(handle))
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        TimerHandle::new(move || join.abort())
    }
}

struct PendingTask {
    id: u64,
    due: DateTime<Utc>,
    cancelled: Arc<AtomicBool>,
    task: TimerTask,
}

/// Scheduler whose tasks only run when [`ManualScheduler::run_due`] is called,
/// using the shared clock to decide what is due.
pub struct ManualScheduler {
    clock: Arc<dyn Clock>,
    pending: Mutex<Vec<PendingTask>>,
    next_id: AtomicU64,
}

impl ManualScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            pending: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of scheduled tasks that have not been cancelled or run.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .iter()
            .filter(|entry| !entry.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Earliest due time among live tasks.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.pending
            .lock()
            .iter()
            .filter(|entry| !entry.cancelled.load(Ordering::SeqCst))
            .map(|entry| entry.due)
            .min()
    }

    /// Run every live task whose due time has passed. Returns how many ran.
    pub fn run_due(&self) -> usize {
        let now = self.clock.now();
        let mut due: Vec<PendingTask> = {
            let mut pending = self.pending.lock();
            pending.retain(|entry| !entry.cancelled.load(Ordering::SeqCst));
            let (due, later): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|entry| entry.due <= now);
            *pending = later;
            due
        };

        let mut ran = 0;
        due.sort_by_key(|entry| (entry.due, entry.id));
        // Tasks run without the pending lock held so they may reschedule.
        for entry in due {
            if entry.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            (entry.task)();
            ran += 1;
        }
        ran
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let delta = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let now = self.clock.now();
        let due = now.checked_add_signed(delta).unwrap_or(now);
        let cancelled = Arc::new(AtomicBool::new(false));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().push(PendingTask {
            id,
            due,
            cancelled: Arc::clone(&cancelled),
            task,
        });
        TimerHandle::new(move || cancelled.store(true, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> TimerTask {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn manual_scheduler_runs_only_due_tasks() {
        let clock = Arc::new(ManualClock::at_epoch());
        let scheduler = ManualScheduler::new(clock.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        let _first = scheduler.schedule(Duration::from_secs(10), counter_task(&counter));
        let _second = scheduler.schedule(Duration::from_secs(30), counter_task(&counter));
        assert_eq!(scheduler.pending(), 2);

        clock.advance(Duration::from_secs(9));
        assert_eq!(scheduler.run_due(), 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(scheduler.run_due(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn dropping_handle_cancels_task() {
        let clock = Arc::new(ManualClock::at_epoch());
        let scheduler = ManualScheduler::new(clock.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = scheduler.schedule(Duration::from_secs(5), counter_task(&counter));
        drop(handle);
        assert_eq!(scheduler.pending(), 0);

        clock.advance(Duration::from_secs(10));
        assert_eq!(scheduler.run_due(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tokio_scheduler_fires_and_cancels() {
        let scheduler = TokioScheduler::current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let kept = scheduler.schedule(Duration::from_millis(20), counter_task(&fired));
        let cancelled = scheduler.schedule(Duration::from_millis(20), counter_task(&fired));
        cancelled.cancel();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(kept);
    }
}
