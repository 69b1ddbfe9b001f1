//! Recurring, cancellable maintenance tasks on one shared worker.
//!
//! A [`Scheduler`] keeps its tasks in a registry keyed by id and their due
//! times in a min-heap. [`Scheduler::start`] spawns a single tokio task that
//! sleeps until the earliest due time, runs every due task in order and goes
//! back to sleep. Task bodies run on that worker one after the other, so a
//! slow body delays every other task.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Stand-in due time for delays too large to represent, about 30 years out.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn due_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay).unwrap_or(from + FAR_FUTURE)
}

type Body = Box<dyn Fn() + Send + Sync>;

/// A unit of recurring work.
pub struct ScheduledTask {
    id: String,
    body: Body,
    cancelled: AtomicBool,
    /// Sequence number of the live timer entry.
    generation: AtomicU64,
    next_run: Mutex<Option<Instant>>,
    period: Mutex<Option<Duration>>,
}

impl ScheduledTask {
    /// Create a task running `body` each time it fires.
    pub fn new<F>(id: impl Into<String>, body: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self {
            id: id.into(),
            body: Box::new(body),
            cancelled: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            next_run: Mutex::new(None),
            period: Mutex::new(None),
        })
    }

    /// Task id, unique among live tasks.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the task was unscheduled. Cancelled tasks never run again.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// When the task fires next, or `None` when it is not scheduled.
    pub fn next_run(&self) -> Option<Instant> {
        *self.next_run.lock()
    }

    /// Interval between firings, `None` for a one-shot task.
    pub fn period(&self) -> Option<Duration> {
        *self.period.lock()
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        *self.next_run.lock() = None;
    }

    fn run(&self) {
        debug!(task = %self.id, "running scheduled task");
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| (self.body)())) {
            error!(task = %self.id, panic = panic_message(&*panic), "scheduled task panicked");
        }
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .field("next_run", &self.next_run())
            .field("period", &self.period())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

struct Timer {
    due: Instant,
    seq: u64,
    task: Arc<ScheduledTask>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<String, Arc<ScheduledTask>>,
    timers: BinaryHeap<Reverse<Timer>>,
    seq: u64,
}

impl Registry {
    fn arm(&mut self, task: &Arc<ScheduledTask>, due: Instant) {
        self.seq += 1;
        task.generation.store(self.seq, Ordering::Release);
        *task.next_run.lock() = Some(due);
        self.timers.push(Reverse(Timer {
            due,
            seq: self.seq,
            task: task.clone(),
        }));
    }

    fn is_live(&self, timer: &Timer) -> bool {
        !timer.task.is_cancelled()
            && timer.task.generation.load(Ordering::Acquire) == timer.seq
            && self
                .tasks
                .get(&timer.task.id)
                .is_some_and(|task| Arc::ptr_eq(task, &timer.task))
    }
}

struct Inner {
    registry: Mutex<Registry>,
    wakeup: Notify,
    running: AtomicBool,
}

/// Runs scheduled tasks on one shared worker.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use callframe_engine::{ScheduledTask, Scheduler};
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() {
///     let scheduler = Scheduler::new();
///     let handle = scheduler.start().unwrap();
///
///     let task = ScheduledTask::new("heartbeat", || println!("tick"));
///     assert!(scheduler.schedule(&task, Duration::ZERO, Some(Duration::from_secs(1))));
///     assert!(!scheduler.schedule(&task, Duration::ZERO, None));
///
///     scheduler.unschedule(&task);
///     handle.shutdown().await;
/// }
/// ```
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler. No worker runs until [`start`](Self::start).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                wakeup: Notify::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Schedule `task` to fire after `delay` and then every `period`.
    ///
    /// Returns `false` without changing anything when the task was cancelled
    /// or a live task with the same id exists. A `None` period fires once and
    /// removes the task afterwards. Periods shorter than a millisecond are
    /// raised to one.
    pub fn schedule(
        &self,
        task: &Arc<ScheduledTask>,
        delay: Duration,
        period: Option<Duration>,
    ) -> bool {
        if task.is_cancelled() {
            debug!(task = %task.id, "refusing to schedule a cancelled task");
            return false;
        }

        {
            let mut registry = self.inner.registry.lock();
            if registry.tasks.contains_key(&task.id) {
                debug!(task = %task.id, "task already scheduled");
                return false;
            }
            *task.period.lock() = period.map(|period| period.max(MIN_PERIOD));
            registry.tasks.insert(task.id.clone(), task.clone());
            registry.arm(task, due_after(Instant::now(), delay));
        }

        self.inner.wakeup.notify_one();
        true
    }

    /// Cancel `task` and remove it from the registry.
    ///
    /// Returns whether the task was live. A firing already in progress runs
    /// to completion.
    pub fn unschedule(&self, task: &Arc<ScheduledTask>) -> bool {
        task.cancel();
        let mut registry = self.inner.registry.lock();
        let live = registry
            .tasks
            .get(&task.id)
            .is_some_and(|existing| Arc::ptr_eq(existing, task));
        if live {
            registry.tasks.remove(&task.id);
            debug!(task = %task.id, "unscheduled task");
        }
        live
    }

    /// The live task registered under `id`.
    pub fn get(&self, id: &str) -> Option<Arc<ScheduledTask>> {
        self.inner.registry.lock().tasks.get(id).cloned()
    }

    /// Ids of all live tasks, sorted.
    pub fn tasks(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.registry.lock().tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether a worker is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Run every task that is due now and return the next due time.
    ///
    /// Periodic tasks are re-armed one period after the start of their
    /// firing; one-shot tasks leave the registry as they fire.
    pub fn run_due(&self) -> Option<Instant> {
        loop {
            let task = {
                let mut registry = self.inner.registry.lock();
                let now = Instant::now();
                match registry.timers.peek() {
                    None => return None,
                    Some(Reverse(timer)) if timer.due > now => return Some(timer.due),
                    Some(_) => {}
                }
                let Some(Reverse(timer)) = registry.timers.pop() else {
                    return None;
                };
                if !registry.is_live(&timer) {
                    continue;
                }

                match timer.task.period() {
                    Some(period) => registry.arm(&timer.task, due_after(now, period)),
                    None => {
                        registry.tasks.remove(&timer.task.id);
                        *timer.task.next_run.lock() = None;
                    }
                }
                timer.task
            };
            task.run();
        }
    }

    /// Spawn the worker on the current tokio runtime.
    ///
    /// Returns `None` when a worker is already running. Dropping the handle
    /// stops the worker.
    pub fn start(&self) -> Option<SchedulerHandle> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return None;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let scheduler = self.clone();

        let join = tokio::spawn(async move {
            info!("scheduler worker started");
            loop {
                let notified = scheduler.inner.wakeup.notified();
                let next = scheduler.run_due();

                tokio::select! {
                    _ = sleep_until(next) => {}
                    _ = notified => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            scheduler.inner.running.store(false, Ordering::Release);
            info!("scheduler worker stopped");
        });

        Some(SchedulerHandle { stop_tx, join })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.tasks())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

/// Handle for stopping a running scheduler worker.
#[derive(Debug)]
pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Ask the worker to stop after its current firing.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Stop the worker and wait for it to exit.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.join.await;
    }
}
