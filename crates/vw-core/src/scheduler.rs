//! Shared poll scheduler.
//!
//! One background thread executes every periodic poll task in deadline
//! order. Tasks never overlap: a slow tick delays every other entity's tick,
//! so poll jobs must stay short (a directory scan or a buffer read).
//!
//! Cancellation is cooperative. `cancel` drops the task's pending slot; a job
//! that is already running completes and is then discarded.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::logging::event_names;

/// A periodic unit of work.
pub type PollJob = Box<dyn FnMut() + Send + 'static>;

/// Per-task diagnostics shared between the scheduler and handles.
#[derive(Debug, Default)]
struct TaskStats {
    cancelled: AtomicBool,
    executions: AtomicU64,
}

/// Handle to a scheduled task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    stats: Arc<TaskStats>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of completed executions.
    pub fn executions(&self) -> u64 {
        self.stats.executions.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.stats.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    deadline: Instant,
    seq: u64,
    task_id: u64,
}

struct TaskEntry {
    /// `None` while the job is running on the worker thread.
    job: Option<PollJob>,
    period: Duration,
    /// Sequence number of the only heap slot that is still valid.
    slot_seq: u64,
    next_deadline: Instant,
    last_started: Option<Instant>,
    stats: Arc<TaskStats>,
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<Slot>>,
    tasks: HashMap<u64, TaskEntry>,
    next_id: u64,
    next_seq: u64,
    shutdown: bool,
}

impl Queue {
    fn push_slot(&mut self, task_id: u64, deadline: Instant) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.heap.push(Reverse(Slot {
            deadline,
            seq,
            task_id,
        }));
        seq
    }

    fn insert(&mut self, job: PollJob, first: Instant, period: Duration) -> TaskHandle {
        self.next_id += 1;
        let id = self.next_id;
        let stats = Arc::new(TaskStats::default());
        let slot_seq = self.push_slot(id, first);
        self.tasks.insert(
            id,
            TaskEntry {
                job: Some(job),
                period,
                slot_seq,
                next_deadline: first,
                last_started: None,
                stats: stats.clone(),
            },
        );
        TaskHandle { id, stats }
    }

    fn remove(&mut self, handle: &TaskHandle) -> Option<TaskEntry> {
        handle.stats.cancelled.store(true, Ordering::SeqCst);
        self.tasks.remove(&handle.id)
    }
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        // A poisoned queue only means a panic escaped between two field
        // updates; the heap and map stay structurally valid.
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Single-threaded periodic task scheduler.
pub struct PollScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PollScheduler {
    /// Start a scheduler with its own worker thread.
    pub fn new() -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("vw-poll".to_string())
            .spawn(move || run_worker(&worker_shared))?;
        Ok(PollScheduler {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Schedule `job` to run after `initial_delay`, then every `period`.
    pub fn schedule(&self, job: PollJob, initial_delay: Duration, period: Duration) -> TaskHandle {
        let period = period.max(MIN_PERIOD);
        let first = Instant::now() + initial_delay;
        let handle = self.shared.lock().insert(job, first, period);
        self.shared.wakeup.notify_all();
        debug!(
            event = event_names::TASK_SCHEDULED,
            task_id = handle.id,
            period_ms = period.as_millis() as u64,
            "poll task scheduled"
        );
        handle
    }

    /// Cancel a task. Returns false if it was already cancelled.
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        let removed = self.shared.lock().remove(handle).is_some();
        if removed {
            debug!(
                event = event_names::TASK_CANCELLED,
                task_id = handle.id,
                executions = handle.executions(),
                "poll task cancelled"
            );
        }
        removed
    }

    /// Replace `old` with `job` at a new period, without skipping or doubling
    /// a tick.
    ///
    /// The new task's first run lands one `new_period` after the start of the
    /// old task's most recent run. If the old task never ran, the first run is
    /// the earlier of its pending deadline and `now + new_period`.
    pub fn reschedule(
        &self,
        old: &TaskHandle,
        job: PollJob,
        old_period: Duration,
        new_period: Duration,
    ) -> TaskHandle {
        let new_period = new_period.max(MIN_PERIOD);
        let now = Instant::now();
        let handle = {
            let mut queue = self.shared.lock();
            let first = match queue.remove(old) {
                Some(entry) => match entry.last_started {
                    Some(last) => (last + new_period).max(now),
                    None => entry.next_deadline.min(now + new_period),
                },
                None => now + new_period,
            };
            queue.insert(job, first, new_period)
        };
        self.shared.wakeup.notify_all();
        debug!(
            event = event_names::TASK_RESCHEDULED,
            old_task_id = old.id,
            task_id = handle.id,
            old_period_ms = old_period.as_millis() as u64,
            new_period_ms = new_period.as_millis() as u64,
            "poll task rescheduled"
        );
        handle
    }

    /// Number of tasks that are scheduled and not cancelled.
    pub fn live_tasks(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Stop the worker thread. Pending tasks are dropped.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.lock();
            queue.shutdown = true;
            queue.heap.clear();
            queue.tasks.clear();
        }
        self.shared.wakeup.notify_all();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            // Joining from inside a job would wait on ourselves.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PollScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollScheduler")
            .field("live_tasks", &self.live_tasks())
            .finish()
    }
}

const MIN_PERIOD: Duration = Duration::from_millis(1);

fn run_worker(shared: &Shared) {
    loop {
        let Some((task_id, mut job, stats, started)) = next_ready(shared) else {
            return;
        };

        trace!(event = event_names::TASK_RUN, task_id, "running poll task");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job()));
        stats.executions.fetch_add(1, Ordering::SeqCst);
        if outcome.is_err() {
            error!(
                event = event_names::TASK_PANICKED,
                task_id, "poll task panicked; continuing with remaining tasks"
            );
        }

        let mut queue = shared.lock();
        if queue.shutdown {
            return;
        }
        let Some(entry) = queue.tasks.get_mut(&task_id) else {
            // Cancelled while running.
            continue;
        };
        let deadline = started + entry.period;
        entry.job = Some(job);
        entry.next_deadline = deadline;
        let seq = queue.push_slot(task_id, deadline);
        if let Some(entry) = queue.tasks.get_mut(&task_id) {
            entry.slot_seq = seq;
        }
    }
}

/// Block until a task is due, then take its job out of the queue.
fn next_ready(shared: &Shared) -> Option<(u64, PollJob, Arc<TaskStats>, Instant)> {
    let mut queue = shared.lock();
    loop {
        if queue.shutdown {
            return None;
        }

        let Some(Reverse(slot)) = queue.heap.peek().copied() else {
            queue = shared
                .wakeup
                .wait(queue)
                .unwrap_or_else(|e| e.into_inner());
            continue;
        };

        let now = Instant::now();
        if slot.deadline > now {
            queue = shared
                .wakeup
                .wait_timeout(queue, slot.deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
            continue;
        }

        queue.heap.pop();
        let Some(entry) = queue.tasks.get_mut(&slot.task_id) else {
            continue;
        };
        if entry.slot_seq != slot.seq {
            continue;
        }
        let Some(job) = entry.job.take() else {
            continue;
        };
        entry.last_started = Some(now);
        return Some((slot.task_id, job, entry.stats.clone(), now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn counting_job(counter: Arc<AtomicUsize>) -> PollJob {
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_task_runs_periodically() {
        let scheduler = PollScheduler::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule(
            counting_job(counter.clone()),
            Duration::ZERO,
            Duration::from_millis(10),
        );

        thread::sleep(Duration::from_millis(120));
        assert!(counter.load(Ordering::SeqCst) >= 3);
        assert!(handle.executions() >= 3);
    }

    #[test]
    fn test_cancel_stops_future_runs() {
        let scheduler = PollScheduler::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule(
            counting_job(counter.clone()),
            Duration::ZERO,
            Duration::from_millis(5),
        );
        thread::sleep(Duration::from_millis(40));
        assert!(scheduler.cancel(&handle));
        assert!(!scheduler.cancel(&handle));
        assert!(handle.is_cancelled());

        // Allow an in-flight run to finish before sampling.
        thread::sleep(Duration::from_millis(20));
        let frozen = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(counter.load(Ordering::SeqCst), frozen);
        assert_eq!(scheduler.live_tasks(), 0);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let scheduler = PollScheduler::new().unwrap();
        scheduler.schedule(
            Box::new(|| panic!("poll failure")),
            Duration::ZERO,
            Duration::from_millis(5),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(
            counting_job(counter.clone()),
            Duration::ZERO,
            Duration::from_millis(5),
        );
        thread::sleep(Duration::from_millis(80));
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_tasks_run_in_deadline_order() {
        let scheduler = PollScheduler::new().unwrap();
        let (tx, rx) = mpsc::channel();
        for (name, delay) in [("late", 60u64), ("early", 10), ("middle", 30)] {
            let tx = tx.clone();
            scheduler.schedule(
                Box::new(move || {
                    let _ = tx.send(name);
                }),
                Duration::from_millis(delay),
                Duration::from_secs(60),
            );
        }
        let order: Vec<&str> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_reschedule_replaces_task() {
        let scheduler = PollScheduler::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let old = scheduler.schedule(
            counting_job(counter.clone()),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        let new = scheduler.reschedule(
            &old,
            counting_job(counter.clone()),
            Duration::from_secs(60),
            Duration::from_millis(10),
        );
        assert!(old.is_cancelled());
        assert!(!new.is_cancelled());
        assert_eq!(scheduler.live_tasks(), 1);

        thread::sleep(Duration::from_millis(100));
        assert!(counter.load(Ordering::SeqCst) >= 2);
        assert_eq!(old.executions(), 0);
    }

    #[test]
    fn test_shutdown_drops_pending_tasks() {
        let scheduler = PollScheduler::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(
            counting_job(counter.clone()),
            Duration::from_millis(30),
            Duration::from_millis(30),
        );
        scheduler.shutdown();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.live_tasks(), 0);
    }
}
