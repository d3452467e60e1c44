//! Per-entity listener registry.
//!
//! The registry owns the poll task of one monitored entity: the task exists
//! exactly while at least one listener is registered. Firing copies the
//! listener list under the lock and invokes callbacks outside it, so a
//! callback may add or remove listeners without deadlocking; a listener added
//! mid-fire does not see the in-flight event.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::error;

use crate::logging::event_names;
use crate::scheduler::{PollJob, PollScheduler, TaskHandle};

/// Builds a fresh poll job each time the entity's task is (re)created.
pub type JobFactory = Box<dyn Fn() -> PollJob + Send + Sync>;

/// Immutable view of the registered listeners at one point in time.
pub type ListenerSnapshot<L> = Arc<Vec<Arc<L>>>;

struct RegistryState<L: ?Sized> {
    listeners: ListenerSnapshot<L>,
    interval: Duration,
    task: Option<TaskHandle>,
    closed: bool,
}

/// Thread-safe listener set that lazily starts and stops polling.
pub struct ListenerRegistry<L: ?Sized> {
    scheduler: Arc<PollScheduler>,
    factory: JobFactory,
    state: Mutex<RegistryState<L>>,
}

impl<L: ?Sized + Send + Sync> ListenerRegistry<L> {
    pub fn new(scheduler: Arc<PollScheduler>, interval: Duration, factory: JobFactory) -> Self {
        ListenerRegistry {
            scheduler,
            factory,
            state: Mutex::new(RegistryState {
                listeners: Arc::new(Vec::new()),
                interval,
                task: None,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<L>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener. Duplicates are kept and notified once each.
    ///
    /// Returns true when this call started the entity's poll task. A closed
    /// registry ignores the listener and returns false.
    pub fn add_listener(&self, listener: Arc<L>) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let mut listeners = Vec::with_capacity(state.listeners.len() + 1);
        listeners.extend(state.listeners.iter().cloned());
        listeners.push(listener);
        state.listeners = Arc::new(listeners);

        if state.task.is_none() {
            let interval = state.interval;
            state.task = Some(self.scheduler.schedule((self.factory)(), interval, interval));
            return true;
        }
        false
    }

    /// Remove one registration of `listener`, compared by pointer identity.
    ///
    /// Cancels the poll task when the last listener goes away.
    pub fn remove_listener(&self, listener: &Arc<L>) -> bool {
        let mut state = self.lock();
        let target = Arc::as_ptr(listener).cast::<()>();
        let Some(pos) = state
            .listeners
            .iter()
            .position(|l| Arc::as_ptr(l).cast::<()>() == target)
        else {
            return false;
        };

        let mut listeners: Vec<Arc<L>> = state.listeners.iter().cloned().collect();
        listeners.remove(pos);
        state.listeners = Arc::new(listeners);

        if state.listeners.is_empty() {
            if let Some(task) = state.task.take() {
                self.scheduler.cancel(&task);
            }
        }
        true
    }

    /// Change the polling interval, handing the live task's cadence over to
    /// a replacement task. No-op if unchanged.
    pub fn set_interval(&self, interval: Duration) {
        let mut state = self.lock();
        if state.interval == interval {
            return;
        }
        let old_interval = state.interval;
        state.interval = interval;
        if let Some(old) = state.task.take() {
            state.task = Some(self.scheduler.reschedule(
                &old,
                (self.factory)(),
                old_interval,
                interval,
            ));
        }
    }

    pub fn interval(&self) -> Duration {
        self.lock().interval
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// The live poll task, if any.
    pub fn task(&self) -> Option<TaskHandle> {
        self.lock().task.clone()
    }

    /// Copy-on-read snapshot of the listener list.
    pub fn snapshot(&self) -> ListenerSnapshot<L> {
        self.lock().listeners.clone()
    }

    /// Invoke `notify` for every listener in a snapshot taken now.
    ///
    /// A panicking listener is logged and skipped; delivery continues with
    /// the next one. Returns the number of listeners that completed.
    pub fn fire<F>(&self, event: &'static str, notify: F) -> usize
    where
        F: Fn(&L),
    {
        let listeners = self.snapshot();
        let mut delivered = 0;
        for listener in listeners.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| notify(&**listener)));
            match outcome {
                Ok(()) => delivered += 1,
                Err(_) => error!(
                    event = event_names::LISTENER_PANICKED,
                    listener_event = event,
                    "listener panicked during delivery"
                ),
            }
        }
        delivered
    }

    /// Cancel the poll task, drop all listeners and refuse new ones.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.listeners = Arc::new(Vec::new());
        if let Some(task) = state.task.take() {
            self.scheduler.cancel(&task);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl<L: ?Sized> Drop for ListenerRegistry<L> {
    fn drop(&mut self) {
        let task = self
            .state
            .get_mut()
            .map(|s| s.task.take())
            .unwrap_or_else(|e| e.into_inner().task.take());
        if let Some(task) = task {
            self.scheduler.cancel(&task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Weak};
    use std::thread;

    trait Probe: Send + Sync {
        fn hit(&self);
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl Probe for Counter {
        fn hit(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicker;

    impl Probe for Panicker {
        fn hit(&self) {
            panic!("listener bug");
        }
    }

    fn registry(ticks: Arc<AtomicUsize>, interval: Duration) -> ListenerRegistry<dyn Probe> {
        let scheduler = Arc::new(PollScheduler::new().unwrap());
        ListenerRegistry::new(
            scheduler,
            interval,
            Box::new(move || {
                let ticks = ticks.clone();
                let job: PollJob = Box::new(move || {
                    ticks.fetch_add(1, Ordering::SeqCst);
                });
                job
            }),
        )
    }

    #[test]
    fn test_first_listener_starts_task() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let reg = registry(ticks.clone(), Duration::from_millis(5));
        assert!(reg.task().is_none());

        let a: Arc<dyn Probe> = Arc::new(Counter::default());
        assert!(reg.add_listener(a.clone()));
        assert!(!reg.add_listener(Arc::new(Counter::default())));
        assert!(reg.task().is_some());

        thread::sleep(Duration::from_millis(50));
        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_last_listener_stops_task() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let reg = registry(ticks.clone(), Duration::from_millis(5));
        let a: Arc<dyn Probe> = Arc::new(Counter::default());
        let b: Arc<dyn Probe> = Arc::new(Counter::default());
        reg.add_listener(a.clone());
        reg.add_listener(b.clone());

        assert!(reg.remove_listener(&a));
        assert!(reg.task().is_some());
        assert!(reg.remove_listener(&b));
        assert!(reg.task().is_none());
        assert!(!reg.remove_listener(&b));

        thread::sleep(Duration::from_millis(20));
        let frozen = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), frozen);
    }

    #[test]
    fn test_concurrent_adds_start_one_task() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let reg = Arc::new(registry(ticks, Duration::from_secs(60)));
        let started = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let reg = reg.clone();
                let started = started.clone();
                thread::spawn(move || {
                    if reg.add_listener(Arc::new(Counter::default())) {
                        started.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(reg.listener_count(), 16);
        assert_eq!(reg.scheduler.live_tasks(), 1);
    }

    #[test]
    fn test_duplicates_each_notified() {
        let reg = registry(Arc::new(AtomicUsize::new(0)), Duration::from_secs(60));
        let counter = Arc::new(Counter::default());
        let as_probe: Arc<dyn Probe> = counter.clone();
        reg.add_listener(as_probe.clone());
        reg.add_listener(as_probe.clone());

        assert_eq!(reg.fire("test", |l| l.hit()), 2);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);

        // Removing one registration leaves the duplicate in place.
        reg.remove_listener(&as_probe);
        reg.fire("test", |l| l.hit());
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let reg = registry(Arc::new(AtomicUsize::new(0)), Duration::from_secs(60));
        let counter = Arc::new(Counter::default());
        reg.add_listener(Arc::new(Panicker));
        reg.add_listener(counter.clone());

        assert_eq!(reg.fire("test", |l| l.hit()), 1);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_adds() {
        let reg = registry(Arc::new(AtomicUsize::new(0)), Duration::from_secs(60));
        reg.add_listener(Arc::new(Counter::default()));
        let snapshot = reg.snapshot();
        reg.add_listener(Arc::new(Counter::default()));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(reg.snapshot().len(), 2);
    }

    /// Registry whose poll job fires `hit` on every listener.
    fn firing_registry(interval: Duration) -> Arc<ListenerRegistry<dyn Probe>> {
        let scheduler = Arc::new(PollScheduler::new().unwrap());
        Arc::new_cyclic(|weak: &Weak<ListenerRegistry<dyn Probe>>| {
            let weak = weak.clone();
            ListenerRegistry::new(
                scheduler,
                interval,
                Box::new(move || {
                    let weak = weak.clone();
                    let job: PollJob = Box::new(move || {
                        if let Some(reg) = weak.upgrade() {
                            reg.fire("tick", |l| l.hit());
                        }
                    });
                    job
                }),
            )
        })
    }

    /// On its first event: registers `late`, unregisters itself and slows
    /// the poll down.
    struct Reentrant {
        registry: Weak<ListenerRegistry<dyn Probe>>,
        me: Mutex<Option<Arc<dyn Probe>>>,
        late: Arc<Counter>,
        done: Mutex<mpsc::Sender<()>>,
    }

    impl Probe for Reentrant {
        fn hit(&self) {
            let Some(reg) = self.registry.upgrade() else {
                return;
            };
            let Some(me) = self.me.lock().unwrap().take() else {
                return;
            };
            let late: Arc<dyn Probe> = self.late.clone();
            reg.add_listener(late);
            assert!(reg.remove_listener(&me));
            reg.set_interval(Duration::from_secs(60));
            let _ = self.done.lock().unwrap().send(());
        }
    }

    #[test]
    fn test_listener_can_reenter_registry_during_fire() {
        let reg = firing_registry(Duration::from_millis(5));
        let late = Arc::new(Counter::default());
        let (done_tx, done_rx) = mpsc::channel();
        let reentrant = Arc::new(Reentrant {
            registry: Arc::downgrade(&reg),
            me: Mutex::new(None),
            late: late.clone(),
            done: Mutex::new(done_tx),
        });
        let as_probe: Arc<dyn Probe> = reentrant.clone();
        *reentrant.me.lock().unwrap() = Some(as_probe.clone());
        reg.add_listener(as_probe);

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let task = reg.task().unwrap();
        // Let the in-flight fire finish before sampling.
        thread::sleep(Duration::from_millis(50));

        assert_eq!(late.0.load(Ordering::SeqCst), 0);
        assert_eq!(reg.listener_count(), 1);
        assert_eq!(reg.interval(), Duration::from_secs(60));
        assert_eq!(reg.task().unwrap().id(), task.id());
        assert_eq!(reg.scheduler.live_tasks(), 1);
    }

    #[test]
    fn test_set_interval_reschedules_live_task() {
        let reg = registry(Arc::new(AtomicUsize::new(0)), Duration::from_secs(60));
        reg.set_interval(Duration::from_secs(60));
        assert!(reg.task().is_none());

        reg.add_listener(Arc::new(Counter::default()));
        let before = reg.task().unwrap();
        reg.set_interval(Duration::from_secs(60));
        assert_eq!(reg.task().unwrap().id(), before.id());

        reg.set_interval(Duration::from_secs(30));
        let after = reg.task().unwrap();
        assert_ne!(after.id(), before.id());
        assert!(before.is_cancelled());
        assert_eq!(reg.interval(), Duration::from_secs(30));
        assert_eq!(reg.scheduler.live_tasks(), 1);
    }

    #[test]
    fn test_close_refuses_new_listeners() {
        let reg = registry(Arc::new(AtomicUsize::new(0)), Duration::from_secs(60));
        reg.add_listener(Arc::new(Counter::default()));
        reg.close();
        assert!(reg.is_closed());
        assert!(reg.task().is_none());
        assert!(!reg.add_listener(Arc::new(Counter::default())));
        assert_eq!(reg.listener_count(), 0);
    }
}
