//! Per-instance change detector.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace, warn};

use vw_common::{Error, InstanceId, Result};

use super::events::{InstanceListener, MonitorStatusChangeEvent, MonitorsUpdatedEvent};
use crate::diff::SetDiff;
use crate::logging::event_names;
use crate::perfdata::{InstrumentationView, VariableSnapshot};
use crate::registry::ListenerRegistry;
use crate::scheduler::{PollJob, PollScheduler};

/// Where a monitored instance is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Attached, no poll task yet.
    Attached,
    Polling,
    Detached,
}

pub(crate) struct InstanceState {
    id: InstanceId,
    /// Dropped on detach, releasing the underlying buffer.
    view: Mutex<Option<Box<dyn InstrumentationView>>>,
    previous: Mutex<VariableSnapshot>,
    detached: AtomicBool,
    registry: ListenerRegistry<dyn InstanceListener>,
}

impl InstanceState {
    fn new(
        id: InstanceId,
        view: Box<dyn InstrumentationView>,
        scheduler: Arc<PollScheduler>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<InstanceState>| {
            let weak = weak.clone();
            let factory = Box::new(move || {
                let weak = weak.clone();
                let job: PollJob = Box::new(move || {
                    if let Some(state) = weak.upgrade() {
                        state.poll();
                    }
                });
                job
            });
            InstanceState {
                id,
                view: Mutex::new(Some(view)),
                previous: Mutex::new(VariableSnapshot::new()),
                detached: AtomicBool::new(false),
                registry: ListenerRegistry::new(scheduler, interval, factory),
            }
        })
    }

    fn view(&self) -> MutexGuard<'_, Option<Box<dyn InstrumentationView>>> {
        self.view.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sample(&self) -> Result<VariableSnapshot> {
        match self.view().as_ref() {
            Some(view) => view.snapshot(),
            None => Err(Error::NotFound { id: self.id }),
        }
    }

    /// One tick: sample, diff key sets against the last sample, notify.
    fn poll(&self) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        let current = match self.sample() {
            Ok(current) => current,
            Err(err) => {
                warn!(
                    event = event_names::INSTANCE_DECODE_FAILED,
                    instance = %self.id,
                    error = %err,
                    "sample failed, treating as unchanged"
                );
                let variables = self
                    .previous
                    .lock()
                    .map(|p| p.len())
                    .unwrap_or_else(|e| e.into_inner().len());
                self.fire_updated(Utc::now(), variables);
                return;
            }
        };

        let previous = {
            let mut slot = self.previous.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *slot, current.clone())
        };
        let previous_keys: BTreeSet<String> = previous.keys().cloned().collect();
        let current_keys: BTreeSet<String> = current.keys().cloned().collect();
        let diff = SetDiff::between(&previous_keys, &current_keys);

        trace!(
            event = event_names::INSTANCE_POLL,
            instance = %self.id,
            variables = current.len(),
            inserted = diff.inserted.len(),
            removed = diff.removed.len(),
            "instance poll"
        );

        let now = Utc::now();
        if !diff.is_empty() {
            let event = MonitorStatusChangeEvent {
                instance: self.id,
                timestamp: now,
                inserted: diff
                    .inserted
                    .iter()
                    .filter_map(|name| current.get(name).cloned())
                    .collect(),
                removed: diff
                    .removed
                    .iter()
                    .filter_map(|name| previous.get(name).cloned())
                    .collect(),
            };
            self.registry
                .fire("monitors_changed", |l| l.on_monitors_changed(&event));
        }

        self.fire_updated(now, current.len());
    }

    fn fire_updated(&self, timestamp: DateTime<Utc>, variables: usize) {
        let updated = MonitorsUpdatedEvent {
            instance: self.id,
            timestamp,
            variables,
        };
        self.registry
            .fire("monitors_updated", |l| l.on_updated(&updated));
    }

    /// Cancel polling, then release the view and its buffer.
    fn detach(&self) -> bool {
        if self.detached.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.registry.close();
        let view = self.view().take();
        drop(view);
        debug!(event = event_names::DETACH, instance = %self.id, "detached");
        true
    }
}

/// A running instance being watched for variable changes.
///
/// Cloning yields another handle to the same instance. Dropping every handle
/// stops polling and releases the buffer, as does [`super::MonitoredHost::detach`].
#[derive(Clone)]
pub struct MonitoredInstance {
    state: Arc<InstanceState>,
}

impl MonitoredInstance {
    pub(crate) fn new(
        id: InstanceId,
        view: Box<dyn InstrumentationView>,
        scheduler: Arc<PollScheduler>,
        interval: Duration,
    ) -> Self {
        MonitoredInstance {
            state: InstanceState::new(id, view, scheduler, interval),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.state.id
    }

    /// Register a listener; the first one starts polling.
    ///
    /// Returns false if the instance is already detached.
    pub fn add_listener(&self, listener: Arc<dyn InstanceListener>) -> bool {
        if self.is_detached() {
            return false;
        }
        self.state.registry.add_listener(listener);
        true
    }

    pub fn remove_listener(&self, listener: &Arc<dyn InstanceListener>) -> bool {
        self.state.registry.remove_listener(listener)
    }

    pub fn set_interval(&self, interval: Duration) {
        self.state.registry.set_interval(interval);
    }

    pub fn interval(&self) -> Duration {
        self.state.registry.interval()
    }

    pub fn listener_count(&self) -> usize {
        self.state.registry.listener_count()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.is_detached() {
            Lifecycle::Detached
        } else if self.state.registry.task().is_some() {
            Lifecycle::Polling
        } else {
            Lifecycle::Attached
        }
    }

    pub fn is_detached(&self) -> bool {
        self.state.detached.load(Ordering::SeqCst)
    }

    /// Sample the instance now, outside the poll schedule.
    pub fn snapshot(&self) -> Result<VariableSnapshot> {
        self.state.sample()
    }

    /// Run one poll tick on the calling thread.
    pub fn poll_now(&self) {
        self.state.poll();
    }

    pub(crate) fn detach(&self) -> bool {
        self.state.detach()
    }
}

impl std::fmt::Debug for MonitoredInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredInstance")
            .field("id", &self.id())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
