//! Host change detector.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use vw_common::{HostId, InstanceId};

use super::events::{HostListener, VmStatusChangeEvent};
use crate::diff::SetDiff;
use crate::discovery::ProcessDirectoryScanner;
use crate::logging::event_names;
use crate::registry::ListenerRegistry;
use crate::scheduler::{PollJob, PollScheduler};

/// What a scan that finds no instances means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyScanPolicy {
    /// Treat it as a transient glitch: fire nothing and keep the last set.
    #[default]
    Ignore,
    /// Report every previously seen instance as terminated.
    Report,
}

impl std::str::FromStr for EmptyScanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Ok(EmptyScanPolicy::Ignore),
            "report" => Ok(EmptyScanPolicy::Report),
            _ => Err(format!("invalid empty scan policy: {}", s)),
        }
    }
}

/// Poll state of one host. Owned by [`super::MonitoredHost`]; the scheduled
/// job only holds a weak reference.
pub(crate) struct HostState {
    host: HostId,
    scanner: Arc<ProcessDirectoryScanner>,
    user: Option<String>,
    policy: EmptyScanPolicy,
    previous: Mutex<BTreeSet<InstanceId>>,
    pub(crate) registry: ListenerRegistry<dyn HostListener>,
}

impl HostState {
    pub(crate) fn new(
        host: HostId,
        scanner: Arc<ProcessDirectoryScanner>,
        user: Option<String>,
        policy: EmptyScanPolicy,
        scheduler: Arc<PollScheduler>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<HostState>| {
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
            HostState {
                host,
                scanner,
                user,
                policy,
                previous: Mutex::new(BTreeSet::new()),
                registry: ListenerRegistry::new(scheduler, interval, factory),
            }
        })
    }

    pub(crate) fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub(crate) fn policy(&self) -> EmptyScanPolicy {
        self.policy
    }

    /// One tick: scan, diff against the last scan, notify.
    pub(crate) fn poll(&self) {
        let current = self.scanner.scan(self.user.as_deref());

        if current.is_empty() && self.policy == EmptyScanPolicy::Ignore {
            debug!(
                event = event_names::HOST_EMPTY_SCAN,
                host = %self.host,
                "empty scan ignored"
            );
            return;
        }

        // Read and replace under one lock so concurrent ticks each diff
        // against a distinct baseline.
        let previous = {
            let mut slot = self.previous.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *slot, current.clone())
        };
        let diff = SetDiff::between(&previous, &current);

        trace!(
            event = event_names::HOST_POLL,
            host = %self.host,
            active = current.len(),
            started = diff.inserted.len(),
            terminated = diff.removed.len(),
            "host poll"
        );
        if diff.is_empty() {
            return;
        }

        let event = VmStatusChangeEvent {
            host: self.host.clone(),
            timestamp: Utc::now(),
            active: current,
            started: diff.inserted,
            terminated: diff.removed,
        };
        self.registry
            .fire("vm_status_changed", |l| l.on_vm_status_changed(&event));
    }
}
