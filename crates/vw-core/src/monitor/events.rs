//! Events delivered to listeners, and the listener traits.
//!
//! Callbacks run synchronously on the poll scheduler thread and should return
//! quickly. A panicking callback is contained and logged.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use vw_common::{HostId, InstanceId};

use crate::perfdata::VariableHandle;

/// The set of running instances on a host changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmStatusChangeEvent {
    pub host: HostId,
    pub timestamp: DateTime<Utc>,
    /// Every instance seen by this scan.
    pub active: BTreeSet<InstanceId>,
    pub started: BTreeSet<InstanceId>,
    pub terminated: BTreeSet<InstanceId>,
}

/// Variables appeared in or disappeared from an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStatusChangeEvent {
    pub instance: InstanceId,
    pub timestamp: DateTime<Utc>,
    pub inserted: Vec<VariableHandle>,
    pub removed: Vec<VariableHandle>,
}

impl MonitorStatusChangeEvent {
    pub fn inserted_names(&self) -> BTreeSet<String> {
        self.inserted.iter().map(|v| v.name.clone()).collect()
    }

    pub fn removed_names(&self) -> BTreeSet<String> {
        self.removed.iter().map(|v| v.name.clone()).collect()
    }
}

/// An instance was sampled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorsUpdatedEvent {
    pub instance: InstanceId,
    pub timestamp: DateTime<Utc>,
    /// Number of variables in the sample.
    pub variables: usize,
}

pub trait HostListener: Send + Sync {
    fn on_vm_status_changed(&self, event: &VmStatusChangeEvent);
}

pub trait InstanceListener: Send + Sync {
    fn on_monitors_changed(&self, event: &MonitorStatusChangeEvent);

    /// Fired after every sample, changed or not.
    fn on_updated(&self, _event: &MonitorsUpdatedEvent) {}
}

/// Tagged event for serialized output.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    VmStatusChanged(VmStatusChangeEvent),
    MonitorsChanged(MonitorStatusChangeEvent),
    MonitorsUpdated(MonitorsUpdatedEvent),
}

impl MonitorEvent {
    pub fn into_vm_status(self) -> Option<VmStatusChangeEvent> {
        match self {
            MonitorEvent::VmStatusChanged(event) => Some(event),
            _ => None,
        }
    }

    pub fn into_monitors_changed(self) -> Option<MonitorStatusChangeEvent> {
        match self {
            MonitorEvent::MonitorsChanged(event) => Some(event),
            _ => None,
        }
    }

    pub fn into_monitors_updated(self) -> Option<MonitorsUpdatedEvent> {
        match self {
            MonitorEvent::MonitorsUpdated(event) => Some(event),
            _ => None,
        }
    }
}

impl From<VmStatusChangeEvent> for MonitorEvent {
    fn from(event: VmStatusChangeEvent) -> Self {
        MonitorEvent::VmStatusChanged(event)
    }
}

impl From<MonitorStatusChangeEvent> for MonitorEvent {
    fn from(event: MonitorStatusChangeEvent) -> Self {
        MonitorEvent::MonitorsChanged(event)
    }
}

impl From<MonitorsUpdatedEvent> for MonitorEvent {
    fn from(event: MonitorsUpdatedEvent) -> Self {
        MonitorEvent::MonitorsUpdated(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_serialization() {
        let event = MonitorEvent::from(VmStatusChangeEvent {
            host: HostId::local(),
            timestamp: Utc::now(),
            active: [InstanceId(42)].into(),
            started: [InstanceId(42)].into(),
            terminated: BTreeSet::new(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "vm_status_changed");
        assert_eq!(json["started"], serde_json::json!([42]));
        assert_eq!(json["host"]["protocol"], "local");
    }

    #[test]
    fn test_change_event_names() {
        let event = MonitorStatusChangeEvent {
            instance: InstanceId(1),
            timestamp: Utc::now(),
            inserted: vec![VariableHandle::long("c", 1)],
            removed: vec![VariableHandle::long("b", 1)],
        };
        assert_eq!(event.inserted_names(), ["c".to_string()].into());
        assert_eq!(event.removed_names(), ["b".to_string()].into());
    }
}
