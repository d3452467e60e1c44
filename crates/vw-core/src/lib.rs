//! vmwatch core library
//!
//! Discovers locally running runtime instances through their shared
//! instrumentation files and notifies listeners when the instance set or an
//! instance's published variables change:
//! - Process directory scanning and backing-file resolution
//! - Read-only attach with legacy fallback
//! - A shared poll scheduler and per-entity listener registries
//! - Host and per-instance change detection
//!
//! The binary entry point is in `main.rs`.

pub mod attach;
pub mod config;
pub mod diff;
pub mod discovery;
pub mod exit_codes;
pub mod logging;
pub mod monitor;
pub mod perfdata;
pub mod registry;
pub mod scheduler;

// Re-export test utilities for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use monitor::{
    EmptyScanPolicy, HostListener, InstanceListener, MonitoredHost, MonitoredInstance,
};
pub use vw_common::{Error, HostId, InstanceId, Result};
