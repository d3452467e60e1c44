//! Monitored hosts and instances.
//!
//! A [`MonitoredHost`] watches the set of running instances on one machine and
//! attaches to individual instances on request. Both kinds of entity poll on
//! a shared [`PollScheduler`] only while they have listeners.

pub mod events;
pub mod host;
pub mod instance;

pub use events::{
    HostListener, InstanceListener, MonitorEvent, MonitorStatusChangeEvent, MonitorsUpdatedEvent,
    VmStatusChangeEvent,
};
pub use host::EmptyScanPolicy;
pub use instance::{Lifecycle, MonitoredInstance};

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::debug;

use vw_common::{Error, HostId, InstanceId, Result};

use crate::attach::{Attacher, LocalPlatform, PlatformAttach};
use crate::config::MonitorConfig;
use crate::discovery::{HostTempDirs, ProcessDirectoryScanner, TempDirectories};
use crate::perfdata::{Decoder, PerfDataDecoder};
use crate::scheduler::PollScheduler;
use host::HostState;

/// Scheduler shared by every host built with [`MonitoredHost::local`].
static SHARED_SCHEDULER: Lazy<Mutex<Weak<PollScheduler>>> = Lazy::new(|| Mutex::new(Weak::new()));

/// The process-wide scheduler, started on first use and stopped when the
/// last host using it is dropped.
pub fn shared_scheduler() -> std::io::Result<Arc<PollScheduler>> {
    let mut slot = SHARED_SCHEDULER.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(scheduler) = slot.upgrade() {
        return Ok(scheduler);
    }
    let scheduler = Arc::new(PollScheduler::new()?);
    *slot = Arc::downgrade(&scheduler);
    Ok(scheduler)
}

/// Assembles a [`MonitoredHost`] from its collaborators.
pub struct MonitoredHostBuilder {
    host: HostId,
    scheduler: Option<Arc<PollScheduler>>,
    temp_dirs: Option<Arc<dyn TempDirectories>>,
    platform: Option<Arc<dyn PlatformAttach>>,
    decoder: Option<Arc<dyn Decoder>>,
    user: Option<String>,
    host_interval: Duration,
    instance_interval: Duration,
    empty_scan: EmptyScanPolicy,
}

impl MonitoredHostBuilder {
    pub fn new(host: HostId) -> Self {
        let defaults = MonitorConfig::default();
        MonitoredHostBuilder {
            host,
            scheduler: None,
            temp_dirs: None,
            platform: None,
            decoder: None,
            user: None,
            host_interval: defaults.host_interval(),
            instance_interval: defaults.instance_interval(),
            empty_scan: defaults.empty_scan,
        }
    }

    /// Take intervals, user filter, roots and empty-scan policy from `config`.
    pub fn config(mut self, config: &MonitorConfig) -> Self {
        self.host_interval = config.host_interval();
        self.instance_interval = config.instance_interval();
        self.user = config.user.clone();
        self.empty_scan = config.empty_scan;
        if !config.temp_roots.is_empty() && self.temp_dirs.is_none() {
            let dirs: Arc<dyn TempDirectories> =
                Arc::new(HostTempDirs::new().with_roots(config.temp_roots.clone()));
            self.temp_dirs = Some(dirs);
        }
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<PollScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn temp_dirs(mut self, temp_dirs: Arc<dyn TempDirectories>) -> Self {
        self.temp_dirs = Some(temp_dirs);
        self
    }

    pub fn platform(mut self, platform: Arc<dyn PlatformAttach>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn host_interval(mut self, interval: Duration) -> Self {
        self.host_interval = interval;
        self
    }

    pub fn instance_interval(mut self, interval: Duration) -> Self {
        self.instance_interval = interval;
        self
    }

    pub fn empty_scan(mut self, policy: EmptyScanPolicy) -> Self {
        self.empty_scan = policy;
        self
    }

    pub fn build(self) -> Result<MonitoredHost> {
        if !self.host.is_local() {
            return Err(Error::UnsupportedProtocol(self.host.to_string()));
        }
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => shared_scheduler()?,
        };
        let temp_dirs: Arc<dyn TempDirectories> = match self.temp_dirs {
            Some(temp_dirs) => temp_dirs,
            None => Arc::new(HostTempDirs::new()),
        };
        let scanner = Arc::new(ProcessDirectoryScanner::new(temp_dirs));
        let platform: Arc<dyn PlatformAttach> = match self.platform {
            Some(platform) => platform,
            None => Arc::new(LocalPlatform::new(scanner.clone()).with_user(self.user.clone())),
        };
        let decoder: Arc<dyn Decoder> = match self.decoder {
            Some(decoder) => decoder,
            None => Arc::new(PerfDataDecoder::new()),
        };

        let state = HostState::new(
            self.host.clone(),
            scanner.clone(),
            self.user,
            self.empty_scan,
            scheduler.clone(),
            self.host_interval,
        );
        debug!(host = %self.host, "monitored host ready");

        Ok(MonitoredHost {
            host: self.host,
            scheduler,
            attacher: Attacher::new(platform, scanner.clone()),
            scanner,
            decoder,
            instance_interval: self.instance_interval,
            state,
        })
    }
}

/// Entry point for monitoring the instances of one host.
pub struct MonitoredHost {
    host: HostId,
    scheduler: Arc<PollScheduler>,
    scanner: Arc<ProcessDirectoryScanner>,
    attacher: Attacher,
    decoder: Arc<dyn Decoder>,
    instance_interval: Duration,
    state: Arc<HostState>,
}

impl MonitoredHost {
    pub fn builder(host: HostId) -> MonitoredHostBuilder {
        MonitoredHostBuilder::new(host)
    }

    /// The local host on the shared scheduler.
    pub fn local(config: &MonitorConfig) -> Result<Self> {
        Self::builder(HostId::local()).config(config).build()
    }

    /// Monitor `host`. Only local hosts have a provider.
    pub fn for_host(host: &HostId, config: &MonitorConfig) -> Result<Self> {
        Self::builder(host.clone()).config(config).build()
    }

    pub fn host_id(&self) -> &HostId {
        &self.host
    }

    pub fn scheduler(&self) -> &Arc<PollScheduler> {
        &self.scheduler
    }

    pub fn scanner(&self) -> &Arc<ProcessDirectoryScanner> {
        &self.scanner
    }

    /// Ids of the instances running right now.
    pub fn list_active(&self) -> BTreeSet<InstanceId> {
        self.scanner.scan(self.state.user())
    }

    /// Diagnostic lookup of the backing file of `id`.
    pub fn resolve_file(&self, id: InstanceId) -> Option<PathBuf> {
        self.scanner.resolve_file(id, self.state.user())
    }

    /// Attach to `id` and decode its region, polling at `interval` once
    /// listeners are added.
    pub fn attach_to(&self, id: InstanceId, interval: Duration) -> Result<MonitoredInstance> {
        let buffer = Arc::new(self.attacher.attach(id)?);
        let view = self.decoder.decode(buffer, id)?;
        Ok(MonitoredInstance::new(
            id,
            view,
            self.scheduler.clone(),
            interval,
        ))
    }

    /// Attach using the configured instance interval.
    pub fn attach(&self, id: InstanceId) -> Result<MonitoredInstance> {
        self.attach_to(id, self.instance_interval)
    }

    /// Stop polling `instance` and release its buffer.
    pub fn detach(&self, instance: &MonitoredInstance) -> bool {
        instance.detach()
    }

    pub fn add_listener(&self, listener: Arc<dyn HostListener>) {
        self.state.registry.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn HostListener>) -> bool {
        self.state.registry.remove_listener(listener)
    }

    pub fn set_interval(&self, interval: Duration) {
        self.state.registry.set_interval(interval);
    }

    pub fn interval(&self) -> Duration {
        self.state.registry.interval()
    }

    pub fn empty_scan_policy(&self) -> EmptyScanPolicy {
        self.state.policy()
    }

    pub fn instance_interval(&self) -> Duration {
        self.instance_interval
    }

    /// Run one host poll tick on the calling thread.
    pub fn poll_now(&self) {
        self.state.poll();
    }
}

impl std::fmt::Debug for MonitoredHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredHost")
            .field("host", &self.host)
            .field("interval", &self.interval())
            .finish()
    }
}
