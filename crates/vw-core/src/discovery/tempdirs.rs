//! Temporary directory resolution, container aware.
//!
//! A process running in another mount namespace writes its backing file into
//! its own `/tmp`, which the host sees as `/proc/<pid>/root/tmp`. Inside that
//! namespace the file is named after the namespace-local pid.

use std::fs;
use std::path::{Path, PathBuf};

use vw_common::InstanceId;

/// Host/user-identity and temp-directory resolution.
pub trait TempDirectories: Send + Sync {
    /// Ordered directory roots that may hold backing files.
    ///
    /// `id` of [`InstanceId::SELF`] asks for the roots to scan for all
    /// instances; a specific id adds roots visible only to that process.
    fn temporary_directories(&self, user: Option<&str>, id: InstanceId) -> Vec<PathBuf>;

    /// The id `id` is known by inside its own pid namespace.
    fn namespace_local_id(&self, id: InstanceId) -> InstanceId;
}

/// Default resolver backed by the host filesystem and procfs.
#[derive(Debug, Clone)]
pub struct HostTempDirs {
    roots: Vec<PathBuf>,
    proc_root: PathBuf,
}

impl HostTempDirs {
    pub fn new() -> Self {
        HostTempDirs {
            roots: vec![default_temp_dir()],
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Replace the scanned roots. An empty list keeps the default.
    pub fn with_roots(mut self, roots: Vec<PathBuf>) -> Self {
        if !roots.is_empty() {
            self.roots = roots;
        }
        self
    }

    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn process_dir(&self, id: InstanceId) -> PathBuf {
        self.proc_root.join(id.to_string())
    }

    /// Whether `id` lives in a different mount namespace than we do.
    fn in_foreign_mount_ns(&self, id: InstanceId) -> bool {
        let theirs = fs::read_link(self.process_dir(id).join("ns/mnt"));
        let ours = fs::read_link(self.proc_root.join("self/ns/mnt"));
        match (theirs, ours) {
            (Ok(theirs), Ok(ours)) => theirs != ours,
            _ => false,
        }
    }
}

impl Default for HostTempDirs {
    fn default() -> Self {
        Self::new()
    }
}

impl TempDirectories for HostTempDirs {
    fn temporary_directories(&self, _user: Option<&str>, id: InstanceId) -> Vec<PathBuf> {
        if id.is_self() || !self.in_foreign_mount_ns(id) {
            return self.roots.clone();
        }

        let container_root = self.process_dir(id).join("root");
        let mut dirs: Vec<PathBuf> = self
            .roots
            .iter()
            .map(|root| container_root.join(strip_root(root)))
            .collect();
        dirs.extend(self.roots.iter().cloned());
        dirs
    }

    fn namespace_local_id(&self, id: InstanceId) -> InstanceId {
        if id.is_self() {
            return id;
        }
        fs::read_to_string(self.process_dir(id).join("status"))
            .ok()
            .and_then(|status| parse_nspid(&status))
            .unwrap_or(id)
    }
}

/// Extract the innermost pid from the `NSpid:` line of a status file.
pub fn parse_nspid(status: &str) -> Option<InstanceId> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("NSpid:"))
        .and_then(|rest| rest.split_whitespace().last())
        .and_then(|pid| pid.parse::<u32>().ok())
        .map(InstanceId)
}

fn strip_root(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}

/// Runtimes write to `/tmp` regardless of `TMPDIR` on unix.
fn default_temp_dir() -> PathBuf {
    if cfg!(unix) {
        PathBuf::from("/tmp")
    } else {
        std::env::temp_dir()
    }
}
