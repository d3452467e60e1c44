//! Shared buffer attach.
//!
//! The native path maps the current-generation backing file. When it reports
//! the instance as absent, the attacher falls back to a legacy flat file for
//! the same id before giving up.

pub mod mapped;

use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use vw_common::{Error, InstanceId, Result};

use crate::discovery::ProcessDirectoryScanner;
use crate::logging::event_names;

pub use mapped::MappedRegion;

/// Access requested on attach. Only read access is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachMode {
    #[default]
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for AttachMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachMode::ReadOnly => write!(f, "r"),
            AttachMode::ReadWrite => write!(f, "rw"),
        }
    }
}

/// How an attached buffer was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachSource {
    Native,
    Legacy,
    /// Built from bytes in memory rather than a backing file.
    Detached,
}

enum Backing {
    Mapped(MappedRegion),
    Heap(Vec<u8>),
}

/// Read-only view over one instance's instrumentation region.
///
/// Released exactly once, when the last owner drops it.
pub struct AttachedBuffer {
    id: InstanceId,
    path: Option<PathBuf>,
    source: AttachSource,
    backing: Backing,
}

impl AttachedBuffer {
    /// Map `path` read-only at its current size.
    pub fn map_file(id: InstanceId, path: &Path, source: AttachSource) -> io::Result<Self> {
        let file = File::open(path)?;
        let region = MappedRegion::map(&file)?;
        Ok(AttachedBuffer {
            id,
            path: Some(path.to_path_buf()),
            source,
            backing: Backing::Mapped(region),
        })
    }

    /// A buffer over owned bytes, used when no backing file exists.
    pub fn from_bytes(id: InstanceId, bytes: Vec<u8>) -> Self {
        AttachedBuffer {
            id,
            path: None,
            source: AttachSource::Detached,
            backing: Backing::Heap(bytes),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn source(&self) -> AttachSource {
        self.source
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(region) => region.as_slice(),
            Backing::Heap(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl fmt::Debug for AttachedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedBuffer")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("source", &self.source)
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for AttachedBuffer {
    fn drop(&mut self) {
        debug!(
            event = event_names::DETACH,
            instance = %self.id,
            source = ?self.source,
            "released instrumentation buffer"
        );
    }
}

/// Outcome of the native attach path.
#[derive(Debug)]
pub enum NativeAttach {
    Attached(AttachedBuffer),
    /// No current-generation backing file for the id.
    NotFound,
    NotPermitted(io::Error),
    Failed(io::Error),
}

/// Platform attach primitives.
pub trait PlatformAttach: Send + Sync {
    /// Attach through the current-generation convention.
    fn attach(&self, id: InstanceId, mode: AttachMode) -> NativeAttach;

    /// Map a legacy-format backing file read-only.
    fn legacy_map(&self, id: InstanceId, path: &Path) -> io::Result<AttachedBuffer> {
        AttachedBuffer::map_file(id, path, AttachSource::Legacy)
    }
}

/// Default platform: maps `<tmp>/hsperfdata_<user>/<nsid>`.
pub struct LocalPlatform {
    scanner: Arc<ProcessDirectoryScanner>,
    user: Option<String>,
}

impl LocalPlatform {
    pub fn new(scanner: Arc<ProcessDirectoryScanner>) -> Self {
        LocalPlatform {
            scanner,
            user: None,
        }
    }

    /// Only look in the directory of `user`.
    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }
}

impl PlatformAttach for LocalPlatform {
    fn attach(&self, id: InstanceId, mode: AttachMode) -> NativeAttach {
        if mode != AttachMode::ReadOnly {
            return NativeAttach::Failed(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported attach mode: {}", mode),
            ));
        }
        let Some(path) = self.scanner.resolve_current_file(id, self.user.as_deref()) else {
            return NativeAttach::NotFound;
        };
        match AttachedBuffer::map_file(id, &path, AttachSource::Native) {
            Ok(buffer) => NativeAttach::Attached(buffer),
            // Raced with process exit.
            Err(err) if err.kind() == io::ErrorKind::NotFound => NativeAttach::NotFound,
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                NativeAttach::NotPermitted(err)
            }
            Err(err) => NativeAttach::Failed(err),
        }
    }
}

/// Attaches to instances, native path first and legacy second.
#[derive(Clone)]
pub struct Attacher {
    platform: Arc<dyn PlatformAttach>,
    scanner: Arc<ProcessDirectoryScanner>,
}

impl Attacher {
    pub fn new(platform: Arc<dyn PlatformAttach>, scanner: Arc<ProcessDirectoryScanner>) -> Self {
        Attacher { platform, scanner }
    }

    /// Obtain a read-only view of the instrumentation region of `id`.
    pub fn attach(&self, id: InstanceId) -> Result<AttachedBuffer> {
        match self.platform.attach(id, AttachMode::ReadOnly) {
            NativeAttach::Attached(buffer) => {
                info!(
                    event = event_names::ATTACH_NATIVE,
                    instance = %id,
                    bytes = buffer.len(),
                    "attached"
                );
                Ok(buffer)
            }
            NativeAttach::NotFound => self.attach_legacy(id),
            NativeAttach::NotPermitted(source) | NativeAttach::Failed(source) => {
                warn!(
                    event = event_names::ATTACH_FAILED,
                    instance = %id,
                    error = %source,
                    "native attach failed"
                );
                Err(Error::AttachFailure { id, source })
            }
        }
    }

    fn attach_legacy(&self, id: InstanceId) -> Result<AttachedBuffer> {
        let Some(path) = self.scanner.resolve_legacy_file(id) else {
            debug!(instance = %id, "no backing file in either convention");
            return Err(Error::NotFound { id });
        };
        match self.platform.legacy_map(id, &path) {
            Ok(buffer) => {
                info!(
                    event = event_names::ATTACH_FALLBACK,
                    instance = %id,
                    path = %path.display(),
                    bytes = buffer.len(),
                    "attached via legacy backing file"
                );
                Ok(buffer)
            }
            Err(source) => {
                warn!(
                    event = event_names::ATTACH_FAILED,
                    instance = %id,
                    path = %path.display(),
                    error = %source,
                    "legacy attach failed"
                );
                Err(Error::AttachFailure { id, source })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::HostTempDirs;
    use std::sync::Mutex;

    fn scanner_for(root: &Path) -> Arc<ProcessDirectoryScanner> {
        let dirs = HostTempDirs::new()
            .with_roots(vec![root.to_path_buf()])
            .with_proc_root(root.join("no-proc"));
        Arc::new(ProcessDirectoryScanner::new(Arc::new(dirs)))
    }

    /// Platform whose native outcome is fixed per test.
    struct StubPlatform {
        outcome: Mutex<Option<NativeAttach>>,
    }

    impl StubPlatform {
        fn new(outcome: NativeAttach) -> Arc<Self> {
            Arc::new(StubPlatform {
                outcome: Mutex::new(Some(outcome)),
            })
        }
    }

    impl PlatformAttach for StubPlatform {
        fn attach(&self, _id: InstanceId, _mode: AttachMode) -> NativeAttach {
            self.outcome
                .lock()
                .unwrap()
                .take()
                .unwrap_or(NativeAttach::NotFound)
        }
    }

    #[test]
    fn test_native_path_maps_current_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("hsperfdata_alice")).unwrap();
        std::fs::write(tmp.path().join("hsperfdata_alice/42"), b"region").unwrap();

        let scanner = scanner_for(tmp.path());
        let attacher = Attacher::new(Arc::new(LocalPlatform::new(scanner.clone())), scanner);
        let buffer = attacher.attach(InstanceId(42)).unwrap();
        assert_eq!(buffer.as_bytes(), b"region");
        assert_eq!(buffer.source(), AttachSource::Native);
        assert_eq!(buffer.id(), InstanceId(42));
    }

    #[test]
    fn test_not_found_falls_back_to_legacy() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("hsperfdata_42"), b"legacy").unwrap();

        let scanner = scanner_for(tmp.path());
        let attacher = Attacher::new(Arc::new(LocalPlatform::new(scanner.clone())), scanner);
        let buffer = attacher.attach(InstanceId(42)).unwrap();
        assert_eq!(buffer.as_bytes(), b"legacy");
        assert_eq!(buffer.source(), AttachSource::Legacy);
    }

    #[test]
    fn test_absent_everywhere_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let scanner = scanner_for(tmp.path());
        let attacher = Attacher::new(Arc::new(LocalPlatform::new(scanner.clone())), scanner);
        let err = attacher.attach(InstanceId(42)).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_not_permitted_is_attach_failure() {
        let tmp = tempfile::tempdir().unwrap();
        // A legacy file exists but must not be used: only NotFound falls back.
        std::fs::write(tmp.path().join("hsperfdata_42"), b"legacy").unwrap();

        let platform = StubPlatform::new(NativeAttach::NotPermitted(io::Error::from(
            io::ErrorKind::PermissionDenied,
        )));
        let attacher = Attacher::new(platform, scanner_for(tmp.path()));
        match attacher.attach(InstanceId(42)) {
            Err(Error::AttachFailure { id, source }) => {
                assert_eq!(id, InstanceId(42));
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("expected attach failure, got {:?}", other),
        }
    }

    #[test]
    fn test_legacy_map_error_is_attach_failure() {
        let tmp = tempfile::tempdir().unwrap();
        // Empty files cannot be mapped.
        std::fs::write(tmp.path().join("hsperfdata_42"), b"").unwrap();

        let platform = StubPlatform::new(NativeAttach::NotFound);
        let attacher = Attacher::new(platform, scanner_for(tmp.path()));
        let err = attacher.attach(InstanceId(42)).unwrap_err();
        assert!(matches!(err, Error::AttachFailure { .. }));
    }

    #[test]
    fn test_read_write_mode_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let platform = LocalPlatform::new(scanner_for(tmp.path()));
        assert!(matches!(
            platform.attach(InstanceId(1), AttachMode::ReadWrite),
            NativeAttach::Failed(_)
        ));
    }

    #[test]
    fn test_from_bytes_buffer() {
        let buffer = AttachedBuffer::from_bytes(InstanceId(5), vec![1, 2, 3]);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.source(), AttachSource::Detached);
        assert!(buffer.path().is_none());
    }
}
