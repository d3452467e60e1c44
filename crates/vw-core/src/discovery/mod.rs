//! Local instance discovery.
//!
//! Instances publish their instrumentation region as a file under the
//! system temporary directory. Two naming generations are recognised:
//!
//! - current: `<tmp>/hsperfdata_<user>/<pid>`
//! - legacy:  `<tmp>/hsperfdata_<pid>[_<variant>]`
//!
//! # Data Sources
//! - Temporary directory roots from [`TempDirectories`]
//! - `/proc/<pid>/root` and `/proc/<pid>/status` for containerised processes

pub mod scanner;
pub mod tempdirs;

pub use scanner::{BackingGeneration, BackingLocation, ProcessDirectoryScanner};
pub use tempdirs::{HostTempDirs, TempDirectories};
