//! vmwatch common types, IDs, and errors.
//!
//! This crate provides foundational types shared across vw-core modules:
//! - Instance and host identity types
//! - The unified error type with stable codes

pub mod error;
pub mod id;

pub use error::{Error, ErrorCategory, ErrorReport, Result};
pub use id::{HostId, InstanceId};
