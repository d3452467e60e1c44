//! Structured logging for vw-core.
//!
//! - stdout is reserved for command payloads (JSON lines)
//! - stderr receives all log output, human-readable or JSONL
//!
//! Poll ticks run on the scheduler thread, so log records carry stable
//! `event` names (see [`event_names`]) instead of relying on span context.

pub mod config;

pub use config::{LogConfig, LogFormat, LogLevel};

use std::io::IsTerminal;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Stable event names attached to log records as the `event` field.
pub mod event_names {
    pub const SCAN_ROOT_UNREADABLE: &str = "scan.root_unreadable";
    pub const SCAN_COMPLETE: &str = "scan.complete";

    pub const ATTACH_NATIVE: &str = "attach.native";
    pub const ATTACH_FALLBACK: &str = "attach.fallback";
    pub const ATTACH_FAILED: &str = "attach.failed";
    pub const DETACH: &str = "attach.detach";

    pub const TASK_SCHEDULED: &str = "task.scheduled";
    pub const TASK_RESCHEDULED: &str = "task.rescheduled";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const TASK_RUN: &str = "task.run";
    pub const TASK_PANICKED: &str = "task.panicked";

    pub const LISTENER_PANICKED: &str = "listener.panicked";

    pub const HOST_POLL: &str = "host.poll";
    pub const HOST_EMPTY_SCAN: &str = "host.empty_scan";
    pub const INSTANCE_POLL: &str = "instance.poll";
    pub const INSTANCE_DECODE_FAILED: &str = "instance.decode_failed";
}

/// Initialize the logging subsystem.
///
/// An explicit level applies to the vmwatch crates with everything else at
/// `warn`. Without one, `RUST_LOG` is used when it parses as a filter, else
/// `info`. Calling this twice is a no-op.
pub fn init_logging(config: &LogConfig) {
    let filter = match config.level {
        Some(level) => crate_filter(level.into()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| crate_filter(LevelFilter::INFO)),
    };

    let result = match config.format {
        LogFormat::Human => {
            let use_ansi = std::io::stderr().is_terminal();
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_names(false)
                .with_ansi(use_ansi);

            if config.timestamps {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer)
                    .try_init()
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer.without_time())
                    .try_init()
            }
        }
        LogFormat::Jsonl => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(false)
                    .flatten_event(true),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}

fn crate_filter(level: LevelFilter) -> EnvFilter {
    let mut filter = EnvFilter::default().add_directive(LevelFilter::WARN.into());
    for krate in ["vw_core", "vmwatch"] {
        if let Ok(directive) = format!("{}={}", krate, level).parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}
