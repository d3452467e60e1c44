//! vmwatch - local runtime instance monitor
//!
//! The main entry point, handling:
//! - Listing running instances and locating their backing files
//! - One-shot decoding of an instance's variables
//! - Continuous watching with events printed as JSON lines

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{info, warn};

use vw_common::{Error, ErrorReport, HostId, InstanceId};
use vw_core::config::{load_config, ConfigOptions, MonitorConfig};
use vw_core::exit_codes::ExitCode;
use vw_core::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use vw_core::monitor::{
    HostListener, InstanceListener, MonitorEvent, MonitorStatusChangeEvent, MonitoredHost,
    MonitoredInstance, MonitorsUpdatedEvent, VmStatusChangeEvent,
};
use vw_core::perfdata::VariableSnapshot;

/// vmwatch - watch local runtime instances through their instrumentation files
#[derive(Parser)]
#[command(name = "vmwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Config file (TOML)
    #[arg(long, global = true, env = "VW_CONFIG")]
    config: Option<PathBuf>,

    /// Host to monitor; only the local host is supported
    #[arg(long, global = true, default_value = "local://localhost")]
    host: String,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format on stderr (human, jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the ids of running instances
    List(ListArgs),
    /// Print the backing file of an instance
    Locate(LocateArgs),
    /// Attach once and print the decoded variables
    Dump(DumpArgs),
    /// Print instance start/stop (and optionally variable) events until interrupted
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Only instances owned by this user
    #[arg(long)]
    user: Option<String>,
}

#[derive(Args, Debug)]
struct LocateArgs {
    /// Instance id
    id: u32,

    /// Only look in this user's directory
    #[arg(long)]
    user: Option<String>,
}

#[derive(Args, Debug)]
struct DumpArgs {
    /// Instance id
    id: u32,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Also attach to every started instance and report variable changes
    #[arg(long)]
    instances: bool,

    /// Host scan interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Per-instance sample interval in milliseconds
    #[arg(long)]
    instance_interval_ms: Option<u64>,

    /// Stop after this many seconds
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Only instances owned by this user
    #[arg(long)]
    user: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let cli_level = if cli.global.quiet {
        Some(LogLevel::Error)
    } else {
        match cli.global.verbose {
            0 => cli.global.log_level,
            1 => Some(LogLevel::Debug),
            _ => Some(LogLevel::Trace),
        }
    };
    init_logging(&LogConfig::from_env(cli_level, cli.global.log_format));

    let exit_code = match run(&cli) {
        Ok(code) => code,
        Err(err) => report_error(&err),
    };
    std::process::exit(exit_code.as_i32());
}

fn run(cli: &Cli) -> Result<ExitCode, Error> {
    let resolved = load_config(&ConfigOptions {
        config_path: cli.global.config.clone(),
    })?;
    let mut config = resolved.config;
    if let Some(path) = &resolved.path {
        info!(path = %path.display(), "loaded config");
    }
    let host_id = HostId::parse(&cli.global.host)?;

    match &cli.command {
        Commands::List(args) => {
            override_user(&mut config, &args.user);
            run_list(&host_id, &config)
        }
        Commands::Locate(args) => {
            override_user(&mut config, &args.user);
            run_locate(&host_id, &config, args)
        }
        Commands::Dump(args) => run_dump(&host_id, &config, args),
        Commands::Watch(args) => {
            override_user(&mut config, &args.user);
            if let Some(ms) = args.interval_ms {
                config.host_interval_ms = ms;
            }
            if let Some(ms) = args.instance_interval_ms {
                config.instance_interval_ms = ms;
            }
            config.validate()?;
            run_watch(&host_id, &config, args)
        }
    }
}

fn override_user(config: &mut MonitorConfig, user: &Option<String>) {
    if user.is_some() {
        config.user = user.clone();
    }
}

fn report_error(err: &Error) -> ExitCode {
    let report = ErrorReport::from(err);
    match serde_json::to_string(&report) {
        Ok(json) => eprintln!("{}", json),
        Err(_) => eprintln!("vmwatch: {}", err),
    }
    ExitCode::from(err)
}

/// Write one JSON document per line to stdout.
fn print_json<T: Serialize>(value: &T) -> Result<(), Error> {
    let line = serde_json::to_string(value)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{}", line)?;
    out.flush()?;
    Ok(())
}

// ============================================================================
// list / locate / dump
// ============================================================================

#[derive(Serialize)]
struct ListOutput<'a> {
    host: &'a HostId,
    instances: Vec<InstanceId>,
}

fn run_list(host_id: &HostId, config: &MonitorConfig) -> Result<ExitCode, Error> {
    let host = MonitoredHost::for_host(host_id, config)?;
    let instances = host.list_active().into_iter().collect();
    print_json(&ListOutput {
        host: host.host_id(),
        instances,
    })?;
    Ok(ExitCode::Clean)
}

#[derive(Serialize)]
struct LocateOutput {
    id: InstanceId,
    path: PathBuf,
}

fn run_locate(
    host_id: &HostId,
    config: &MonitorConfig,
    args: &LocateArgs,
) -> Result<ExitCode, Error> {
    let host = MonitoredHost::for_host(host_id, config)?;
    let id = InstanceId(args.id);
    let path = host.resolve_file(id).ok_or(Error::NotFound { id })?;
    print_json(&LocateOutput { id, path })?;
    Ok(ExitCode::Clean)
}

#[derive(Serialize)]
struct DumpOutput {
    id: InstanceId,
    variables: VariableSnapshot,
}

fn run_dump(host_id: &HostId, config: &MonitorConfig, args: &DumpArgs) -> Result<ExitCode, Error> {
    let host = MonitoredHost::for_host(host_id, config)?;
    let id = InstanceId(args.id);
    let instance = host.attach(id)?;
    let variables = instance.snapshot()?;
    host.detach(&instance);
    print_json(&DumpOutput { id, variables })?;
    Ok(ExitCode::Clean)
}

// ============================================================================
// watch
// ============================================================================

/// Prints every event it sees as a JSON line.
struct JsonlPrinter;

impl JsonlPrinter {
    fn emit(&self, event: MonitorEvent) {
        if let Err(err) = print_json(&event) {
            warn!(error = %err, "failed to write event");
        }
    }
}

impl InstanceListener for JsonlPrinter {
    fn on_monitors_changed(&self, event: &MonitorStatusChangeEvent) {
        self.emit(event.clone().into());
    }

    fn on_updated(&self, _event: &MonitorsUpdatedEvent) {}
}

/// Prints host events and, when enabled, follows started instances.
struct HostWatcher {
    host: Weak<MonitoredHost>,
    follow_instances: bool,
    printer: Arc<JsonlPrinter>,
    attached: Mutex<HashMap<InstanceId, MonitoredInstance>>,
}

impl HostWatcher {
    fn follow(&self, host: &MonitoredHost, id: InstanceId) {
        match host.attach(id) {
            Ok(instance) => {
                let listener: Arc<dyn InstanceListener> = self.printer.clone();
                instance.add_listener(listener);
                self.attached
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id, instance);
            }
            Err(err) => warn!(instance = %id, error = %err, "cannot follow instance"),
        }
    }

    fn unfollow(&self, host: &MonitoredHost, id: InstanceId) {
        let removed = self
            .attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(instance) = removed {
            host.detach(&instance);
        }
    }

    fn detach_all(&self) {
        let attached: Vec<MonitoredInstance> = self
            .attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, instance)| instance)
            .collect();
        if let Some(host) = self.host.upgrade() {
            for instance in &attached {
                host.detach(instance);
            }
        }
    }
}

impl HostListener for HostWatcher {
    fn on_vm_status_changed(&self, event: &VmStatusChangeEvent) {
        self.printer.emit(event.clone().into());
        if !self.follow_instances {
            return;
        }
        let Some(host) = self.host.upgrade() else {
            return;
        };
        for id in &event.terminated {
            self.unfollow(&host, *id);
        }
        for id in &event.started {
            self.follow(&host, *id);
        }
    }
}

fn run_watch(host_id: &HostId, config: &MonitorConfig, args: &WatchArgs) -> Result<ExitCode, Error> {
    let host = Arc::new(MonitoredHost::for_host(host_id, config)?);
    let watcher = Arc::new(HostWatcher {
        host: Arc::downgrade(&host),
        follow_instances: args.instances,
        printer: Arc::new(JsonlPrinter),
        attached: Mutex::new(HashMap::new()),
    });

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    let listener: Arc<dyn HostListener> = watcher.clone();
    host.add_listener(listener.clone());
    info!(
        host = %host.host_id(),
        interval_ms = config.host_interval_ms,
        instances = args.instances,
        "watching"
    );

    match args.duration_secs {
        Some(secs) => {
            let _ = stop_rx.recv_timeout(Duration::from_secs(secs));
        }
        None => {
            let _ = stop_rx.recv();
        }
    }

    host.remove_listener(&listener);
    watcher.detach_all();
    info!("stopped");
    Ok(ExitCode::Clean)
}

