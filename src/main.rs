//! maintkit - command-line front end
//!
//! Thin shell over `Coordinator`: parses arguments, initialises the engine,
//! then renders events and results. All state lives in the engine.

use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use maintkit::cli::{Cli, Commands};
use maintkit::privilege::{elevation_check, run_preflight_check};
use maintkit::{Catalog, Coordinator, EngineConfig, ErrorKind, LogStore, OperationEvent, RunState, RunStatus};

/// Initialize diagnostics on stderr; `RUST_LOG` overrides the default `info`
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_logger();
    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    let coordinator = match initialize(&cli) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!("Initialization failed: {:#}", e);
            eprintln!("maintkit: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    install_interrupt_handler(&coordinator);

    match cli.command {
        Commands::List => list_operations(&coordinator),
        Commands::Run {
            operations,
            quiet,
            json,
        } => run_operations(&coordinator, &operations, quiet, json),
        Commands::Log { operation } => show_log(&coordinator, &operation),
        Commands::ClearLogs => clear_logs(&coordinator),
        Commands::ClearLog { operation } => clear_log(&coordinator, &operation),
    }

    ExitCode::SUCCESS
}

/// Load configuration, prepare the log directory and build the coordinator.
fn initialize(cli: &Cli) -> Result<Coordinator> {
    let config = EngineConfig::load_or_default(cli.config.as_deref())?;
    let log_dir = config.resolve_log_dir(cli.log_dir.as_deref())?;

    let store = LogStore::new(&log_dir);
    store
        .ensure_log_directory()
        .with_context(|| format!("Log directory {} is not usable", log_dir.display()))?;

    let elevation = elevation_check(cli.skip_elevation_check || config.skip_elevation_check);
    run_preflight_check(elevation.as_ref());

    info!(log_dir = %log_dir.display(), "maintkit ready");
    Ok(Coordinator::new(Catalog::builtin(), store, elevation))
}

/// Commands cannot be cancelled. The first Ctrl+C only reports what is still
/// running; a second one exits without waiting.
fn install_interrupt_handler(coordinator: &Coordinator) {
    let coordinator = coordinator.clone();
    let presses = AtomicUsize::new(0);

    let installed = ctrlc::set_handler(move || {
        let previous = presses.fetch_add(1, Ordering::SeqCst);
        if previous == 0 && coordinator.is_any_running() {
            let live = coordinator.live_children();
            eprintln!(
                "\nRunning maintenance commands cannot be cancelled; waiting for {} process(es) to finish.",
                live.len()
            );
            eprintln!("Press Ctrl+C again to exit without waiting (the commands keep running).");
        } else {
            std::process::exit(130);
        }
    });

    if let Err(e) = installed {
        warn!(error = %e, "Failed to install Ctrl+C handler");
    }
}

fn list_operations(coordinator: &Coordinator) {
    for op in coordinator.catalog().operations() {
        println!("{:<14} {}  (log: {})", op.id, op.display_name, op.log_id);
        for (i, step) in op.steps.iter().enumerate() {
            println!("    {}. {}", i + 1, step);
        }
    }
}

#[derive(Serialize)]
struct RunReport {
    runs: Vec<RunState>,
    rejected: Vec<RejectedStart>,
}

#[derive(Serialize)]
struct RejectedStart {
    operation_id: String,
    kind: ErrorKind,
    message: String,
}

fn run_operations(coordinator: &Coordinator, operations: &[String], quiet: bool, json: bool) {
    // Subscribe first so no Finished event can be missed
    let events = coordinator.subscribe();

    let mut seen = HashSet::new();
    let mut pending = HashSet::new();
    let mut rejected = Vec::new();

    for id in operations.iter().filter(|id| seen.insert(id.as_str())) {
        match coordinator.start(id) {
            Ok(state) => {
                if !quiet && !json {
                    println!("[{}] started ({} step(s))", id, state.progress.map_or(0, |p| p.total));
                }
                pending.insert(id.clone());
            }
            Err(e) => {
                if !json {
                    println!("[{}] not started: {}", id, e);
                }
                rejected.push(RejectedStart {
                    operation_id: id.clone(),
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        }
    }

    let mut runs = Vec::new();
    while !pending.is_empty() {
        match events.recv() {
            Ok(OperationEvent::Output { operation_id, line }) => {
                if !quiet && !json {
                    println!("[{}] {}", operation_id, line);
                }
            }
            Ok(OperationEvent::Finished(state)) => {
                if pending.remove(&state.operation_id) {
                    runs.push(state);
                }
            }
            Ok(OperationEvent::Started(_)) => {}
            Err(_) => break,
        }
    }
    coordinator.join_workers();

    if json {
        let report = RunReport { runs, rejected };
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("maintkit: failed to serialize run report: {}", e),
        }
        return;
    }

    for state in &runs {
        let detail = state
            .last_exit_info
            .as_ref()
            .map(|info| info.detail.as_str())
            .unwrap_or_default();
        let marker = if state.status == RunStatus::Succeeded { "✓" } else { "✗" };
        println!("{} {}: {} ({})", marker, state.operation_id, state.status.description(), detail);
        println!(
            "  log: {}",
            coordinator.log_store().path_for(&state.log_id).display()
        );
    }
}

fn show_log(coordinator: &Coordinator, operation: &str) {
    let op = match coordinator.catalog().lookup(operation) {
        Ok(op) => op,
        Err(e) => {
            eprintln!("maintkit: {}", e);
            return;
        }
    };

    match coordinator.view_log(&op.log_id) {
        Ok(lines) if lines.is_empty() => println!("No log recorded yet for {}.", op.display_name),
        Ok(lines) => {
            for line in lines {
                println!("{}", line);
            }
        }
        Err(e) => eprintln!("maintkit: {}", e),
    }
}

fn clear_logs(coordinator: &Coordinator) {
    match coordinator.clear_all_logs() {
        Ok(report) => {
            for path in &report.deleted {
                println!("Deleted {}", path.display());
            }
            for failure in &report.skipped {
                println!("Skipped {}: {}", failure.path.display(), failure.reason);
            }
            if report.deleted.is_empty() && report.skipped.is_empty() {
                println!("No logs to clear.");
            } else if report.is_complete() {
                println!("All logs cleared.");
            } else {
                println!(
                    "Cleared {} log(s); {} could not be removed.",
                    report.deleted.len(),
                    report.skipped.len()
                );
            }
        }
        Err(e) => eprintln!("maintkit: {}", e),
    }
}

fn clear_log(coordinator: &Coordinator, operation: &str) {
    let op = match coordinator.catalog().lookup(operation) {
        Ok(op) => op,
        Err(e) => {
            eprintln!("maintkit: {}", e);
            return;
        }
    };

    match coordinator.clear_log(&op.log_id) {
        Ok(true) => println!("Deleted the log for {}.", op.display_name),
        Ok(false) => println!("No log recorded for {}.", op.display_name),
        Err(e) => eprintln!("maintkit: {}", e),
    }
}
