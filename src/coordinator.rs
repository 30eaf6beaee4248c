//! Operation coordinator
//!
//! Authoritative owner of every operation's `RunState`. Front ends ask it to
//! start operations, query status, view and clear logs; they never mutate
//! state themselves.
//!
//! # Run lifecycle
//!
//! ```text
//! Idle ──start──> Running ──runner done──> Succeeded | Failed | Faulted
//!   ^                                              │
//!   └──────────────── reset / start ───────────────┘
//! ```
//!
//! - At most one run per operation is `Running`; different operations run
//!   concurrently, each on its own worker thread with its own log file.
//! - `start` never blocks on the command: it validates, opens the log,
//!   flips the state to `Running` and hands the run to a worker thread.
//! - The `Finished` event for a run is published exactly once, after the
//!   log has been flushed and closed.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::{Display, EnumString};
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, Operation, Step};
use crate::error::{MaintenanceError, Result};
use crate::log_store::{ClearReport, LogLevel, LogStore, LogWriter};
use crate::privilege::ElevationCheck;
use crate::process_runner::{ExitInfo, ProcessRunner, RunResult, RunSink, SequenceOutcome, StepOutcome};

/// Status of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
pub enum RunStatus {
    Idle,
    Running,
    Succeeded,
    Failed,
    Faulted,
}

impl RunStatus {
    /// Returns true for Succeeded, Failed and Faulted
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Faulted)
    }

    #[inline]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Idle => "Ready",
            Self::Running => "Running",
            Self::Succeeded => "Completed successfully",
            Self::Failed => "The tool reported a problem",
            Self::Faulted => "The tool could not be run",
        }
    }
}

impl From<RunResult> for RunStatus {
    fn from(result: RunResult) -> Self {
        match result {
            RunResult::Succeeded => Self::Succeeded,
            RunResult::Failed => Self::Failed,
            RunResult::Faulted => Self::Faulted,
        }
    }
}

/// Which step a running operation is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepProgress {
    pub current: usize,
    pub total: usize,
}

impl StepProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.current.saturating_sub(1) * 100) / self.total).min(100) as u8
    }
}

/// Live status record for one operation's current or most recent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub operation_id: String,
    /// Log record this operation writes (by id only)
    pub log_id: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_exit_info: Option<ExitInfo>,
    /// Present only while Running
    pub progress: Option<StepProgress>,
}

impl RunState {
    fn idle(op: &Operation) -> Self {
        Self {
            operation_id: op.id.clone(),
            log_id: op.log_id.clone(),
            status: RunStatus::Idle,
            started_at: None,
            finished_at: None,
            last_exit_info: None,
            progress: None,
        }
    }

    /// Idle or terminal -> Running
    fn begin(&mut self, now: DateTime<Utc>, total_steps: usize) -> Result<()> {
        if self.status.is_running() {
            return Err(MaintenanceError::already_running(&self.operation_id));
        }
        self.status = RunStatus::Running;
        self.started_at = Some(now);
        self.finished_at = None;
        self.progress = Some(StepProgress {
            current: 0,
            total: total_steps,
        });
        Ok(())
    }

    /// Running -> terminal
    fn complete(&mut self, outcome: &SequenceOutcome, now: DateTime<Utc>) {
        if !self.status.is_running() {
            warn!(operation = %self.operation_id, status = %self.status, "Completing a run that was not running");
        }
        self.status = outcome.result.into();
        self.finished_at = Some(now);
        self.last_exit_info = Some(outcome.exit_info.clone());
        self.progress = None;
    }

    /// Terminal -> Idle. History (times, exit info) is kept.
    fn reset(&mut self) -> Result<()> {
        if self.status.is_running() {
            return Err(MaintenanceError::already_running(&self.operation_id));
        }
        self.status = RunStatus::Idle;
        Ok(())
    }
}

/// Notifications published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationEvent {
    /// The operation entered Running
    Started(RunState),
    /// A line was appended to the operation's log
    Output { operation_id: String, line: String },
    /// Terminal transition; the log is complete and flushed
    Finished(RunState),
}

struct Shared {
    catalog: Catalog,
    store: LogStore,
    elevation: Box<dyn ElevationCheck>,
    runner: ProcessRunner,
    states: Mutex<HashMap<String, RunState>>,
    subscribers: Mutex<Vec<Sender<OperationEvent>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn states(&self) -> MutexGuard<'_, HashMap<String, RunState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: OperationEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Orchestrates operation runs. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    /// Create a coordinator with every catalog operation Idle.
    ///
    /// Does not touch the disk; call `LogStore::ensure_log_directory` first
    /// to fail early when the log location is unusable.
    pub fn new(catalog: Catalog, store: LogStore, elevation: Box<dyn ElevationCheck>) -> Self {
        let states = catalog
            .operations()
            .iter()
            .map(|op| (op.id.clone(), RunState::idle(op)))
            .collect();

        Self {
            shared: Arc::new(Shared {
                catalog,
                store,
                elevation,
                runner: ProcessRunner::new(),
                states: Mutex::new(states),
                subscribers: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    pub fn log_store(&self) -> &LogStore {
        &self.shared.store
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Receiver<OperationEvent> {
        let (tx, rx) = mpsc::channel();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Start an operation and return its `Running` snapshot.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an id not in the catalog
    /// - `PermissionDenied` without elevated rights (nothing spawned, no log touched)
    /// - `AlreadyRunning` if a run of this operation is in flight
    /// - `LogInUse` if another writer, possibly in another process, holds the log
    /// - `Io` if the log could not be opened or the worker could not be started
    pub fn start(&self, id: &str) -> Result<RunState> {
        let op = self.shared.catalog.lookup(id)?.clone();

        if !self.shared.elevation.has_elevated_rights() {
            warn!(operation = id, "Start refused: administrator privileges are required");
            return Err(MaintenanceError::PermissionDenied);
        }

        let (writer, snapshot) = {
            let mut states = self.shared.states();
            let state = states
                .get_mut(id)
                .ok_or_else(|| MaintenanceError::not_found(id))?;
            if state.status.is_running() {
                debug!(operation = id, "Start refused: already running");
                return Err(MaintenanceError::already_running(id));
            }
            let writer = self.shared.store.open_for_write(&op.log_id)?;
            state.begin(Utc::now(), op.steps.len())?;
            (writer, state.clone())
        };

        info!(operation = id, log_id = %op.log_id, steps = op.steps.len(), "Operation started");
        self.shared.publish(OperationEvent::Started(snapshot.clone()));

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("op-{}", op.id))
            .spawn(move || {
                run_operation(&shared, &op, writer, |sink| shared.runner.run(&op.id, &op.steps, sink))
            });

        match spawned {
            Ok(handle) => {
                let mut workers = self.shared.workers.lock().unwrap_or_else(PoisonError::into_inner);
                workers.retain(|h| !h.is_finished());
                workers.push(handle);
                Ok(snapshot)
            }
            Err(e) => {
                error!(operation = id, error = %e, "Failed to start worker thread");
                let outcome = SequenceOutcome::fault(format!("could not start worker thread: {}", e));
                let finished = finish_run(&self.shared, id, &outcome);
                self.shared.publish(OperationEvent::Finished(finished));
                Err(MaintenanceError::io("Failed to start worker thread", e))
            }
        }
    }

    /// Current state of one operation. Never waits on a running command.
    pub fn query_status(&self, id: &str) -> Result<RunState> {
        self.shared
            .states()
            .get(id)
            .cloned()
            .ok_or_else(|| MaintenanceError::not_found(id))
    }

    /// Snapshots of every operation, in catalog order.
    pub fn statuses(&self) -> Vec<RunState> {
        let states = self.shared.states();
        self.shared
            .catalog
            .ids()
            .filter_map(|id| states.get(id).cloned())
            .collect()
    }

    /// Acknowledge a terminal state, returning the operation to Idle.
    pub fn reset(&self, id: &str) -> Result<RunState> {
        let mut states = self.shared.states();
        let state = states
            .get_mut(id)
            .ok_or_else(|| MaintenanceError::not_found(id))?;
        state.reset()?;
        Ok(state.clone())
    }

    pub fn is_any_running(&self) -> bool {
        self.shared.states().values().any(|s| s.status.is_running())
    }

    /// Lines of a log record; empty if it has not been written yet.
    pub fn view_log(&self, log_id: &str) -> Result<Vec<String>> {
        self.shared.store.read_all(log_id)
    }

    /// Delete every log record, skipping the ones that cannot be removed.
    pub fn clear_all_logs(&self) -> Result<ClearReport> {
        let report = self.shared.store.clear_all()?;
        info!(
            deleted = report.deleted.len(),
            skipped = report.skipped.len(),
            "Cleared logs"
        );
        Ok(report)
    }

    /// Delete one log record. Refused while its operation is running.
    pub fn clear_log(&self, log_id: &str) -> Result<bool> {
        self.shared.store.clear(log_id)
    }

    /// Child processes currently alive, as (pid, operation id).
    pub fn live_children(&self) -> Vec<(u32, String)> {
        self.shared.runner.live_children()
    }

    /// Block until every worker started so far has finished.
    pub fn join_workers(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.shared.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers.drain(..).collect()
        };
        for handle in handles {
            if handle.join().is_err() {
                error!("Operation worker thread panicked");
            }
        }
    }
}

fn finish_run(shared: &Shared, id: &str, outcome: &SequenceOutcome) -> RunState {
    let mut states = shared.states();
    match states.get_mut(id) {
        Some(state) => {
            state.complete(outcome, Utc::now());
            state.clone()
        }
        None => {
            // Catalog ids are fixed, so every started id has a state
            error!(operation = id, "No run state for finished operation");
            let mut state = RunState {
                operation_id: id.to_string(),
                log_id: String::new(),
                status: RunStatus::Running,
                started_at: None,
                finished_at: None,
                last_exit_info: None,
                progress: None,
            };
            state.complete(outcome, Utc::now());
            state
        }
    }
}

/// Worker thread body: run the steps, close the log, then publish.
///
/// `run` executes the steps against the sink; a panic inside it ends the
/// run as `Faulted`.
fn run_operation(
    shared: &Shared,
    op: &Operation,
    writer: LogWriter,
    run: impl FnOnce(&mut dyn RunSink) -> SequenceOutcome,
) {
    let mut sink = OperationSink {
        shared,
        operation_id: &op.id,
        writer,
        write_error: None,
    };

    sink.note(LogLevel::Info, &format!("Starting {} ({} step(s))", op.display_name, op.steps.len()));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run(&mut sink)))
    .unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        error!(operation = %op.id, panic = %message, "Process runner panicked");
        SequenceOutcome::fault(format!("internal error: {}", message))
    });

    let skipped = op.steps.len().saturating_sub(outcome.steps_run);
    if skipped > 0 && outcome.steps_run > 0 {
        sink.note(LogLevel::Warn, &format!("Skipping remaining {} step(s)", skipped));
    }
    let status = RunStatus::from(outcome.result);
    let level = if status == RunStatus::Succeeded {
        LogLevel::Info
    } else {
        LogLevel::Error
    };
    sink.note(level, &format!("Run finished: {} ({})", status, outcome.exit_info.detail));

    let OperationSink {
        writer, write_error, ..
    } = sink;
    let closed = writer.finish();

    let mut outcome = outcome;
    if let Some(e) = write_error.or(closed.err()) {
        error!(operation = %op.id, log_id = %op.log_id, error = %e, "Log could not be written");
        outcome.result = RunResult::Faulted;
        outcome.exit_info.detail = format!("{}; log could not be written: {}", outcome.exit_info.detail, e);
    }

    let finished = finish_run(shared, &op.id, &outcome);
    info!(
        operation = %op.id,
        status = %finished.status,
        exit_code = ?outcome.exit_info.exit_code,
        "Operation finished"
    );
    shared.publish(OperationEvent::Finished(finished));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Bridges runner callbacks to the log record, progress and subscribers.
struct OperationSink<'a> {
    shared: &'a Shared,
    operation_id: &'a str,
    writer: LogWriter,
    /// First write failure; later writes are not attempted
    write_error: Option<std::io::Error>,
}

impl OperationSink<'_> {
    fn note(&mut self, level: LogLevel, message: &str) {
        self.append(level, message);
    }

    fn append(&mut self, level: LogLevel, message: &str) -> bool {
        if self.write_error.is_some() {
            return false;
        }
        match self.writer.append(level, message) {
            Ok(()) => true,
            Err(e) => {
                warn!(operation = self.operation_id, error = %e, "Failed to append to log");
                self.write_error = Some(e);
                false
            }
        }
    }
}

impl RunSink for OperationSink<'_> {
    fn on_output_line(&mut self, line: &str) {
        self.append(LogLevel::Out, line);
        self.shared.publish(OperationEvent::Output {
            operation_id: self.operation_id.to_string(),
            line: line.to_string(),
        });
    }

    fn on_step_started(&mut self, index: usize, total: usize, step: &Step) {
        if let Some(state) = self.shared.states().get_mut(self.operation_id) {
            state.progress = Some(StepProgress {
                current: index,
                total,
            });
        }
        self.note(LogLevel::Info, &format!("Executing step {}/{}: {}", index, total, step));
    }

    fn on_step_finished(&mut self, index: usize, _step: &Step, outcome: &StepOutcome) {
        match outcome {
            StepOutcome::Success { .. } => {
                self.note(LogLevel::Info, &format!("Step {} completed successfully.", index));
            }
            StepOutcome::Failure { exit_code: Some(code) } => {
                self.note(LogLevel::Error, &format!("Step {} failed with exit code {}", index, code));
            }
            StepOutcome::Failure { exit_code: None } => {
                self.note(LogLevel::Error, &format!("Step {} was terminated by a signal", index));
            }
            StepOutcome::Fault { reason } => {
                self.note(LogLevel::Error, &format!("Step {} could not be run: {}", index, reason));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::privilege::StaticElevation;

    fn operation() -> Operation {
        Operation::new("defrag", "Defrag", "defragment", vec![Step::exec("true", Vec::<String>::new())])
    }

    fn outcome(result: RunResult) -> SequenceOutcome {
        SequenceOutcome {
            result,
            steps_run: 1,
            exit_info: ExitInfo {
                exit_code: Some(0),
                step: Some(1),
                command: Some("true".to_string()),
                detail: "done".to_string(),
            },
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Idle.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Faulted.is_terminal());
    }

    #[test]
    fn test_run_result_maps_to_status() {
        assert_eq!(RunStatus::from(RunResult::Succeeded), RunStatus::Succeeded);
        assert_eq!(RunStatus::from(RunResult::Failed), RunStatus::Failed);
        assert_eq!(RunStatus::from(RunResult::Faulted), RunStatus::Faulted);
    }

    #[test]
    fn test_state_machine_round_trip() {
        let mut state = RunState::idle(&operation());
        assert_eq!(state.status, RunStatus::Idle);

        state.begin(Utc::now(), 1).expect("begin");
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.started_at.is_some());
        assert_eq!(state.progress, Some(StepProgress { current: 0, total: 1 }));

        state.complete(&outcome(RunResult::Failed), Utc::now());
        assert_eq!(state.status, RunStatus::Failed);
        assert!(state.finished_at.is_some());
        assert!(state.progress.is_none());
        assert_eq!(state.last_exit_info.as_ref().map(|e| e.detail.as_str()), Some("done"));

        state.reset().expect("reset");
        assert_eq!(state.status, RunStatus::Idle);
        assert!(state.last_exit_info.is_some(), "history survives reset");
    }

    #[test]
    fn test_begin_while_running_is_rejected() {
        let mut state = RunState::idle(&operation());
        state.begin(Utc::now(), 1).expect("begin");
        let err = state.begin(Utc::now(), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
        assert_eq!(state.reset().unwrap_err().kind(), ErrorKind::AlreadyRunning);
    }

    #[test]
    fn test_begin_from_terminal_is_allowed() {
        let mut state = RunState::idle(&operation());
        state.begin(Utc::now(), 1).expect("begin");
        state.complete(&outcome(RunResult::Succeeded), Utc::now());
        state.begin(Utc::now(), 1).expect("restart from terminal");
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.finished_at.is_none());
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(StepProgress { current: 1, total: 4 }.percent(), 0);
        assert_eq!(StepProgress { current: 3, total: 4 }.percent(), 50);
        assert_eq!(StepProgress { current: 0, total: 0 }.percent(), 0);
    }

    #[test]
    fn test_new_coordinator_is_idle() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let coordinator = Coordinator::new(
            Catalog::builtin(),
            LogStore::new(dir.path()),
            Box::new(StaticElevation(true)),
        );
        let statuses = coordinator.statuses();
        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(|s| s.status == RunStatus::Idle));
        assert!(!coordinator.is_any_running());
    }

    #[test]
    fn test_runner_panic_faults_the_run() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let op = operation();
        let coordinator = Coordinator::new(
            Catalog::new(vec![op.clone()]).expect("catalog"),
            LogStore::new(dir.path()),
            Box::new(StaticElevation(true)),
        );
        let events = coordinator.subscribe();
        let shared = &coordinator.shared;

        let writer = shared.store.open_for_write(&op.log_id).expect("open");
        if let Some(state) = shared.states().get_mut(&op.id) {
            state.begin(Utc::now(), op.steps.len()).expect("begin");
        }

        run_operation(shared, &op, writer, |sink| {
            sink.on_output_line("partial output");
            panic!("runner exploded")
        });

        let state = coordinator.query_status(&op.id).expect("status");
        assert_eq!(state.status, RunStatus::Faulted);
        let detail = state.last_exit_info.map(|info| info.detail).unwrap_or_default();
        assert!(detail.contains("internal error: runner exploded"), "{}", detail);

        let finished: Vec<_> = events
            .try_iter()
            .filter_map(|e| match e {
                OperationEvent::Finished(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, RunStatus::Faulted);

        let log = shared.store.read_all(&op.log_id).expect("read");
        assert!(log.iter().any(|l| l.ends_with("[OUT] partial output")));
        assert!(log.iter().any(|l| l.contains("Run finished: Faulted (internal error: runner exploded)")));
        assert!(!shared.store.is_active(&op.log_id));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
