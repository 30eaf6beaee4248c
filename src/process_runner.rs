//! Step execution
//!
//! Runs an operation's steps strictly in order and stops at the first step
//! that does not succeed. External commands are spawned directly (never via
//! a shell) through `CommandProcessGroup::isolated`, and their stdout and
//! stderr are forwarded line by line to a `RunSink` as they arrive.
//!
//! # Outcomes
//!
//! - exit code 0 -> `StepOutcome::Success`
//! - any other exit (or death by signal) -> `StepOutcome::Failure`
//! - could not launch, or output could not be collected -> `StepOutcome::Fault`
//!
//! There is no timeout and no cancellation: a spawned command runs until it
//! exits on its own.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use strum::Display;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::catalog::{CommandSpec, PurgeTarget, Step};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};

/// Result of a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// `exit_code` is `None` for in-process steps
    Success { exit_code: Option<i32> },
    /// The command ran and reported a problem; `None` if killed by a signal
    Failure { exit_code: Option<i32> },
    /// The step could not be executed at all
    Fault { reason: String },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Aggregate result of a whole sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum RunResult {
    Succeeded,
    Failed,
    Faulted,
}

/// What the last executed step reported, kept for the log and `RunState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    /// Exit code of the last command that ran
    pub exit_code: Option<i32>,
    /// 1-based index of the step that ended the run
    pub step: Option<usize>,
    /// The step as text
    pub command: Option<String>,
    pub detail: String,
}

impl ExitInfo {
    /// Exit info for a fault that is not tied to any step.
    pub fn fault(detail: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            step: None,
            command: None,
            detail: detail.into(),
        }
    }
}

/// Outcome of `ProcessRunner::run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceOutcome {
    pub result: RunResult,
    /// Steps that were started (the rest were skipped)
    pub steps_run: usize,
    pub exit_info: ExitInfo,
}

impl SequenceOutcome {
    pub fn fault(detail: impl Into<String>) -> Self {
        Self {
            result: RunResult::Faulted,
            steps_run: 0,
            exit_info: ExitInfo::fault(detail),
        }
    }
}

/// Receiver of everything a run produces, in order.
pub trait RunSink {
    /// One complete, sanitised output line.
    fn on_output_line(&mut self, line: &str);

    fn on_step_started(&mut self, _index: usize, _total: usize, _step: &Step) {}

    fn on_step_finished(&mut self, _index: usize, _step: &Step, _outcome: &StepOutcome) {}
}

/// Executes step sequences. Cheap to clone; clones share the child registry.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    children: Arc<Mutex<ChildRegistry>>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Children currently alive, as (pid, operation id).
    pub fn live_children(&self) -> Vec<(u32, String)> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Run `steps` in order, stopping at the first step that is not a success.
    pub fn run(&self, operation_id: &str, steps: &[Step], sink: &mut dyn RunSink) -> SequenceOutcome {
        let total = steps.len();
        let mut last_exit_code = None;

        for (i, step) in steps.iter().enumerate() {
            let index = i + 1;
            sink.on_step_started(index, total, step);
            let outcome = self.run_step(operation_id, step, sink);
            sink.on_step_finished(index, step, &outcome);

            let (result, exit_code, detail) = match outcome {
                StepOutcome::Success { exit_code } => {
                    last_exit_code = exit_code;
                    continue;
                }
                StepOutcome::Failure { exit_code } => {
                    let detail = match exit_code {
                        Some(code) => format!("Step {} failed with exit code {}", index, code),
                        None => format!("Step {} was terminated by a signal", index),
                    };
                    (RunResult::Failed, exit_code, detail)
                }
                StepOutcome::Fault { reason } => (
                    RunResult::Faulted,
                    None,
                    format!("Step {} could not be run: {}", index, reason),
                ),
            };

            if index < total {
                info!(
                    operation = operation_id,
                    skipped = total - index,
                    "Stopping sequence after unsuccessful step"
                );
            }
            return SequenceOutcome {
                result,
                steps_run: index,
                exit_info: ExitInfo {
                    exit_code,
                    step: Some(index),
                    command: Some(step.to_string()),
                    detail,
                },
            };
        }

        SequenceOutcome {
            result: RunResult::Succeeded,
            steps_run: total,
            exit_info: ExitInfo {
                exit_code: last_exit_code,
                step: Some(total),
                command: steps.last().map(ToString::to_string),
                detail: format!("All {} step(s) completed successfully", total),
            },
        }
    }

    /// Run one step.
    pub fn run_step(&self, operation_id: &str, step: &Step, sink: &mut dyn RunSink) -> StepOutcome {
        match step {
            Step::Exec(cmd) => self.run_command(operation_id, cmd, sink),
            Step::Purge(target) => purge(target, sink),
        }
    }

    fn run_command(&self, operation_id: &str, cmd: &CommandSpec, sink: &mut dyn RunSink) -> StepOutcome {
        info!(operation = operation_id, command = %cmd, "Spawning command");

        let mut child = match Command::new(&cmd.program).args(&cmd.args).isolated().spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(operation = operation_id, command = %cmd, error = %e, "Failed to spawn command");
                return StepOutcome::Fault {
                    reason: format!("failed to launch '{}': {}", cmd.program, e),
                };
            }
        };

        let pid = child.id();
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(pid, operation_id);

        let mut pump = OutputPump::start(&mut child);
        let waited = pump.forward_until_exit(&mut child, sink);

        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(pid);

        let collected = pump.drain(OUTPUT_GRACE, sink);
        if collected.detached {
            warn!(
                operation = operation_id,
                pid,
                "Command exited but its output is still held open by another process; stopped reading"
            );
        }

        let status = match waited {
            Ok(status) => status,
            Err(e) => {
                return StepOutcome::Fault {
                    reason: format!("failed waiting for '{}': {}", cmd.program, e),
                };
            }
        };

        if let Some(reason) = collected.error {
            warn!(operation = operation_id, pid, reason = %reason, "Output capture failed");
            return StepOutcome::Fault { reason };
        }

        let exit_code = status.code();
        debug!(operation = operation_id, pid, ?exit_code, "Command exited");
        if status.success() {
            StepOutcome::Success { exit_code }
        } else {
            StepOutcome::Failure { exit_code }
        }
    }
}

/// How often the exit status is polled while output is quiet.
const EXIT_POLL: Duration = Duration::from_millis(50);

/// How long to keep reading after the command exited. Output still in the
/// pipes arrives well within this; a background process that inherited the
/// pipes would otherwise keep the step open indefinitely.
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

enum StreamMsg {
    Line(String),
    Failed(std::io::Error),
}

/// What was left over once output forwarding stopped.
struct Collected {
    error: Option<String>,
    /// Readers were abandoned because the pipes never closed
    detached: bool,
}

/// Reader threads for the child's stdout and stderr, feeding one channel so
/// lines are delivered in arrival order and neither pipe can fill up and
/// stall the child.
struct OutputPump {
    rx: Receiver<StreamMsg>,
    readers: Vec<JoinHandle<()>>,
    error: Option<String>,
}

impl OutputPump {
    fn start(child: &mut Child) -> Self {
        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::with_capacity(2);
        let mut error: Option<String> = None;

        let streams: [(&str, Option<Box<dyn Read + Send>>); 2] = [
            ("stdout", child.stdout.take().map(|s| Box::new(s) as Box<dyn Read + Send>)),
            ("stderr", child.stderr.take().map(|s| Box::new(s) as Box<dyn Read + Send>)),
        ];
        for (name, stream) in streams {
            match stream {
                Some(stream) => match spawn_reader(name, stream, tx.clone()) {
                    Ok(handle) => readers.push(handle),
                    Err(e) => {
                        error.get_or_insert_with(|| format!("failed to start {} reader: {}", name, e));
                    }
                },
                None => {
                    error.get_or_insert_with(|| format!("{} was not captured", name));
                }
            }
        }

        Self { rx, readers, error }
    }

    fn deliver(&mut self, msg: StreamMsg, sink: &mut dyn RunSink) {
        match msg {
            StreamMsg::Line(line) => sink.on_output_line(&line),
            StreamMsg::Failed(e) => {
                self.error
                    .get_or_insert_with(|| format!("failed reading command output: {}", e));
            }
        }
    }

    /// Forward output as it arrives until the child exits.
    ///
    /// Returns on the child's exit, not on end-of-output.
    fn forward_until_exit(&mut self, child: &mut Child, sink: &mut dyn RunSink) -> std::io::Result<ExitStatus> {
        loop {
            match self.rx.recv_timeout(EXIT_POLL) {
                Ok(msg) => self.deliver(msg, sink),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return child.wait(),
            }
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
        }
    }

    /// Forward what is still buffered, waiting at most `grace` for both
    /// streams to close. Readers still blocked after that are detached.
    fn drain(mut self, grace: Duration, sink: &mut dyn RunSink) -> Collected {
        let deadline = Instant::now() + grace;
        let mut detached = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(msg) => self.deliver(msg, sink),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    detached = true;
                    break;
                }
            }
        }

        if !detached {
            for handle in self.readers.drain(..) {
                if handle.join().is_err() {
                    self.error.get_or_insert_with(|| "output reader panicked".to_string());
                }
            }
        }

        Collected {
            error: self.error,
            detached,
        }
    }
}

fn spawn_reader(
    name: &str,
    stream: Box<dyn Read + Send>,
    tx: Sender<StreamMsg>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("output-{}", name))
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(StreamMsg::Line(sanitize_line(&buf))).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = tx.send(StreamMsg::Failed(e));
                        break;
                    }
                }
            }
        })
}

/// Turn one raw output line into log text.
///
/// Drops the line terminator and NUL bytes (UTF-16 console output), keeps
/// only the final redraw of carriage-return progress bars, and replaces
/// invalid UTF-8.
pub fn sanitize_line(raw: &[u8]) -> String {
    let bytes: Vec<u8> = raw.iter().copied().filter(|&b| b != 0).collect();
    let text = String::from_utf8_lossy(&bytes);
    let text = text.trim_end_matches(['\n', '\r']);
    text.rsplit('\r')
        .find(|segment| !segment.trim().is_empty())
        .unwrap_or("")
        .to_string()
}

#[derive(Debug, Default)]
struct PurgeTally {
    deleted: usize,
    in_use: usize,
    denied: usize,
    other: usize,
}

enum DeleteFailure {
    InUse,
    Denied,
    NotEmpty,
    Other,
}

fn classify(err: &std::io::Error) -> DeleteFailure {
    #[cfg(windows)]
    {
        // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
        if matches!(err.raw_os_error(), Some(32) | Some(33)) {
            return DeleteFailure::InUse;
        }
    }
    match err.kind() {
        std::io::ErrorKind::ResourceBusy => DeleteFailure::InUse,
        std::io::ErrorKind::PermissionDenied => DeleteFailure::Denied,
        std::io::ErrorKind::DirectoryNotEmpty => DeleteFailure::NotEmpty,
        _ => DeleteFailure::Other,
    }
}

/// Delete the contents of a temporary-file location, bottom-up.
///
/// Best effort: entries that cannot be removed are reported and counted,
/// never fatal. The location itself is kept.
fn purge(target: &PurgeTarget, sink: &mut dyn RunSink) -> StepOutcome {
    let Some(root) = target.path.as_deref().filter(|p| p.is_dir()) else {
        sink.on_output_line(&format!("Path not found or invalid: {}", target.label));
        return StepOutcome::Success { exit_code: None };
    };

    let mut tally = PurgeTally::default();
    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tally.other += 1;
                let path = e.path().unwrap_or(root).display().to_string();
                sink.on_output_line(&format!("Error reading {}: {}", path, e));
                continue;
            }
        };
        delete_entry(entry.path(), entry.file_type().is_dir(), &mut tally, sink);
    }

    sink.on_output_line(&format!("Cleanup of {} completed", target.label));
    sink.on_output_line(&format!("Deleted: {}", tally.deleted));
    sink.on_output_line(&format!("In use: {}", tally.in_use));
    sink.on_output_line(&format!("Permission denied: {}", tally.denied));
    sink.on_output_line(&format!("Other errors: {}", tally.other));
    StepOutcome::Success { exit_code: None }
}

fn delete_entry(path: &Path, is_dir: bool, tally: &mut PurgeTally, sink: &mut dyn RunSink) {
    let removed = if is_dir {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };

    match removed {
        Ok(()) => {
            tally.deleted += 1;
            let kind = if is_dir { "directory" } else { "file" };
            sink.on_output_line(&format!("Deleted {}: {}", kind, path.display()));
        }
        Err(e) => match classify(&e) {
            DeleteFailure::InUse => {
                tally.in_use += 1;
                sink.on_output_line(&format!("In use by another program: {}", path.display()));
            }
            DeleteFailure::Denied => {
                tally.denied += 1;
                sink.on_output_line(&format!("Permission denied for {}", path.display()));
            }
            // Something inside could not be removed; already reported
            DeleteFailure::NotEmpty => {}
            DeleteFailure::Other => {
                tally.other += 1;
                sink.on_output_line(&format!("Error deleting {}: {}", path.display(), e));
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink that records everything for assertions.
    #[derive(Default)]
    struct Recorder {
        lines: Vec<String>,
        started: Vec<(usize, usize)>,
        finished: Vec<(usize, StepOutcome)>,
    }

    impl RunSink for Recorder {
        fn on_output_line(&mut self, line: &str) {
            self.lines.push(line.to_string());
        }

        fn on_step_started(&mut self, index: usize, total: usize, _step: &Step) {
            self.started.push((index, total));
        }

        fn on_step_finished(&mut self, index: usize, _step: &Step, outcome: &StepOutcome) {
            self.finished.push((index, outcome.clone()));
        }
    }

    #[test]
    fn test_sanitize_line() {
        assert_eq!(sanitize_line(b"hello\r\n"), "hello");
        assert_eq!(sanitize_line(b"plain\n"), "plain");
        assert_eq!(sanitize_line(b"\n"), "");
        // UTF-16LE "OK"
        assert_eq!(sanitize_line(b"O\0K\0\r\0\n"), "OK");
        // Progress bar redraws
        assert_eq!(sanitize_line(b"[==  10%]\r[====  40%]\r[======100%]\r\n"), "[======100%]");
        assert_eq!(sanitize_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[test]
    fn test_missing_program_is_fault() {
        let runner = ProcessRunner::new();
        let mut rec = Recorder::default();
        let steps = vec![Step::exec("definitely-not-a-real-program-12345", ["x"])];

        let outcome = runner.run("test", &steps, &mut rec);
        assert_eq!(outcome.result, RunResult::Faulted);
        assert_eq!(outcome.steps_run, 1);
        assert!(outcome.exit_info.detail.contains("could not be run"));
        assert!(runner.live_children().is_empty());
    }

    #[test]
    fn test_purge_unresolved_location_succeeds() {
        let runner = ProcessRunner::new();
        let mut rec = Recorder::default();
        let step = Step::Purge(PurgeTarget::new("%NOWHERE%", None));

        let outcome = runner.run_step("cleanup", &step, &mut rec);
        assert_eq!(outcome, StepOutcome::Success { exit_code: None });
        assert_eq!(rec.lines, vec!["Path not found or invalid: %NOWHERE%"]);
    }

    #[test]
    fn test_purge_deletes_contents_but_keeps_root() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let root = dir.path().join("Temp");
        fs::create_dir_all(root.join("nested/deeper")).expect("mkdir");
        fs::write(root.join("a.tmp"), "a").expect("write");
        fs::write(root.join("nested/b.tmp"), "b").expect("write");
        fs::write(root.join("nested/deeper/c.tmp"), "c").expect("write");

        let runner = ProcessRunner::new();
        let mut rec = Recorder::default();
        let step = Step::Purge(PurgeTarget::new("%TEMP%", Some(root.clone())));
        let outcome = runner.run_step("cleanup", &step, &mut rec);

        assert!(outcome.is_success());
        assert!(root.is_dir());
        assert_eq!(fs::read_dir(&root).expect("read_dir").count(), 0);
        // 3 files + 2 directories
        assert!(rec.lines.contains(&"Deleted: 5".to_string()));
        assert!(rec.lines.contains(&"In use: 0".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_stdout_and_stderr_are_both_captured() {
        let runner = ProcessRunner::new();
        let mut rec = Recorder::default();
        let steps = vec![Step::exec("sh", ["-c", "echo out; sleep 0.1; echo err 1>&2"])];

        let outcome = runner.run("test", &steps, &mut rec);
        assert_eq!(outcome.result, RunResult::Succeeded);
        assert_eq!(outcome.exit_info.exit_code, Some(0));
        assert_eq!(rec.lines, vec!["out", "err"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_failure_with_code() {
        let runner = ProcessRunner::new();
        let mut rec = Recorder::default();
        let steps = vec![
            Step::exec("sh", ["-c", "echo A; exit 3"]),
            Step::exec("sh", ["-c", "echo never"]),
        ];

        let outcome = runner.run("test", &steps, &mut rec);
        assert_eq!(outcome.result, RunResult::Failed);
        assert_eq!(outcome.steps_run, 1);
        assert_eq!(outcome.exit_info.exit_code, Some(3));
        assert_eq!(outcome.exit_info.step, Some(1));
        assert_eq!(rec.lines, vec!["A"]);
        assert_eq!(rec.started, vec![(1, 2)]);
        assert_eq!(rec.finished, vec![(1, StepOutcome::Failure { exit_code: Some(3) })]);
    }

    #[cfg(unix)]
    #[test]
    fn test_killed_by_signal_is_failure_without_code() {
        let runner = ProcessRunner::new();
        let mut rec = Recorder::default();
        let steps = vec![Step::exec("sh", ["-c", "kill -9 $$"])];

        let outcome = runner.run("test", &steps, &mut rec);
        assert_eq!(outcome.result, RunResult::Failed);
        assert_eq!(outcome.exit_info.exit_code, None);
        assert!(outcome.exit_info.detail.contains("signal"));
    }

    #[cfg(unix)]
    #[test]
    fn test_step_ends_when_command_exits_despite_inherited_pipes() {
        let runner = ProcessRunner::new();
        let mut rec = Recorder::default();
        let steps = vec![Step::exec("sh", ["-c", "sleep 5 & echo hi; exit 0"])];

        let begun = Instant::now();
        let outcome = runner.run("test", &steps, &mut rec);
        let elapsed = begun.elapsed();

        assert_eq!(outcome.result, RunResult::Succeeded);
        assert_eq!(rec.lines, vec!["hi"]);
        assert!(elapsed < Duration::from_secs(4), "step took {:?}", elapsed);
        assert!(runner.live_children().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_output_written_just_before_exit_is_kept() {
        let runner = ProcessRunner::new();
        let mut rec = Recorder::default();
        let steps = vec![Step::exec("sh", ["-c", "i=1; while [ $i -le 2000 ]; do echo line$i; i=$((i+1)); done"])];

        let outcome = runner.run("test", &steps, &mut rec);
        assert_eq!(outcome.result, RunResult::Succeeded);
        assert_eq!(rec.lines.len(), 2000);
        assert_eq!(rec.lines.first().map(String::as_str), Some("line1"));
        assert_eq!(rec.lines.last().map(String::as_str), Some("line2000"));
    }

    #[cfg(unix)]
    #[test]
    fn test_sequence_success_reports_every_step() {
        let runner = ProcessRunner::new();
        let mut rec = Recorder::default();
        let steps = vec![
            Step::exec("sh", ["-c", "echo one"]),
            Step::exec("sh", ["-c", "echo two"]),
            Step::exec("sh", ["-c", "echo three"]),
        ];

        let outcome = runner.run("test", &steps, &mut rec);
        assert_eq!(outcome.result, RunResult::Succeeded);
        assert_eq!(outcome.steps_run, 3);
        assert_eq!(rec.lines, vec!["one", "two", "three"]);
        assert_eq!(rec.started, vec![(1, 3), (2, 3), (3, 3)]);
        assert!(rec.finished.iter().all(|(_, o)| o.is_success()));
    }
}
