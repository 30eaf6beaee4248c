//! maintkit library
//!
//! Background execution engine for system maintenance tools: runs a fixed
//! catalog of operations as child processes, streams their output into one
//! log record per operation, and reports status to any front end.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod log_store;
pub mod privilege;
pub mod process_guard;
pub mod process_runner;

// Re-export main types for convenience
pub use catalog::{BuiltinOperation, Catalog, CatalogError, CommandSpec, Operation, PurgeTarget, Step};
pub use config::EngineConfig;
pub use coordinator::{Coordinator, OperationEvent, RunState, RunStatus, StepProgress};
pub use error::{ErrorKind, MaintenanceError, PathFailure, Result};
pub use log_store::{ClearReport, LogEntry, LogLevel, LogStore, LogWriter};
pub use privilege::{ElevationCheck, StaticElevation, SystemElevation};
pub use process_guard::{ChildRegistry, CommandProcessGroup};
pub use process_runner::{ExitInfo, ProcessRunner, RunResult, RunSink, SequenceOutcome, StepOutcome};
