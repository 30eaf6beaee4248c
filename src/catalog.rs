//! Operation catalog
//!
//! Static description of the maintenance operations this build can run.
//! Entries are fixed when the catalog is built; there is no API to add,
//! remove, or edit an operation afterwards. Targets (drives, temp paths)
//! are not end-user configurable.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use thiserror::Error;

use crate::error::{MaintenanceError, Result};

/// Built-in operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, EnumString, EnumIter)]
pub enum BuiltinOperation {
    #[strum(serialize = "health-check")]
    HealthCheck,
    #[strum(serialize = "cleanup")]
    Cleanup,
    #[strum(serialize = "defrag")]
    Defrag,
}

impl BuiltinOperation {
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::HealthCheck => "System Health Check",
            Self::Cleanup => "Disk Cleanup",
            Self::Defrag => "Defragment and Optimize Drives",
        }
    }

    pub const fn log_id(self) -> &'static str {
        match self {
            Self::HealthCheck => "system_health_check",
            Self::Cleanup => "disk_cleanup",
            Self::Defrag => "defragment",
        }
    }
}

/// An external program with a fixed argument list. Never run through a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A temporary-file location whose contents are deleted in-process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeTarget {
    /// Human-readable name (e.g. `%TEMP%`)
    pub label: String,
    /// Resolved location; `None` if it could not be resolved on this machine
    pub path: Option<PathBuf>,
}

impl PurgeTarget {
    pub fn new(label: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self {
            label: label.into(),
            path,
        }
    }
}

/// One entry of an operation's command sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Step {
    Exec(CommandSpec),
    Purge(PurgeTarget),
}

impl Step {
    /// Shorthand for an `Exec` step.
    pub fn exec<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Exec(CommandSpec::new(program, args))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exec(cmd) => write!(f, "{}", cmd),
            Self::Purge(target) => match &target.path {
                Some(path) => write!(f, "delete contents of {} ({})", target.label, path.display()),
                None => write!(f, "delete contents of {}", target.label),
            },
        }
    }
}

/// Immutable operation descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operation {
    pub id: String,
    pub display_name: String,
    pub steps: Vec<Step>,
    pub log_id: String,
}

impl Operation {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        log_id: impl Into<String>,
        steps: Vec<Step>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            steps,
            log_id: log_id.into(),
        }
    }
}

/// Reasons a list of operations cannot form a catalog.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("duplicate operation id '{0}'")]
    DuplicateId(String),

    #[error("duplicate log id '{0}'")]
    DuplicateLogId(String),

    #[error("operation '{0}' has no steps")]
    NoSteps(String),
}

/// The set of operations available to the coordinator.
#[derive(Debug, Clone)]
pub struct Catalog {
    operations: Vec<Operation>,
}

impl Catalog {
    /// Build a catalog from a fixed list of operations.
    ///
    /// Ids and log ids must be unique, and every operation needs at least one step.
    pub fn new(operations: Vec<Operation>) -> std::result::Result<Self, CatalogError> {
        let mut ids = HashSet::new();
        let mut log_ids = HashSet::new();
        for op in &operations {
            if !ids.insert(op.id.as_str()) {
                return Err(CatalogError::DuplicateId(op.id.clone()));
            }
            if !log_ids.insert(op.log_id.as_str()) {
                return Err(CatalogError::DuplicateLogId(op.log_id.clone()));
            }
            if op.steps.is_empty() {
                return Err(CatalogError::NoSteps(op.id.clone()));
            }
        }
        Ok(Self { operations })
    }

    /// The catalog compiled into this build.
    pub fn builtin() -> Self {
        Self {
            operations: BuiltinOperation::iter().map(builtin_operation).collect(),
        }
    }

    /// Find an operation by id.
    pub fn lookup(&self, id: &str) -> Result<&Operation> {
        self.operations
            .iter()
            .find(|op| op.id == id)
            .ok_or_else(|| MaintenanceError::not_found(id))
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.operations.iter().map(|op| op.id.as_str())
    }
}

fn builtin_operation(kind: BuiltinOperation) -> Operation {
    Operation::new(
        kind.to_string(),
        kind.display_name(),
        kind.log_id(),
        builtin_steps(kind),
    )
}

#[cfg(windows)]
fn builtin_steps(kind: BuiltinOperation) -> Vec<Step> {
    use std::env;

    let dism = |arg: &str| Step::exec("Dism.exe", ["/Online", "/Cleanup-Image", arg]);
    let local_app_data = env::var_os("LOCALAPPDATA").map(PathBuf::from);

    match kind {
        BuiltinOperation::HealthCheck => vec![
            dism("/CheckHealth"),
            dism("/ScanHealth"),
            dism("/RestoreHealth"),
            Step::exec("sfc", ["/scannow"]),
            dism("/AnalyzeComponentStore"),
            dism("/StartComponentCleanup"),
        ],
        BuiltinOperation::Cleanup => vec![
            Step::Purge(PurgeTarget::new(
                "%TEMP%",
                env::var_os("TEMP").map(PathBuf::from),
            )),
            Step::Purge(PurgeTarget::new(
                r"%LOCALAPPDATA%\Temp",
                local_app_data.as_ref().map(|p| p.join("Temp")),
            )),
            Step::Purge(PurgeTarget::new(
                r"%LOCALAPPDATA%\Microsoft\Windows\History",
                local_app_data
                    .as_ref()
                    .map(|p| p.join("Microsoft").join("Windows").join("History")),
            )),
        ],
        BuiltinOperation::Defrag => vec![
            Step::exec("defrag", ["C:", "/O"]),
            Step::exec("defrag", ["D:", "/O"]),
        ],
    }
}

#[cfg(not(windows))]
fn builtin_steps(kind: BuiltinOperation) -> Vec<Step> {
    match kind {
        BuiltinOperation::HealthCheck => vec![
            Step::exec("systemctl", ["--failed", "--no-pager"]),
            Step::exec("journalctl", ["--verify", "--quiet"]),
        ],
        BuiltinOperation::Cleanup => vec![
            Step::exec("systemd-tmpfiles", ["--clean"]),
            Step::exec("journalctl", ["--vacuum-time=2weeks"]),
        ],
        BuiltinOperation::Defrag => vec![Step::exec("fstrim", ["--all", "--verbose"])],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_builtin_has_three_operations() {
        let catalog = Catalog::builtin();
        let ids: Vec<&str> = catalog.ids().collect();
        assert_eq!(ids, vec!["health-check", "cleanup", "defrag"]);
    }

    #[test]
    fn test_builtin_log_ids() {
        let catalog = Catalog::builtin();
        assert_eq!(catalog.lookup("health-check").unwrap().log_id, "system_health_check");
        assert_eq!(catalog.lookup("cleanup").unwrap().log_id, "disk_cleanup");
        assert_eq!(catalog.lookup("defrag").unwrap().log_id, "defragment");
    }

    #[test]
    fn test_builtin_passes_validation() {
        let ops = Catalog::builtin().operations().to_vec();
        assert!(Catalog::new(ops).is_ok());
    }

    #[test]
    fn test_lookup_unknown_is_not_found() {
        let err = Catalog::builtin().lookup("not-a-real-id").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_builtin_operation_parse() {
        let op: BuiltinOperation = "defrag".parse().expect("parse");
        assert_eq!(op, BuiltinOperation::Defrag);
        assert!("Defrag!".parse::<BuiltinOperation>().is_err());
    }

    #[test]
    fn test_catalog_rejects_duplicates_and_empty() {
        let a = Operation::new("a", "A", "log_a", vec![Step::exec("true", Vec::<String>::new())]);
        let dup_id = Operation::new("a", "A2", "log_b", a.steps.clone());
        let dup_log = Operation::new("b", "B", "log_a", a.steps.clone());
        let empty = Operation::new("c", "C", "log_c", vec![]);

        assert_eq!(
            Catalog::new(vec![a.clone(), dup_id]).unwrap_err(),
            CatalogError::DuplicateId("a".to_string())
        );
        assert_eq!(
            Catalog::new(vec![a.clone(), dup_log]).unwrap_err(),
            CatalogError::DuplicateLogId("log_a".to_string())
        );
        assert_eq!(
            Catalog::new(vec![empty]).unwrap_err(),
            CatalogError::NoSteps("c".to_string())
        );
        assert!(Catalog::new(vec![a]).is_ok());
    }

    #[test]
    fn test_step_display() {
        let step = Step::exec("Dism.exe", ["/Online", "/Cleanup-Image", "/ScanHealth"]);
        assert_eq!(step.to_string(), "Dism.exe /Online /Cleanup-Image /ScanHealth");

        let purge = Step::Purge(PurgeTarget::new("%TEMP%", None));
        assert_eq!(purge.to_string(), "delete contents of %TEMP%");
    }
}
