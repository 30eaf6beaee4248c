//! Child process isolation and tracking
//!
//! Maintenance commands cannot be cancelled once spawned, so they must not
//! receive the console's Ctrl+C either. Each child is started in its own
//! process group and with stdin closed; a tool that prompts for input reads
//! end-of-input instead of waiting on a console nobody is watching.
//!
//! `ChildRegistry` records which children are alive so a front end can tell
//! the operator what is still running.

use std::collections::HashMap;
use std::process::Stdio;

/// Registry of live child processes, keyed by PID.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    /// PID -> operation id that spawned it
    pids: HashMap<u32, String>,
}

impl ChildRegistry {
    /// Register a new child process
    pub fn register(&mut self, pid: u32, operation: &str) {
        self.pids.insert(pid, operation.to_string());
        tracing::debug!(pid, operation, "Registered child process");
    }

    /// Unregister a child process (called once it has been waited on)
    pub fn unregister(&mut self, pid: u32) {
        if let Some(operation) = self.pids.remove(&pid) {
            tracing::debug!(pid, operation = %operation, "Unregistered child process");
        }
    }

    /// Get count of tracked children
    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Live children as (pid, operation id), sorted by PID.
    pub fn snapshot(&self) -> Vec<(u32, String)> {
        let mut live: Vec<(u32, String)> = self
            .pids
            .iter()
            .map(|(pid, op)| (*pid, op.clone()))
            .collect();
        live.sort_by_key(|(pid, _)| *pid);
        live
    }
}

/// Extension trait for std::process::Command to detach children from the console
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group
    fn in_new_process_group(&mut self) -> &mut Self;

    /// New process group, stdin closed, stdout/stderr piped
    fn isolated(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    #[cfg(unix)]
    fn in_new_process_group(&mut self) -> &mut Self {
        use nix::unistd::{setpgid, Pid};
        use std::os::unix::process::CommandExt;

        // SAFETY: setpgid is async-signal-safe and only touches the child.
        unsafe {
            self.pre_exec(|| {
                // PGID = child PID, so a terminal SIGINT to our group misses it
                setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(std::io::Error::from)
            });
        }
        self
    }

    #[cfg(windows)]
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::windows::process::CommandExt;

        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        self.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW)
    }

    #[cfg(not(any(unix, windows)))]
    fn in_new_process_group(&mut self) -> &mut Self {
        self
    }

    fn isolated(&mut self) -> &mut Self {
        self.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group()
    }
}
