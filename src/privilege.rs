//! Privilege guard
//!
//! Maintenance tools (DISM, sfc, defrag, fstrim, ...) need administrator
//! rights. The engine checks elevation once at startup (to warn early) and
//! again before every operation start; a start without elevation fails with
//! `MaintenanceError::PermissionDenied` before anything is spawned or opened.

/// Source of truth for "are we elevated?".
///
/// `Coordinator` holds one of these so tests can substitute a fixed answer.
pub trait ElevationCheck: Send + Sync {
    /// Returns true if the current process holds elevated rights.
    fn has_elevated_rights(&self) -> bool;
}

/// Asks the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemElevation;

impl ElevationCheck for SystemElevation {
    fn has_elevated_rights(&self) -> bool {
        is_elevated()
    }
}

/// Fixed answer; used when the check is explicitly skipped and in tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticElevation(pub bool);

impl ElevationCheck for StaticElevation {
    fn has_elevated_rights(&self) -> bool {
        self.0
    }
}

/// EUID 0 on Unix.
#[cfg(unix)]
fn is_elevated() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Member of the Administrators group with an elevated token on Windows.
#[cfg(windows)]
fn is_elevated() -> bool {
    // SAFETY: IsUserAnAdmin takes no arguments and only inspects the process token.
    unsafe { windows_sys::Win32::UI::Shell::IsUserAnAdmin() != 0 }
}

#[cfg(not(any(unix, windows)))]
fn is_elevated() -> bool {
    false
}

/// Skip the elevation check (development only).
/// Set MAINTKIT_SKIP_ELEVATION_CHECK=1 to skip
pub fn should_skip_elevation_check() -> bool {
    std::env::var("MAINTKIT_SKIP_ELEVATION_CHECK")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Build the elevation check for this process.
pub fn elevation_check(skip: bool) -> Box<dyn ElevationCheck> {
    if skip || should_skip_elevation_check() {
        tracing::warn!("Elevation check skipped; operations will start without administrator rights");
        Box::new(StaticElevation(true))
    } else {
        Box::new(SystemElevation)
    }
}

/// Startup check. Prints a banner to stderr when not elevated.
///
/// Not fatal: list/log/clear still work, and every start will be
/// rejected with `PermissionDenied` until the program is relaunched.
pub fn run_preflight_check(check: &dyn ElevationCheck) -> bool {
    tracing::debug!("Running elevation pre-flight check...");

    let elevated = check.has_elevated_rights();
    if elevated {
        tracing::info!("Pre-flight check passed: running with elevated rights");
    } else {
        tracing::warn!("Not running with elevated rights");
        print_elevation_warning();
    }
    elevated
}

fn print_elevation_warning() {
    eprintln!();
    eprintln!("╔══════════════════════════════════════════════════════════════════╗");
    eprintln!("║            maintkit - Administrator Rights Required              ║");
    eprintln!("╚══════════════════════════════════════════════════════════════════╝");
    eprintln!();
    eprintln!("❌ Admin privileges are required to perform maintenance operations.");
    eprintln!("   Please restart the program as an administrator:");
    if cfg!(windows) {
        eprintln!("     Right-click maintkit.exe -> Run as administrator");
    } else {
        eprintln!("     sudo maintkit");
    }
    eprintln!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_elevation() {
        assert!(StaticElevation(true).has_elevated_rights());
        assert!(!StaticElevation(false).has_elevated_rights());
    }

    #[test]
    fn test_skip_forces_elevated() {
        let check = elevation_check(true);
        assert!(check.has_elevated_rights());
    }

    #[test]
    fn test_preflight_reports_answer() {
        assert!(run_preflight_check(&StaticElevation(true)));
        assert!(!run_preflight_check(&StaticElevation(false)));
    }

    #[test]
    fn test_system_elevation_is_stable() {
        // Whatever the answer is, asking twice must agree (the check is re-run per start)
        let check = SystemElevation;
        assert_eq!(check.has_elevated_rights(), check.has_elevated_rights());
    }
}
