//! Process hardening for the staging daemon.
//!
//! Staged secrets live only in daemon memory. These steps keep that memory
//! out of core dumps and, when the memlock limit allows, out of swap.
//! Each step is best-effort: a failure is logged and reported, never fatal.
//!
//! | Step | Linux/Android | FreeBSD | macOS / other Unix |
//! |------|---------------|---------|--------------------|
//! | `RLIMIT_CORE = 0` | yes | yes | yes |
//! | `PR_SET_DUMPABLE = 0` | yes | no-op | no-op |
//! | `mlockall` | yes | yes | no-op |

use tracing::{debug, warn};

/// What [`harden_process`] managed to apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardeningReport {
    /// Core dump size limit set to zero.
    pub core_dumps_disabled: bool,
    /// Process marked non-dumpable (blocks ptrace attach and `/proc/<pid>/mem` reads by other processes).
    pub non_dumpable: bool,
    /// All current and future pages locked into RAM.
    pub memory_locked: bool,
}

/// Apply every hardening step supported on this platform.
pub fn harden_process(lock_memory: bool) -> HardeningReport {
    let report = HardeningReport {
        core_dumps_disabled: disable_core_dumps(),
        non_dumpable: set_non_dumpable(),
        memory_locked: lock_memory && lock_all_memory(),
    };
    debug!(?report, "process hardening applied");
    report
}

fn disable_core_dumps() -> bool {
    use nix::sys::resource::{Resource, setrlimit};

    match setrlimit(Resource::RLIMIT_CORE, 0, 0) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "failed to disable core dumps");
            false
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_non_dumpable() -> bool {
    match nix::sys::prctl::set_dumpable(false) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "failed to mark process non-dumpable");
            false
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_non_dumpable() -> bool {
    false
}

/// Lock memory only when the memlock limit is unlimited: with a finite limit,
/// `MCL_FUTURE` turns every allocation past the limit into an OOM abort.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn lock_all_memory() -> bool {
    use nix::sys::mman::{MlockAllFlags, mlockall};
    use nix::sys::resource::{RLIM_INFINITY, Resource, getrlimit};

    match getrlimit(Resource::RLIMIT_MEMLOCK) {
        Ok((soft, _)) if soft == RLIM_INFINITY => {}
        Ok((soft, _)) => {
            warn!(
                limit_bytes = soft,
                "memlock limit is finite; staged state may be swapped to disk"
            );
            return false;
        }
        Err(e) => {
            warn!(error = %e, "failed to read memlock limit");
            return false;
        }
    }

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "failed to lock daemon memory");
            false
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn lock_all_memory() -> bool {
    warn!("memory locking is not supported on this platform; staged state may be swapped to disk");
    false
}
