//! Process helpers for the runtime child.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Send SIGKILL to every process in group `pgid`.
///
/// # Returns
/// * `true` - The group was signalled or no longer exists
/// * `false` - Failed to signal (permission denied)
pub fn kill_process_group(pgid: u32) -> bool {
    unsafe { libc::killpg(pgid as i32, libc::SIGKILL) == 0 || !is_process_alive(pgid) }
}

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)` which sends a null signal to check existence.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Numeric exit code, shell style: `128 + signal` for a signalled child.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}
