//! Process validation utilities for PID checking and verification.

use std::path::Path;

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)` which sends a null signal to check existence.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Verify that a PID lives inside the network namespace pinned at `netns_path`.
///
/// Compares the device/inode of `/proc/<pid>/ns/net` against the pinned
/// namespace file. This prevents PID reuse from being mistaken for the
/// contained process: a recycled PID will sit in some other namespace.
pub fn is_in_netns(pid: u32, netns_path: &Path) -> bool {
    use nix::sys::stat::stat;

    let proc_ns = format!("/proc/{}/ns/net", pid);
    match (stat(proc_ns.as_str()), stat(netns_path)) {
        (Ok(a), Ok(b)) => a.st_dev == b.st_dev && a.st_ino == b.st_ino,
        _ => false,
    }
}
