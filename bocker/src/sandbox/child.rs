//! Child-side setup: everything that happens between fork and exec.
//!
//! The closures installed with `pre_exec` run in a freshly forked child of a
//! threaded parent, so they must not allocate. Every fd and path used here
//! is opened/encoded by the parent beforehand; the code below sticks to raw
//! writes and direct syscalls.
//!
//! The nesting order is load-bearing: cgroup membership → netns entry →
//! unshare → inner fork → proc remount → chroot. Each outer context must
//! exist before the next inner one is entered.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};

use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, setns, unshare};

/// Everything the sandbox child needs, prepared by the parent.
pub(crate) struct SandboxContext {
    /// `tasks` files of the container's cgroups, one per controller.
    pub cgroup_tasks: Vec<File>,
    /// The container's pinned network namespace.
    pub netns: File,
    /// Destination for the inner child's host pid.
    pub pid_record: File,
    /// Container volume path, pre-encoded.
    pub root: CString,
}

/// Run in the sandbox child immediately before exec.
///
/// Returns only in the innermost process (pid 1 of the new pid namespace);
/// the intermediate fork turns into a shim that reaps it.
pub(crate) fn enter_sandbox(ctx: &SandboxContext) -> io::Result<()> {
    let pid = unsafe { libc::getpid() };
    for tasks in &ctx.cgroup_tasks {
        write_decimal(tasks.as_raw_fd(), pid as u64)?;
    }

    setns(&ctx.netns, CloneFlags::CLONE_NEWNET).map_err(io::Error::from)?;

    unshare(
        CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWPID,
    )
    .map_err(io::Error::from)?;

    // A new pid namespace only applies to children, so fork again; the
    // intermediate records the inner pid and reaps it.
    fork_shim(Some(ctx.pid_record.as_raw_fd()))?;

    // Keep mount changes out of the host namespace, then give the new pid
    // namespace a matching /proc before the root changes.
    mount(
        None::<&std::ffi::CStr>,
        c"/",
        None::<&std::ffi::CStr>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&std::ffi::CStr>,
    )
    .map_err(io::Error::from)?;
    mount(
        Some(c"proc"),
        c"/proc",
        Some(c"proc"),
        MsFlags::empty(),
        None::<&std::ffi::CStr>,
    )
    .map_err(io::Error::from)?;

    nix::unistd::chroot(ctx.root.as_c_str()).map_err(io::Error::from)?;
    nix::unistd::chdir(c"/").map_err(io::Error::from)?;

    Ok(())
}

/// Namespace fds of a running container, for exec-into.
pub(crate) struct JoinContext {
    /// Opened `/proc/<pid>/ns/*` files with their flags; mount must be last
    /// since entering it changes path resolution.
    pub namespaces: Vec<(File, CloneFlags)>,
    /// Container volume path, pre-encoded.
    pub root: CString,
}

/// Join an existing container's namespaces before exec.
pub(crate) fn enter_existing(ctx: &JoinContext) -> io::Result<()> {
    for (ns, flag) in &ctx.namespaces {
        setns(ns, *flag).map_err(io::Error::from)?;
    }
    nix::unistd::chroot(ctx.root.as_c_str()).map_err(io::Error::from)?;
    nix::unistd::chdir(c"/").map_err(io::Error::from)?;

    // Entering a pid namespace also only applies to children.
    fork_shim(None)?;
    Ok(())
}

/// Fork; the parent becomes a shim that optionally records the child's pid,
/// reaps it, and exits with its status. The child returns.
fn fork_shim(pid_record: Option<RawFd>) -> io::Result<()> {
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(()),
        inner => {
            if let Some(fd) = pid_record {
                let _ = write_decimal(fd, inner as u64);
            }
            let mut status: libc::c_int = 0;
            loop {
                let waited = unsafe { libc::waitpid(inner, &mut status, 0) };
                if waited == -1 {
                    if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    unsafe { libc::_exit(1) };
                }
                if libc::WIFEXITED(status) {
                    unsafe { libc::_exit(libc::WEXITSTATUS(status)) };
                }
                if libc::WIFSIGNALED(status) {
                    unsafe { libc::_exit(128 + libc::WTERMSIG(status)) };
                }
            }
        }
    }
}

/// Write a decimal number to a raw fd without allocating.
fn write_decimal(fd: RawFd, value: u64) -> io::Result<()> {
    let mut buf = [0u8; 20];
    let mut at = buf.len();
    let mut rest = value;
    loop {
        at -= 1;
        buf[at] = b'0' + (rest % 10) as u8;
        rest /= 10;
        if rest == 0 {
            break;
        }
    }
    let digits = &buf[at..];
    let written = unsafe { libc::write(fd, digits.as_ptr().cast(), digits.len()) };
    if written != digits.len() as isize {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
