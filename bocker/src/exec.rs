//! Exec-into: run a follow-up command inside a running container.
//!
//! The contained pid is recorded at launch in `<id>.pid`; before trusting
//! it, the pid is validated against the container's pinned network
//! namespace so a recycled pid or a stale record reads as "not running"
//! instead of joining some unrelated process.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::process::{ExitStatus, Stdio};

use nix::sched::CloneFlags;

use crate::errors::{BockerError, BockerResult};
use crate::id::{self, EntityKind};
use crate::net;
use crate::sandbox::child;
use crate::store::Store;
use crate::util;

/// Join the namespaces of the running container `container_id` and execute
/// `command` (argv, no shell) chrooted into its volume.
pub async fn exec_into(
    store: &Store,
    container_id: &str,
    command: &[String],
) -> BockerResult<ExitStatus> {
    if command.is_empty() {
        return Err(BockerError::Usage("exec requires a command".into()));
    }
    if id::kind_of(container_id) != Some(EntityKind::Container) || !store.exists(container_id) {
        return Err(BockerError::NoSuchEntity(container_id.to_string()));
    }

    let pid = locate_contained_pid(store, container_id)?;
    tracing::debug!(container_id = %container_id, pid, "joining container namespaces");

    let ctx = child::JoinContext {
        namespaces: open_namespaces(pid, container_id)?,
        root: CString::new(store.volume_path(container_id).as_os_str().as_bytes())
            .map_err(|e| BockerError::Internal(format!("volume path: {e}")))?,
    };

    let mut cmd = tokio::process::Command::new(&command[0]);
    cmd.args(&command[1..])
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    unsafe {
        cmd.pre_exec(move || child::enter_existing(&ctx));
    }

    let mut spawned = cmd
        .spawn()
        .map_err(|e| BockerError::Internal(format!("launch exec process: {e}")))?;
    let status = spawned.wait().await?;
    Ok(status)
}

/// Resolve the pid of the contained init process, or `NotRunning`.
fn locate_contained_pid(store: &Store, container_id: &str) -> BockerResult<u32> {
    let not_running = || BockerError::NotRunning(container_id.to_string());

    let recorded = store
        .read_meta(container_id, &format!("{container_id}.pid"))?
        .ok_or_else(not_running)?;
    let pid: u32 = recorded.trim().parse().map_err(|_| not_running())?;

    // The pinned namespace exists only while the container runs, and the
    // recorded pid must still sit inside that very namespace.
    let netns = net::netns_path(container_id);
    if !netns.exists() || !util::is_process_alive(pid) || !util::is_in_netns(pid, &netns) {
        return Err(not_running());
    }
    Ok(pid)
}

/// Open the target's namespace fds. Mount is entered last: once the mount
/// namespace switches, `/proc/<pid>` paths are no longer ours to resolve.
fn open_namespaces(pid: u32, container_id: &str) -> BockerResult<Vec<(File, CloneFlags)>> {
    let kinds = [
        ("uts", CloneFlags::CLONE_NEWUTS),
        ("ipc", CloneFlags::CLONE_NEWIPC),
        ("net", CloneFlags::CLONE_NEWNET),
        ("pid", CloneFlags::CLONE_NEWPID),
        ("mnt", CloneFlags::CLONE_NEWNS),
    ];
    kinds
        .into_iter()
        .map(|(name, flag)| {
            File::open(format!("/proc/{pid}/ns/{name}"))
                .map(|f| (f, flag))
                .map_err(|_| BockerError::NotRunning(container_id.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_exec_missing_container() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf()).unwrap();
        let err = exec_into(&store, "ps_42100", &["sh".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, BockerError::NoSuchEntity(_)));
    }

    #[tokio::test]
    async fn test_exec_stopped_container() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf()).unwrap();
        store.create_volume("ps_42100").unwrap();

        // No pid record: never started.
        let err = exec_into(&store, "ps_42100", &["sh".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, BockerError::NotRunning(_)));

        // Stale pid record without a pinned namespace: stopped.
        store.write_meta("ps_42100", "ps_42100.pid", "1\n").unwrap();
        let err = exec_into(&store, "ps_42100", &["sh".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, BockerError::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_exec_requires_command() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf()).unwrap();
        let err = exec_into(&store, "ps_42100", &[]).await.unwrap_err();
        assert!(matches!(err, BockerError::Usage(_)));
    }
}
