//! Sandbox launcher: the container lifecycle orchestrator.
//!
//! `launch` coordinates the whole sequence: snapshot the image, stage the
//! container metadata, acquire network and cgroup, then fork the contained
//! process across every isolation primitive and tee its merged output to
//! the log. Resources are acquired in a fixed order and released in strict
//! reverse on every failure path; after a normal exit only the transient
//! network artefacts are torn down, while the volume, `.cmd`, `.log` and
//! the cgroup persist until `rm`.

pub(crate) mod child;

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use crate::cgroup::CgroupManager;
use crate::errors::{BockerError, BockerResult};
use crate::id::{self, EntityKind};
use crate::net::{self, NetworkManager};
use crate::store::Store;

pub struct SandboxLauncher<'r> {
    pub store: &'r Store,
    pub cgroups: &'r CgroupManager,
    pub network: &'r NetworkManager,
}

#[derive(Debug)]
pub struct LaunchOutcome {
    pub container_id: String,
    pub status: ExitStatus,
}

impl SandboxLauncher<'_> {
    /// Run `command` in a fresh container cloned from `image_id`.
    ///
    /// Blocks until the contained process exits. The command's own exit
    /// status is reported in the outcome, not as an error.
    pub async fn launch(&self, image_id: &str, command: &[String]) -> BockerResult<LaunchOutcome> {
        if command.is_empty() {
            return Err(BockerError::Usage("run requires a command".into()));
        }
        if !self.store.exists(image_id) {
            return Err(BockerError::NoSuchEntity(image_id.to_string()));
        }
        let cmdline = command.join(" ");

        // Hold the store lock across acquisition only; `ps` and `logs` must
        // keep working while the container runs.
        let lock = self.store.lock_exclusive()?;

        let container_id = id::allocate(self.store, EntityKind::Container)?;
        self.store.snapshot_volume(image_id, &container_id)?;

        if let Err(e) = self.prepare_metadata(&container_id, &cmdline) {
            self.discard_volume(&container_id);
            return Err(e);
        }

        let net_handle = match self.network.setup(&container_id).await {
            Ok(handle) => handle,
            Err(e) => {
                self.discard_volume(&container_id);
                return Err(e);
            }
        };

        if let Err(e) = self.cgroups.attach(&container_id) {
            self.network.teardown_best_effort(net_handle).await;
            self.discard_volume(&container_id);
            return Err(e);
        }

        let spawned = self.spawn_child(&container_id, &cmdline);
        let (child, pipe) = match spawned {
            Ok(parts) => parts,
            Err(e) => {
                self.cgroups.detach(&container_id);
                self.network.teardown_best_effort(net_handle).await;
                self.discard_volume(&container_id);
                return Err(e);
            }
        };
        drop(lock);

        tracing::info!(container_id = %container_id, image_id = %image_id, cmd = %cmdline, "container started");

        let log_path = self
            .store
            .volume_path(&container_id)
            .join(format!("{container_id}.log"));
        let status = self.supervise(child, pipe, log_path).await;

        // Normal exit teardown: network only. The cgroup is removed by `rm`,
        // the volume and its `.cmd`/`.log` persist for inspection.
        self.network.teardown_best_effort(net_handle).await;
        let _ = self
            .store
            .remove_meta(&container_id, &format!("{container_id}.pid"));

        let status = status?;
        tracing::info!(
            container_id = %container_id,
            code = ?status.code(),
            "container exited"
        );
        Ok(LaunchOutcome {
            container_id,
            status,
        })
    }

    /// Stage the container volume: DNS and the verbatim command line, both
    /// written before anything can execute.
    fn prepare_metadata(&self, container_id: &str, cmdline: &str) -> BockerResult<()> {
        self.store
            .write_meta(container_id, "etc/resolv.conf", "nameserver 8.8.8.8\n")?;
        self.store
            .write_meta(container_id, &format!("{container_id}.cmd"), &format!("{cmdline}\n"))
    }

    /// Fork the contained process. The child walks into the container's
    /// cgroup, netns, fresh namespaces and chroot before exec'ing a shell
    /// that mounts /proc and runs the user command.
    fn spawn_child(
        &self,
        container_id: &str,
        cmdline: &str,
    ) -> BockerResult<(tokio::process::Child, File)> {
        let volume = self.store.volume_path(container_id);

        let cgroup_tasks = self.cgroups.open_task_files(container_id)?;
        let netns = File::open(net::netns_path(container_id))
            .map_err(|e| BockerError::NetworkSetup(format!("open pinned netns: {e}")))?;
        let pid_record = File::create(volume.join(format!("{container_id}.pid")))
            .map_err(|e| BockerError::Store(format!("create pid record: {e}")))?;
        let root = CString::new(volume.as_os_str().as_bytes())
            .map_err(|e| BockerError::Internal(format!("volume path: {e}")))?;

        let ctx = child::SandboxContext {
            cgroup_tasks,
            netns,
            pid_record,
            root,
        };

        let (pipe_rx, pipe_tx) = nix::unistd::pipe().map_err(io::Error::from)?;
        let pipe_tx_clone = pipe_tx.try_clone().map_err(io::Error::from)?;

        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(shell_line(cmdline))
            .stdin(Stdio::null())
            .stdout(Stdio::from(pipe_tx_clone))
            .stderr(Stdio::from(pipe_tx));
        unsafe {
            cmd.pre_exec(move || child::enter_sandbox(&ctx));
        }

        let spawned = cmd
            .spawn()
            .map_err(|e| BockerError::Internal(format!("launch container process: {e}")));
        // Dropping the command releases the parent's pipe writers so the
        // reader sees EOF once the contained process tree exits.
        drop(cmd);

        Ok((spawned?, File::from(pipe_rx)))
    }

    /// Tee the child's merged output to the log and live stdout, then reap.
    async fn supervise(
        &self,
        mut child: tokio::process::Child,
        pipe: File,
        log_path: PathBuf,
    ) -> BockerResult<ExitStatus> {
        let tee = tokio::task::spawn_blocking(move || tee_output(pipe, &log_path));
        let status = child.wait().await?;
        match tee.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "log capture ended early"),
            Err(e) => tracing::warn!(error = %e, "log capture task failed"),
        }
        Ok(status)
    }

    fn discard_volume(&self, container_id: &str) {
        if let Err(e) = self.store.delete_volume(container_id) {
            tracing::warn!(container_id = %container_id, error = %e, "failed to discard snapshot during unwind");
        }
    }
}

/// The line handed to `/bin/sh -c` inside the sandbox: proc first, then the
/// user command, sharing one shell.
fn shell_line(cmdline: &str) -> String {
    format!("/bin/mount -t proc proc /proc && {cmdline}")
}

/// Forward everything line by line, appending to the log as it arrives so
/// `logs` always sees a prefix of the final contents.
fn tee_output(pipe: File, log_path: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(pipe);
    let mut log = OpenOptions::new().create(true).append(true).open(log_path)?;
    let stdout = io::stdout();
    let mut buf = Vec::with_capacity(4096);
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        log.write_all(&buf)?;
        let mut out = stdout.lock();
        out.write_all(&buf)?;
        out.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use tempfile::tempdir;

    fn launcher_parts(root: &Path) -> (RuntimeConfig, Store, CgroupManager, NetworkManager) {
        let config = RuntimeConfig::from_lookup(|_| None);
        let store = Store::new(root.join("store")).unwrap();
        let cgroups = CgroupManager::with_root(root.join("cgroup"), &config);
        (config, store, cgroups, NetworkManager::new())
    }

    #[test]
    fn test_shell_line() {
        assert_eq!(
            shell_line("echo foo"),
            "/bin/mount -t proc proc /proc && echo foo"
        );
    }

    #[test]
    fn test_prepare_metadata() {
        let dir = tempdir().unwrap();
        let (_config, store, cgroups, network) = launcher_parts(dir.path());
        let launcher = SandboxLauncher {
            store: &store,
            cgroups: &cgroups,
            network: &network,
        };

        store.create_volume("ps_42100").unwrap();
        launcher.prepare_metadata("ps_42100", "echo foo").unwrap();

        assert_eq!(
            store.read_meta("ps_42100", "etc/resolv.conf").unwrap().as_deref(),
            Some("nameserver 8.8.8.8\n")
        );
        assert_eq!(
            store.read_meta("ps_42100", "ps_42100.cmd").unwrap().as_deref(),
            Some("echo foo\n")
        );
    }

    #[tokio::test]
    async fn test_launch_rejects_empty_command() {
        let dir = tempdir().unwrap();
        let (_config, store, cgroups, network) = launcher_parts(dir.path());
        let launcher = SandboxLauncher {
            store: &store,
            cgroups: &cgroups,
            network: &network,
        };
        let err = launcher.launch("img_42100", &[]).await.unwrap_err();
        assert!(matches!(err, BockerError::Usage(_)));
    }

    #[tokio::test]
    async fn test_launch_missing_image_creates_nothing() {
        let dir = tempdir().unwrap();
        let (_config, store, cgroups, network) = launcher_parts(dir.path());
        let launcher = SandboxLauncher {
            store: &store,
            cgroups: &cgroups,
            network: &network,
        };
        let err = launcher
            .launch("img_42100", &["true".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, BockerError::NoSuchEntity(_)));
        assert!(store.list_prefixed("ps_").unwrap().is_empty());
    }

    #[test]
    fn test_tee_output_appends() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("out.log");

        let (rx, tx) = nix::unistd::pipe().unwrap();
        let mut writer = File::from(tx);
        writer.write_all(b"line one\nline two\n").unwrap();
        drop(writer);

        tee_output(File::from(rx), &log_path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&log_path).unwrap(),
            "line one\nline two\n"
        );
    }
}
