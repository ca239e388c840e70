//! Cgroup manager: one named v1 group per container.
//!
//! For each configured controller `c`, the container's group lives at
//! `<root>/<c>/<id>`. CPU weight and the memory cap are written at attach
//! time; the child joins pre-exec by appending its pid to each group's
//! `tasks` file. Setup is strict, removal is best-effort.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::config::RuntimeConfig;
use crate::errors::{BockerError, BockerResult};

const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

pub struct CgroupManager {
    cgroup_root: PathBuf,
    controllers: Vec<String>,
    cpu_share: u64,
    mem_limit_bytes: u64,
}

impl CgroupManager {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self::with_root(DEFAULT_CGROUP_ROOT, config)
    }

    /// Root-injectable constructor; tests point this at a temp dir.
    pub fn with_root(cgroup_root: impl Into<PathBuf>, config: &RuntimeConfig) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            controllers: config.controllers.clone(),
            cpu_share: config.cpu_share,
            mem_limit_bytes: config.mem_limit_bytes(),
        }
    }

    fn group_dir(&self, controller: &str, id: &str) -> PathBuf {
        self.cgroup_root.join(controller).join(id)
    }

    /// Create the container's group under every controller and apply the
    /// resource limits. Strict: any failure is an error.
    pub fn attach(&self, id: &str) -> BockerResult<()> {
        for controller in &self.controllers {
            let dir = self.group_dir(controller, id);
            std::fs::create_dir_all(&dir).map_err(|e| {
                BockerError::Cgroup(format!("create {}: {e}", dir.display()))
            })?;
        }
        if self.controllers.iter().any(|c| c == "cpu") {
            self.write_limit(id, "cpu", "cpu.shares", self.cpu_share)?;
        }
        if self.controllers.iter().any(|c| c == "memory") {
            self.write_limit(id, "memory", "memory.limit_in_bytes", self.mem_limit_bytes)?;
        }
        tracing::debug!(
            container_id = %id,
            cpu_share = self.cpu_share,
            mem_limit_bytes = self.mem_limit_bytes,
            "cgroup attached"
        );
        Ok(())
    }

    /// Open the `tasks` file of every controller group for `id`.
    ///
    /// The launcher passes these fds across the fork so the child can join
    /// each group before anything else runs, without allocating post-fork.
    pub fn open_task_files(&self, id: &str) -> BockerResult<Vec<File>> {
        self.controllers
            .iter()
            .map(|controller| {
                let path = self.group_dir(controller, id).join("tasks");
                OpenOptions::new()
                    .write(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| BockerError::Cgroup(format!("open {}: {e}", path.display())))
            })
            .collect()
    }

    /// Remove the container's groups. Best-effort: a missing group is not an
    /// error, and leftover failures are only logged.
    pub fn detach(&self, id: &str) {
        for controller in &self.controllers {
            let dir = self.group_dir(controller, id);
            match std::fs::remove_dir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "failed to remove cgroup");
                }
            }
        }
    }

    fn write_limit(&self, id: &str, controller: &str, knob: &str, value: u64) -> BockerResult<()> {
        let path = self.group_dir(controller, id).join(knob);
        write_value(&path, value)
            .map_err(|e| BockerError::Cgroup(format!("write {}: {e}", path.display())))
    }
}

fn write_value(path: &Path, value: u64) -> std::io::Result<()> {
    std::fs::write(path, format!("{value}\n"))
}
