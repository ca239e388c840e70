//! High-level runtime facade.
//!
//! `Bocker` wires the components together once at startup and exposes one
//! method per user command. The store is the single source of truth for
//! existence; every operation consults it before acting.

use std::path::Path;
use std::process::ExitStatus;

use crate::cgroup::CgroupManager;
use crate::config::RuntimeConfig;
use crate::errors::{BockerError, BockerResult};
use crate::exec;
use crate::id::{self, EntityKind};
use crate::image::{ImageAcquirer, SOURCE_META};
use crate::net::NetworkManager;
use crate::sandbox::{LaunchOutcome, SandboxLauncher};
use crate::store::Store;

/// One row of `images` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRow {
    pub id: String,
    pub source: String,
}

/// One row of `ps` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRow {
    pub id: String,
    pub command: String,
}

pub struct Bocker {
    config: RuntimeConfig,
    store: Store,
    cgroups: CgroupManager,
    network: NetworkManager,
    acquirer: ImageAcquirer,
}

impl Bocker {
    /// Build a runtime from a frozen configuration snapshot.
    ///
    /// All setup (store root creation included) completes before returning;
    /// there are no partially initialized runtimes.
    pub fn new(config: RuntimeConfig) -> BockerResult<Self> {
        let store = Store::new(config.store_root.clone())?;
        let cgroups = CgroupManager::new(&config);
        let network = NetworkManager::new();
        let acquirer = ImageAcquirer::new(store.clone(), config.registry.clone());
        tracing::debug!(store_root = %config.store_root.display(), "runtime initialized");
        Ok(Self {
            config,
            store,
            cgroups,
            network,
            acquirer,
        })
    }

    /// Test-oriented constructor with an injected cgroup root.
    #[cfg(test)]
    pub(crate) fn with_cgroup_root(
        config: RuntimeConfig,
        cgroup_root: std::path::PathBuf,
    ) -> BockerResult<Self> {
        let mut runtime = Self::new(config)?;
        runtime.cgroups = CgroupManager::with_root(cgroup_root, &runtime.config);
        Ok(runtime)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// `pull <name> <tag>`: acquire and register an image.
    pub async fn pull(&self, name: &str, tag: &str) -> BockerResult<String> {
        let _lock = self.store.lock_exclusive()?;
        self.acquirer.pull(name, tag).await
    }

    /// `init <dir>`: import a directory as an image.
    pub fn init_directory(&self, dir: &Path) -> BockerResult<String> {
        let _lock = self.store.lock_exclusive()?;
        self.acquirer.import_directory(dir)
    }

    /// `run <img> <cmd...>`: launch a container and stream its output.
    pub async fn run(&self, image_id: &str, command: &[String]) -> BockerResult<LaunchOutcome> {
        if id::kind_of(image_id) != Some(EntityKind::Image) {
            return Err(BockerError::NoSuchEntity(image_id.to_string()));
        }
        let launcher = SandboxLauncher {
            store: &self.store,
            cgroups: &self.cgroups,
            network: &self.network,
        };
        launcher.launch(image_id, command).await
    }

    /// `exec <ctr> <cmd...>`: run a command inside a running container.
    pub async fn exec(&self, container_id: &str, command: &[String]) -> BockerResult<ExitStatus> {
        exec::exec_into(&self.store, container_id, command).await
    }

    /// `logs <ctr>`: the stored log, verbatim.
    pub fn logs(&self, container_id: &str) -> BockerResult<Vec<u8>> {
        if id::kind_of(container_id) != Some(EntityKind::Container)
            || !self.store.exists(container_id)
        {
            return Err(BockerError::NoSuchEntity(container_id.to_string()));
        }
        self.store
            .read_meta_bytes(container_id, &format!("{container_id}.log"))?
            .ok_or_else(|| BockerError::NoLog(container_id.to_string()))
    }

    /// `commit <ctr> <img>`: replace an existing image with a snapshot of
    /// the container. Destructive of the target image, by design.
    pub fn commit(&self, container_id: &str, image_id: &str) -> BockerResult<()> {
        let _lock = self.store.lock_exclusive()?;
        if id::kind_of(container_id) != Some(EntityKind::Container)
            || !self.store.exists(container_id)
        {
            return Err(BockerError::NoSuchEntity(container_id.to_string()));
        }
        if id::kind_of(image_id) != Some(EntityKind::Image) || !self.store.exists(image_id) {
            return Err(BockerError::NoSuchEntity(image_id.to_string()));
        }

        self.store.delete_volume(image_id)?;
        self.cgroups.detach(image_id);
        self.store.snapshot_volume(container_id, image_id)?;
        tracing::info!(container_id = %container_id, image_id = %image_id, "container committed");
        Ok(())
    }

    /// `rm <id>`: delete a volume; best-effort cgroup cleanup. Network
    /// artefacts are torn down at process exit, never here.
    pub fn remove(&self, id: &str) -> BockerResult<()> {
        let _lock = self.store.lock_exclusive()?;
        if id::kind_of(id).is_none() || !self.store.exists(id) {
            return Err(BockerError::NoSuchEntity(id.to_string()));
        }
        self.store.delete_volume(id)?;
        self.cgroups.detach(id);
        tracing::info!(%id, "removed");
        Ok(())
    }

    /// `images`: every image with its recorded provenance.
    pub fn images(&self) -> BockerResult<Vec<ImageRow>> {
        self.store
            .list_prefixed(EntityKind::Image.prefix())?
            .into_iter()
            .map(|id| {
                let source = self
                    .store
                    .read_meta(&id, SOURCE_META)?
                    .map(|s| s.trim_end().to_string())
                    .unwrap_or_default();
                Ok(ImageRow { id, source })
            })
            .collect()
    }

    /// `ps`: every container with its recorded command.
    pub fn containers(&self) -> BockerResult<Vec<ContainerRow>> {
        self.store
            .list_prefixed(EntityKind::Container.prefix())?
            .into_iter()
            .map(|id| {
                let command = self
                    .store
                    .read_meta(&id, &format!("{id}.cmd"))?
                    .map(|s| s.trim_end().to_string())
                    .unwrap_or_default();
                Ok(ContainerRow { id, command })
            })
            .collect()
    }
}

/// Render the `images` table. The header is present even when empty.
pub fn render_images(rows: &[ImageRow]) -> String {
    let mut out = String::from("IMAGE_ID\t\tSOURCE\n");
    for row in rows {
        out.push_str(&row.id);
        out.push_str("\t\t");
        out.push_str(&row.source);
        out.push('\n');
    }
    out
}

/// Render the `ps` table. The header is present even when empty.
pub fn render_containers(rows: &[ContainerRow]) -> String {
    let mut out = String::from("CONTAINER_ID\t\tCOMMAND\n");
    for row in rows {
        out.push_str(&row.id);
        out.push_str("\t\t");
        out.push_str(&row.command);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_runtime(root: &Path) -> Bocker {
        let store_root = root.join("store");
        let config = RuntimeConfig::from_lookup(move |key| match key {
            "BOCKER_BTRFS_PATH" => Some(store_root.display().to_string()),
            _ => None,
        });
        Bocker::with_cgroup_root(config, root.join("cgroup")).unwrap()
    }

    fn seed_image(runtime: &Bocker, root: &Path) -> String {
        let rootfs = root.join("rootfs");
        std::fs::create_dir_all(rootfs.join("bin")).unwrap();
        std::fs::write(rootfs.join("bin/sh"), "#!/fake\n").unwrap();
        runtime.init_directory(&rootfs).unwrap()
    }

    /// Containers can't be launched without root; fabricate the on-disk
    /// shape `run` leaves behind.
    fn seed_container(runtime: &Bocker, image_id: &str, id: &str, cmd: &str) -> String {
        runtime.store().snapshot_volume(image_id, id).unwrap();
        runtime
            .store()
            .write_meta(id, &format!("{id}.cmd"), &format!("{cmd}\n"))
            .unwrap();
        id.to_string()
    }

    #[test]
    fn test_init_then_images() {
        let dir = tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let id = seed_image(&runtime, dir.path());

        let rows = runtime.images().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].source, dir.path().join("rootfs").display().to_string());
    }

    #[test]
    fn test_ps_lists_command() {
        let dir = tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let image = seed_image(&runtime, dir.path());
        seed_container(&runtime, &image, "ps_42111", "echo foo");

        let rows = runtime.containers().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "ps_42111");
        assert_eq!(rows[0].command, "echo foo");
    }

    #[test]
    fn test_logs_lifecycle() {
        let dir = tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let image = seed_image(&runtime, dir.path());

        let err = runtime.logs("ps_42120").unwrap_err();
        assert!(matches!(err, BockerError::NoSuchEntity(_)));

        seed_container(&runtime, &image, "ps_42120", "true");
        let err = runtime.logs("ps_42120").unwrap_err();
        assert!(matches!(err, BockerError::NoLog(_)));

        runtime
            .store()
            .write_meta("ps_42120", "ps_42120.log", "hello\n")
            .unwrap();
        assert_eq!(runtime.logs("ps_42120").unwrap(), b"hello\n");
    }

    #[test]
    fn test_commit_replaces_image() {
        let dir = tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let image = seed_image(&runtime, dir.path());
        seed_container(&runtime, &image, "ps_42130", "touch /new");
        runtime
            .store()
            .write_meta("ps_42130", "new-file", "payload\n")
            .unwrap();

        runtime.commit("ps_42130", &image).unwrap();

        // The image now carries the container's change; the container is
        // untouched.
        assert_eq!(
            runtime.store().read_meta(&image, "new-file").unwrap().as_deref(),
            Some("payload\n")
        );
        assert!(runtime.store().exists("ps_42130"));
    }

    #[test]
    fn test_commit_missing_entities() {
        let dir = tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let image = seed_image(&runtime, dir.path());

        let err = runtime.commit("ps_42140", &image).unwrap_err();
        assert!(matches!(err, BockerError::NoSuchEntity(_)));

        seed_container(&runtime, &image, "ps_42140", "true");
        let err = runtime.commit("ps_42140", "img_42999").unwrap_err();
        assert!(matches!(err, BockerError::NoSuchEntity(_)));
    }

    #[test]
    fn test_remove_and_idempotence() {
        let dir = tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let image = seed_image(&runtime, dir.path());
        seed_container(&runtime, &image, "ps_42150", "true");

        runtime.remove("ps_42150").unwrap();
        assert!(runtime.containers().unwrap().is_empty());

        let err = runtime.remove("ps_42150").unwrap_err();
        assert!(matches!(err, BockerError::NoSuchEntity(_)));
        // A failed remove must not disturb the rest of the store.
        assert_eq!(runtime.images().unwrap().len(), 1);
    }

    #[test]
    fn test_run_on_missing_image() {
        let dir = tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = rt
            .block_on(runtime.run("img_42999", &["true".into()]))
            .unwrap_err();
        assert!(matches!(err, BockerError::NoSuchEntity(_)));
        assert!(runtime.containers().unwrap().is_empty());
    }

    #[test]
    fn test_render_tables_header_only() {
        assert_eq!(render_images(&[]), "IMAGE_ID\t\tSOURCE\n");
        assert_eq!(render_containers(&[]), "CONTAINER_ID\t\tCOMMAND\n");
    }

    #[test]
    fn test_render_tables_rows() {
        let images = vec![ImageRow {
            id: "img_42100".into(),
            source: "centos:7".into(),
        }];
        assert_eq!(
            render_images(&images),
            "IMAGE_ID\t\tSOURCE\nimg_42100\t\tcentos:7\n"
        );

        let containers = vec![ContainerRow {
            id: "ps_42101".into(),
            command: "echo foo".into(),
        }];
        assert_eq!(
            render_containers(&containers),
            "CONTAINER_ID\t\tCOMMAND\nps_42101\t\techo foo\n"
        );
    }
}
