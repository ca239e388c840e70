//! On-disk store: one directory of copy-on-write volumes.
//!
//! The store root holds every image (`img_*`) and container (`ps_*`) volume
//! as an immediate child; the filesystem layout *is* the database, and this
//! module is the only place that knows it. Everything else asks the store
//! whether an id exists, never the filesystem directly.

pub mod btrfs;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::errors::{BockerError, BockerResult};

/// Handle to the store root. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

/// Advisory exclusive lock on the store root, released on drop.
///
/// Mutating commands hold this across volume/metadata changes so concurrent
/// invocations cannot race on id allocation; read-only commands do not take
/// it, so `ps` and `logs` stay usable while a container runs.
pub struct StoreLock {
    _lock: Flock<std::fs::File>,
}

impl Store {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn new(root: PathBuf) -> BockerResult<Self> {
        std::fs::create_dir_all(&root)
            .map_err(|e| BockerError::Store(format!("create store root {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the volume for `id`. The id must already be validated.
    pub fn volume_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// True iff a volume named `id` is listed under the store root.
    pub fn exists(&self, id: &str) -> bool {
        validate_name(id).is_ok() && self.volume_path(id).is_dir()
    }

    /// Take the coarse store lock. Blocks until available.
    pub fn lock_exclusive(&self) -> BockerResult<StoreLock> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.root.join(".lock"))
            .map_err(|e| BockerError::Store(format!("open store lock: {e}")))?;
        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| BockerError::Store(format!("lock store root: {errno}")))?;
        Ok(StoreLock { _lock: lock })
    }

    /// Create a new empty volume. Fails if `id` already exists.
    pub fn create_volume(&self, id: &str) -> BockerResult<PathBuf> {
        validate_name(id)?;
        if self.exists(id) {
            return Err(BockerError::Store(format!("volume '{id}' already exists")));
        }
        let path = self.volume_path(id);
        match btrfs::create_subvolume(&self.root, id) {
            Ok(()) => {}
            Err(e) if btrfs::is_unsupported(&e) => {
                tracing::debug!(%id, "store root is not btrfs, creating plain directory");
                std::fs::create_dir(&path)
                    .map_err(|e| BockerError::Store(format!("create volume '{id}': {e}")))?;
            }
            Err(e) => return Err(BockerError::Store(format!("create volume '{id}': {e}"))),
        }
        Ok(path)
    }

    /// Clone `src_id` as a new volume `dst_id`. The clone shares blocks with
    /// its source where the filesystem allows but is independent afterward.
    pub fn snapshot_volume(&self, src_id: &str, dst_id: &str) -> BockerResult<PathBuf> {
        validate_name(src_id)?;
        validate_name(dst_id)?;
        if !self.exists(src_id) {
            return Err(BockerError::NoSuchEntity(src_id.to_string()));
        }
        if self.exists(dst_id) {
            return Err(BockerError::Store(format!("volume '{dst_id}' already exists")));
        }
        let src = self.volume_path(src_id);
        let dst = self.volume_path(dst_id);
        match btrfs::snapshot_subvolume(&src, &self.root, dst_id) {
            Ok(()) => {}
            Err(e) if btrfs::is_unsupported(&e) => {
                btrfs::copy_tree(&src, &dst).map_err(|e| {
                    BockerError::Store(format!("snapshot '{src_id}' -> '{dst_id}': {e}"))
                })?;
            }
            Err(e) => {
                return Err(BockerError::Store(format!(
                    "snapshot '{src_id}' -> '{dst_id}': {e}"
                )));
            }
        }
        Ok(dst)
    }

    /// Create a volume `id` populated with the contents of `src_dir`.
    pub fn materialize_volume(&self, id: &str, src_dir: &Path) -> BockerResult<PathBuf> {
        let path = self.create_volume(id)?;
        if let Err(e) = btrfs::copy_tree(src_dir, &path) {
            // Half-copied volumes must not stay reachable by name.
            let _ = self.delete_volume(id);
            return Err(BockerError::Store(format!(
                "populate volume '{id}' from {}: {e}",
                src_dir.display()
            )));
        }
        Ok(path)
    }

    /// Remove a volume and all of its contents.
    pub fn delete_volume(&self, id: &str) -> BockerResult<()> {
        validate_name(id)?;
        if !self.exists(id) {
            return Err(BockerError::NoSuchEntity(id.to_string()));
        }
        match btrfs::delete_subvolume(&self.root, id) {
            Ok(()) => Ok(()),
            Err(e) if btrfs::is_unsupported_delete(&e) => {
                std::fs::remove_dir_all(self.volume_path(id))
                    .map_err(|e| BockerError::Store(format!("delete volume '{id}': {e}")))
            }
            Err(e) => Err(BockerError::Store(format!("delete volume '{id}': {e}"))),
        }
    }

    /// Write a small text file at `rel` inside the volume `id`.
    pub fn write_meta(&self, id: &str, rel: &str, contents: &str) -> BockerResult<()> {
        let path = self.meta_path(id, rel)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BockerError::Store(format!("create {}: {e}", parent.display())))?;
        }
        std::fs::write(&path, contents)
            .map_err(|e| BockerError::Store(format!("write {}: {e}", path.display())))
    }

    /// Read a small text file at `rel` inside the volume `id`.
    /// Returns `None` when the file is absent.
    pub fn read_meta(&self, id: &str, rel: &str) -> BockerResult<Option<String>> {
        let path = self.meta_path(id, rel)?;
        match std::fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BockerError::Store(format!("read {}: {e}", path.display()))),
        }
    }

    /// Read a file at `rel` inside the volume `id` as raw bytes.
    pub fn read_meta_bytes(&self, id: &str, rel: &str) -> BockerResult<Option<Vec<u8>>> {
        let path = self.meta_path(id, rel)?;
        match std::fs::read(&path) {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BockerError::Store(format!("read {}: {e}", path.display()))),
        }
    }

    /// Remove a metadata file, ignoring absence.
    pub fn remove_meta(&self, id: &str, rel: &str) -> BockerResult<()> {
        let path = self.meta_path(id, rel)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BockerError::Store(format!("remove {}: {e}", path.display()))),
        }
    }

    /// Volume names starting with `prefix`, in sorted order so listings are
    /// stable across runs.
    pub fn list_prefixed(&self, prefix: &str) -> BockerResult<Vec<String>> {
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| BockerError::Store(format!("list store root: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| BockerError::Store(format!("list store root: {e}")))?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            if name.starts_with(prefix) && entry.path().is_dir() {
                out.push(name);
            }
        }
        out.sort();
        Ok(out)
    }

    fn meta_path(&self, id: &str, rel: &str) -> BockerResult<PathBuf> {
        validate_name(id)?;
        let rel_path = Path::new(rel);
        if rel_path.is_absolute()
            || rel_path
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(BockerError::Store(format!("invalid metadata path '{rel}'")));
        }
        Ok(self.volume_path(id).join(rel_path))
    }
}

/// Ids are embedded in paths, interface names and cgroup names; reject
/// anything that could escape those contexts.
fn validate_name(id: &str) -> BockerResult<()> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
        && id != "."
        && id != "..";
    if ok {
        Ok(())
    } else {
        Err(BockerError::Store(format!("invalid volume name '{id}'")))
    }
}
