//! Image acquisition: fetch, unpack, layer reassembly, registration.
//!
//! `pull` fetches a single compressed tarball for `name:tag`, flattens its
//! layer tars base-to-top into one filesystem tree, and registers the tree
//! as a store volume. `init` imports a local directory through the same
//! registration path. Scratch space is tempdir-backed and cleaned up on
//! every exit path by RAII.

pub mod manifest;

use std::fs::File;
use std::path::Path;

use flate2::read::GzDecoder;
use tar::Archive;

use crate::errors::{BockerError, BockerResult};
use crate::id::{self, EntityKind};
use crate::store::Store;

/// Provenance record kept inside every image volume.
pub const SOURCE_META: &str = "img.source";

pub struct ImageAcquirer {
    store: Store,
    registry: Option<String>,
    client: reqwest::Client,
}

impl ImageAcquirer {
    pub fn new(store: Store, registry: Option<String>) -> Self {
        Self {
            store,
            registry,
            client: reqwest::Client::new(),
        }
    }

    /// Fetch `name:tag` from the configured origin and register it.
    /// Returns the new image id.
    pub async fn pull(&self, name: &str, tag: &str) -> BockerResult<String> {
        validate_token(name, "image name")?;
        validate_token(tag, "image tag")?;
        let origin = self.registry.as_deref().ok_or_else(|| {
            BockerError::Acquisition("registry origin not configured (set R2_DOMAIN)".into())
        })?;

        let scratch = tempfile::tempdir()?;
        let archive_path = scratch.path().join(format!("{name}_{tag}.tar.gz"));
        let url = format!("https://{origin}/{name}_{tag}.tar.gz");

        tracing::info!(%name, %tag, %url, "pulling image");
        self.download(&url, &archive_path).await?;

        let id = self
            .acquire_archive(&archive_path, &format!("{name}:{tag}"))
            .await?;

        tracing::info!(image_id = %id, %name, %tag, "image registered");
        Ok(id)
    }

    /// Import a local directory as an image. Returns the new image id.
    pub fn import_directory(&self, dir: &Path) -> BockerResult<String> {
        if !dir.is_dir() {
            return Err(BockerError::Usage(format!(
                "no directory named '{}' exists",
                dir.display()
            )));
        }
        let id = self.register_tree(dir, &dir.display().to_string())?;
        tracing::info!(image_id = %id, source = %dir.display(), "directory imported");
        Ok(id)
    }

    /// Unpack a fetched archive, flatten its layers and register the result.
    ///
    /// Split from [`pull`] so the whole post-download pipeline is exercised
    /// by tests against locally built archives.
    pub(crate) async fn acquire_archive(
        &self,
        archive_path: &Path,
        source: &str,
    ) -> BockerResult<String> {
        let extract_dir = archive_path
            .parent()
            .ok_or_else(|| BockerError::Internal("scratch path has no parent".into()))?
            .join("extract");
        std::fs::create_dir_all(&extract_dir)?;

        {
            let archive_path = archive_path.to_path_buf();
            let extract_dir = extract_dir.clone();
            tokio::task::spawn_blocking(move || unpack_archive(&archive_path, &extract_dir))
                .await
                .map_err(|e| BockerError::Internal(format!("extraction task failed: {e}")))??;
        }

        let manifest_path = manifest::locate(&extract_dir).ok_or_else(|| {
            BockerError::MalformedImage("manifest.json not found in archive".into())
        })?;
        let raw = std::fs::read_to_string(&manifest_path)?;
        let entries = manifest::parse(&raw)?;

        // The directory holding the manifest is the working tree that
        // becomes the image filesystem.
        let root = manifest_path
            .parent()
            .ok_or_else(|| BockerError::Internal("manifest path has no parent".into()))?
            .to_path_buf();

        // Registry index data is not image content.
        let _ = std::fs::remove_file(root.join("repositories"));

        self.flatten_layers(&root, &entries).await?;

        for entry in &entries {
            if let Some(config) = &entry.config {
                let _ = std::fs::remove_file(manifest::member_path(&root, config)?);
            }
        }

        std::fs::write(root.join(SOURCE_META), format!("{source}\n"))?;
        self.register_tree(&root, source)
    }

    /// Extract each layer tar into the working tree in manifest order, then
    /// delete it. Later layers overwrite earlier ones.
    async fn flatten_layers(
        &self,
        root: &Path,
        entries: &[manifest::ManifestEntry],
    ) -> BockerResult<()> {
        for entry in entries {
            for layer in &entry.layers {
                let layer_path = manifest::member_path(root, layer)?;
                if !layer_path.is_file() {
                    return Err(BockerError::MalformedImage(format!(
                        "manifest references missing layer '{layer}'"
                    )));
                }
                tracing::debug!(%layer, "applying layer");
                {
                    let layer_path = layer_path.clone();
                    let root = root.to_path_buf();
                    tokio::task::spawn_blocking(move || unpack_layer(&layer_path, &root))
                        .await
                        .map_err(|e| {
                            BockerError::Internal(format!("layer extraction task failed: {e}"))
                        })??;
                }
                std::fs::remove_file(&layer_path)?;
            }
        }
        Ok(())
    }

    fn register_tree(&self, tree: &Path, source: &str) -> BockerResult<String> {
        let id = id::allocate(&self.store, EntityKind::Image)?;
        self.store.materialize_volume(&id, tree)?;
        // Pull stamps the tree before registration; an imported directory
        // may carry its own record. Only fill the gap.
        if self.store.read_meta(&id, SOURCE_META)?.is_none() {
            self.store
                .write_meta(&id, SOURCE_META, &format!("{source}\n"))?;
        }
        Ok(id)
    }

    async fn download(&self, url: &str, dest: &Path) -> BockerResult<()> {
        use futures::TryStreamExt;
        use tokio::io::AsyncWriteExt;

        let acq = |e: reqwest::Error| BockerError::Acquisition(format!("fetch {url}: {e}"));

        let resp = self.client.get(url).send().await.map_err(acq)?;
        let resp = resp.error_for_status().map_err(acq)?;

        let mut stream = resp.bytes_stream();
        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = stream.try_next().await.map_err(acq)? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

fn unpack_archive(archive_path: &Path, dest: &Path) -> BockerResult<()> {
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    configure_unpack(&mut archive);
    archive
        .unpack(dest)
        .map_err(|e| BockerError::MalformedImage(format!("extract archive: {e}")))
}

fn unpack_layer(layer_path: &Path, dest: &Path) -> BockerResult<()> {
    let file = File::open(layer_path)?;
    let mut archive = Archive::new(file);
    configure_unpack(&mut archive);
    archive
        .unpack(dest)
        .map_err(|e| BockerError::MalformedImage(format!("extract layer: {e}")))
}

fn configure_unpack<R: std::io::Read>(archive: &mut Archive<R>) {
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    // Ownership restoration needs CAP_CHOWN; skip it for unprivileged runs.
    archive.set_preserve_ownerships(unsafe { libc::geteuid() } == 0);
}

fn validate_token(token: &str, what: &str) -> BockerResult<()> {
    let ok = !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(BockerError::Usage(format!("invalid {what} '{token}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::tempdir;

    fn tar_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gz(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    /// A docker-save shaped archive: manifest + two layers where the second
    /// overwrites part of the first, plus registry metadata blobs.
    fn fixture_archive() -> Vec<u8> {
        let layer1 = tar_of(&[("bin/a", b"base-a"), ("bin/b", b"base-b")]);
        let layer2 = tar_of(&[("bin/b", b"top-b"), ("bin/c", b"top-c")]);
        let manifest =
            br#"[{"Config":"cfg.json","Layers":["l1/layer.tar","l2/layer.tar"]}]"#;
        let outer = tar_of(&[
            ("pkg/manifest.json", manifest.as_slice()),
            ("pkg/cfg.json", b"{}"),
            ("pkg/repositories", b"{}"),
            ("pkg/l1/layer.tar", layer1.as_slice()),
            ("pkg/l2/layer.tar", layer2.as_slice()),
        ]);
        gz(&outer)
    }

    fn acquirer(store: &Store) -> ImageAcquirer {
        ImageAcquirer::new(store.clone(), None)
    }

    #[tokio::test]
    async fn test_acquire_archive_flattens_layers() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("store")).unwrap();
        let archive = dir.path().join("busybox_latest.tar.gz");
        std::fs::write(&archive, fixture_archive()).unwrap();

        let id = acquirer(&store)
            .acquire_archive(&archive, "busybox:latest")
            .await
            .unwrap();

        assert!(id.starts_with("img_"));
        let vol = store.volume_path(&id);
        assert_eq!(std::fs::read(vol.join("bin/a")).unwrap(), b"base-a");
        assert_eq!(std::fs::read(vol.join("bin/b")).unwrap(), b"top-b");
        assert_eq!(std::fs::read(vol.join("bin/c")).unwrap(), b"top-c");
        // Layer tars and registry metadata are not image content.
        assert!(!vol.join("l1/layer.tar").exists());
        assert!(!vol.join("l2/layer.tar").exists());
        assert!(!vol.join("cfg.json").exists());
        assert!(!vol.join("repositories").exists());
        assert_eq!(
            store.read_meta(&id, SOURCE_META).unwrap().as_deref(),
            Some("busybox:latest\n")
        );
    }

    #[tokio::test]
    async fn test_acquire_archive_missing_manifest() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("store")).unwrap();
        let archive = dir.path().join("bad.tar.gz");
        std::fs::write(&archive, gz(&tar_of(&[("pkg/data", b"x")]))).unwrap();

        let err = acquirer(&store)
            .acquire_archive(&archive, "bad:latest")
            .await
            .unwrap_err();
        assert!(matches!(err, BockerError::MalformedImage(_)));
        // Nothing registered on failure.
        assert!(store.list_prefixed("img_").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_archive_missing_layer() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("store")).unwrap();
        let manifest = br#"[{"Layers":["gone/layer.tar"]}]"#;
        let archive = dir.path().join("bad.tar.gz");
        std::fs::write(
            &archive,
            gz(&tar_of(&[("pkg/manifest.json", manifest.as_slice())])),
        )
        .unwrap();

        let err = acquirer(&store)
            .acquire_archive(&archive, "bad:latest")
            .await
            .unwrap_err();
        assert!(matches!(err, BockerError::MalformedImage(_)));
        assert!(store.list_prefixed("img_").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_corrupt_archive() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("store")).unwrap();
        let archive = dir.path().join("corrupt.tar.gz");
        std::fs::write(&archive, b"definitely not gzip").unwrap();

        let err = acquirer(&store)
            .acquire_archive(&archive, "corrupt:latest")
            .await
            .unwrap_err();
        assert!(matches!(err, BockerError::MalformedImage(_)));
    }

    #[test]
    fn test_import_directory() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("store")).unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        std::fs::write(rootfs.join("etc/os-release"), "NAME=test\n").unwrap();

        let id = acquirer(&store).import_directory(&rootfs).unwrap();
        assert!(store.exists(&id));
        assert_eq!(
            store.read_meta(&id, SOURCE_META).unwrap().unwrap(),
            format!("{}\n", rootfs.display())
        );
    }

    #[test]
    fn test_import_directory_preserves_existing_source() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("store")).unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();
        std::fs::write(rootfs.join(SOURCE_META), "centos:7\n").unwrap();

        let id = acquirer(&store).import_directory(&rootfs).unwrap();
        assert_eq!(
            store.read_meta(&id, SOURCE_META).unwrap().as_deref(),
            Some("centos:7\n")
        );
    }

    #[test]
    fn test_import_missing_directory() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("store")).unwrap();
        let err = acquirer(&store)
            .import_directory(&dir.path().join("nope"))
            .unwrap_err();
        assert!(matches!(err, BockerError::Usage(_)));
    }

    #[tokio::test]
    async fn test_pull_requires_registry() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("store")).unwrap();
        let err = acquirer(&store).pull("centos", "7").await.unwrap_err();
        assert!(matches!(err, BockerError::Acquisition(_)));
    }

    #[tokio::test]
    async fn test_pull_rejects_bad_tokens() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("store")).unwrap();
        let err = acquirer(&store)
            .pull("../evil", "7")
            .await
            .unwrap_err();
        assert!(matches!(err, BockerError::Usage(_)));
    }
}
