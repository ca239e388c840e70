//! Raw btrfs subvolume ioctls, plus the reflink copy used as a fallback.
//!
//! The store prefers true subvolume snapshots (O(1) clones). On roots that
//! are not btrfs the ioctls fail with `ENOTTY`/`EOPNOTSUPP`; callers detect
//! that via [`is_unsupported`] and fall back to plain directories populated
//! by [`copy_tree`], which reflinks file contents where the filesystem
//! allows and degrades to byte copies where it does not.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt, symlink};
use std::path::Path;

use walkdir::WalkDir;

const BTRFS_IOCTL_MAGIC: u8 = 0x94;
const BTRFS_PATH_NAME_MAX: usize = 4087;
const BTRFS_SUBVOL_NAME_MAX: usize = 4039;

#[repr(C)]
pub struct BtrfsIoctlVolArgs {
    pub fd: i64,
    pub name: [u8; BTRFS_PATH_NAME_MAX + 1],
}

#[repr(C)]
pub struct BtrfsIoctlVolArgsV2 {
    pub fd: i64,
    pub transid: u64,
    pub flags: u64,
    pub unused: [u64; 4],
    pub name: [u8; BTRFS_SUBVOL_NAME_MAX + 1],
}

mod ioctl {
    use super::*;

    nix::ioctl_write_ptr!(subvol_create, BTRFS_IOCTL_MAGIC, 14, BtrfsIoctlVolArgs);
    nix::ioctl_write_ptr!(snap_destroy, BTRFS_IOCTL_MAGIC, 15, BtrfsIoctlVolArgs);
    nix::ioctl_write_ptr!(snap_create_v2, BTRFS_IOCTL_MAGIC, 23, BtrfsIoctlVolArgsV2);

    // FICLONE shares the btrfs magic; works on any reflink-capable fs.
    nix::ioctl_write_int!(ficlone, BTRFS_IOCTL_MAGIC, 9);
}

/// Create an empty subvolume `name` under `parent`.
pub fn create_subvolume(parent: &Path, name: &str) -> io::Result<()> {
    let dir = File::open(parent)?;
    let args = vol_args(0, name)?;
    unsafe { ioctl::subvol_create(dir.as_raw_fd(), &args) }.map_err(io::Error::from)?;
    Ok(())
}

/// Snapshot the subvolume at `src` as `name` under `parent`.
pub fn snapshot_subvolume(src: &Path, parent: &Path, name: &str) -> io::Result<()> {
    let src_dir = File::open(src)?;
    let dst_parent = File::open(parent)?;
    let args = vol_args_v2(src_dir.as_raw_fd() as i64, name)?;
    unsafe { ioctl::snap_create_v2(dst_parent.as_raw_fd(), &args) }.map_err(io::Error::from)?;
    Ok(())
}

/// Delete the subvolume `name` under `parent`, recursively.
pub fn delete_subvolume(parent: &Path, name: &str) -> io::Result<()> {
    let dir = File::open(parent)?;
    let args = vol_args(0, name)?;
    unsafe { ioctl::snap_destroy(dir.as_raw_fd(), &args) }.map_err(io::Error::from)?;
    Ok(())
}

/// True when the error means "this filesystem does not speak btrfs ioctls",
/// as opposed to a real failure.
pub fn is_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOTTY) | Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS)
    )
}

/// Like [`is_unsupported`], for deletion: `EINVAL` additionally covers a
/// plain directory sitting on a btrfs root (created by the fallback path).
pub fn is_unsupported_delete(err: &io::Error) -> bool {
    is_unsupported(err) || err.raw_os_error() == Some(libc::EINVAL)
}

fn vol_args(fd: i64, name: &str) -> io::Result<BtrfsIoctlVolArgs> {
    let mut args = BtrfsIoctlVolArgs {
        fd,
        name: [0; BTRFS_PATH_NAME_MAX + 1],
    };
    copy_name(&mut args.name, name)?;
    Ok(args)
}

fn vol_args_v2(fd: i64, name: &str) -> io::Result<BtrfsIoctlVolArgsV2> {
    let mut args = BtrfsIoctlVolArgsV2 {
        fd,
        transid: 0,
        flags: 0,
        unused: [0; 4],
        name: [0; BTRFS_SUBVOL_NAME_MAX + 1],
    };
    copy_name(&mut args.name, name)?;
    Ok(args)
}

fn copy_name(buf: &mut [u8], name: &str) -> io::Result<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= buf.len() || bytes.contains(&0) {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Recursively copy `src` into `dst`, reflinking file contents when the
/// filesystem supports it. Directories and symlinks are recreated; special
/// files (device nodes, fifos) are skipped with a warning.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            let mode = entry.metadata().map_err(io::Error::other)?.mode();
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode & 0o7777))?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            symlink(&link, &target)?;
        } else if file_type.is_file() {
            reflink_or_copy(entry.path(), &target)?;
        } else {
            tracing::warn!(path = %entry.path().display(), "skipping special file during copy");
        }
    }
    Ok(())
}

fn reflink_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    let input = File::open(src)?;
    let meta = input.metadata()?;
    let output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(meta.mode() & 0o7777)
        .open(dst)?;

    let cloned = unsafe {
        ioctl::ficlone(output.as_raw_fd(), input.as_raw_fd() as libc::c_ulong)
    };
    match cloned {
        Ok(_) => {}
        Err(errno)
            if matches!(
                errno,
                nix::errno::Errno::ENOTTY
                    | nix::errno::Errno::EOPNOTSUPP
                    | nix::errno::Errno::EINVAL
                    | nix::errno::Errno::EXDEV
            ) =>
        {
            drop(output);
            std::fs::copy(src, dst)?;
        }
        Err(errno) => return Err(io::Error::from(errno)),
    }
    // Reapply the source mode: the open above is subject to the umask.
    std::fs::set_permissions(dst, std::fs::Permissions::from_mode(meta.mode() & 0o7777))?;
    Ok(())
}
