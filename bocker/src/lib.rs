//! bocker: a minimal container runtime.
//!
//! Composes Linux isolation primitives into reproducible sandboxes: btrfs
//! snapshots for the filesystem (with a reflink fallback), cgroups for
//! resource limits, a veth/bridge/netns triple for networking, and
//! unshare+chroot for the process itself. The full lifecycle is covered:
//! acquiring images, launching isolated workloads, inspecting state, and
//! committing changes back into images.
//!
//! The store directory is the database: every image (`img_*`) and container
//! (`ps_*`) is one copy-on-write volume under the store root, and every
//! command resolves identity through it.

pub mod cgroup;
pub mod config;
pub mod errors;
pub mod exec;
pub mod id;
pub mod image;
pub mod net;
pub mod runtime;
pub mod sandbox;
pub mod store;
pub mod util;

pub use config::RuntimeConfig;
pub use errors::{BockerError, BockerResult};
pub use runtime::{Bocker, ContainerRow, ImageRow, render_containers, render_images};
