//! Runtime configuration.
//!
//! All tunables are captured from the environment exactly once, at process
//! start, into an immutable snapshot. Nothing re-reads the environment later.

use std::path::PathBuf;

pub const DEFAULT_STORE_ROOT: &str = "/var/bocker";
pub const DEFAULT_CGROUPS: &str = "cpu,cpuacct,memory";
pub const DEFAULT_CPU_SHARE: u64 = 512;
pub const DEFAULT_MEM_LIMIT_MB: u64 = 512;

/// Frozen runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Base directory for all image and container volumes.
    pub store_root: PathBuf,
    /// Cgroup controllers attached to each container.
    pub controllers: Vec<String>,
    /// Relative CPU weight written to `cpu.shares`.
    pub cpu_share: u64,
    /// Hard memory cap in megabytes (written as `mb * 1_000_000` bytes).
    pub mem_limit_mb: u64,
    /// Origin host for `pull`. Pull fails when unset.
    pub registry: Option<String>,
}

impl RuntimeConfig {
    /// Snapshot the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a snapshot from an arbitrary key lookup.
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let store_root = lookup("BOCKER_BTRFS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_ROOT));

        let controllers = parse_controllers(
            lookup("BOCKER_CGROUPS")
                .as_deref()
                .unwrap_or(DEFAULT_CGROUPS),
        );

        let cpu_share = parse_u64(lookup("BOCKER_CPU_SHARE"), "BOCKER_CPU_SHARE")
            .unwrap_or(DEFAULT_CPU_SHARE);
        let mem_limit_mb = parse_u64(lookup("BOCKER_MEM_LIMIT"), "BOCKER_MEM_LIMIT")
            .unwrap_or(DEFAULT_MEM_LIMIT_MB);

        let registry = lookup("R2_DOMAIN").filter(|v| !v.is_empty());

        Self {
            store_root,
            controllers,
            cpu_share,
            mem_limit_mb,
            registry,
        }
    }

    /// Memory cap in bytes, as written to `memory.limit_in_bytes`.
    pub fn mem_limit_bytes(&self) -> u64 {
        self.mem_limit_mb * 1_000_000
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_controllers(raw: &str) -> Vec<String> {
    let list: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    if list.is_empty() {
        parse_controllers(DEFAULT_CGROUPS)
    } else {
        list
    }
}

fn parse_u64(raw: Option<String>, key: &str) -> Option<u64> {
    let raw = raw?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(%key, value = %raw, "ignoring unparseable value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.store_root, PathBuf::from("/var/bocker"));
        assert_eq!(config.controllers, vec!["cpu", "cpuacct", "memory"]);
        assert_eq!(config.cpu_share, 512);
        assert_eq!(config.mem_limit_mb, 512);
        assert_eq!(config.mem_limit_bytes(), 512_000_000);
        assert!(config.registry.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = RuntimeConfig::from_lookup(|key| match key {
            "BOCKER_BTRFS_PATH" => Some("/srv/bocker".into()),
            "BOCKER_CGROUPS" => Some("cpu,memory".into()),
            "BOCKER_CPU_SHARE" => Some("1024".into()),
            "BOCKER_MEM_LIMIT" => Some("64".into()),
            "R2_DOMAIN" => Some("images.example.net".into()),
            _ => None,
        });
        assert_eq!(config.store_root, PathBuf::from("/srv/bocker"));
        assert_eq!(config.controllers, vec!["cpu", "memory"]);
        assert_eq!(config.cpu_share, 1024);
        assert_eq!(config.mem_limit_bytes(), 64_000_000);
        assert_eq!(config.registry.as_deref(), Some("images.example.net"));
    }

    #[test]
    fn test_unparseable_numbers_fall_back() {
        let config = RuntimeConfig::from_lookup(|key| match key {
            "BOCKER_CPU_SHARE" => Some("lots".into()),
            "BOCKER_MEM_LIMIT" => Some("".into()),
            _ => None,
        });
        assert_eq!(config.cpu_share, DEFAULT_CPU_SHARE);
        assert_eq!(config.mem_limit_mb, DEFAULT_MEM_LIMIT_MB);
    }

    #[test]
    fn test_empty_controller_list_falls_back() {
        let config = RuntimeConfig::from_lookup(|key| match key {
            "BOCKER_CGROUPS" => Some(",,".into()),
            _ => None,
        });
        assert_eq!(config.controllers, vec!["cpu", "cpuacct", "memory"]);
    }
}
