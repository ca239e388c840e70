//! Image manifest model.
//!
//! The archive carries a docker-save style `manifest.json`: an ordered array
//! of entries, each naming its layer tars base-to-top.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::errors::{BockerError, BockerResult};

#[derive(Debug, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "Config")]
    pub config: Option<String>,
    #[serde(rename = "Layers", default)]
    pub layers: Vec<String>,
}

/// Parse the manifest file contents.
pub fn parse(raw: &str) -> BockerResult<Vec<ManifestEntry>> {
    serde_json::from_str(raw)
        .map_err(|e| BockerError::MalformedImage(format!("manifest.json: {e}")))
}

/// Locate `manifest.json` under `root`, depth-first; first hit wins.
pub fn locate(root: &Path) -> Option<PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .find(|e| e.file_type().is_file() && e.file_name() == "manifest.json")
        .map(|e| e.into_path())
}

/// Resolve a manifest-relative member path against the working tree,
/// rejecting anything that would escape it.
pub fn member_path(root: &Path, member: &str) -> BockerResult<PathBuf> {
    let rel = Path::new(member);
    let escapes = rel.is_absolute()
        || rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if escapes || member.is_empty() {
        return Err(BockerError::MalformedImage(format!(
            "manifest references invalid member path '{member}'"
        )));
    }
    Ok(root.join(rel))
}
