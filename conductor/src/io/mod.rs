//! Side-effecting adapters: filesystem, git, child processes and runtimes.

pub mod config;
pub mod degraded;
pub mod flows;
pub mod forge;
pub mod git;
pub mod hooks;
pub mod paths;
pub mod process;
pub mod runtime;
pub mod store;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Write `contents` to a sibling temp file, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
