//! Canonical `.conductor/` layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use super::config::{ConductorConfig, write_config};
use super::write_atomic;
use crate::core::naming::render_path;

/// Ignored inside `.conductor/`: per-host state that must never be synced.
const CONDUCTOR_GITIGNORE: &str = "local/\nworktrees/\n";

const STARTER_FLOWS: &str = r#"# Stages and flows. Every flow must end in a terminal stage.

[stages.plan]
output = "plan.md"

[stages.implement]
substages = [{ name = "code" }, { name = "test" }]

[stages.implement.runtime]
roles = ["coder"]
command = ["bash"]

[[stages.implement.pre_completion]]
kind = "commit_present"

[stages.review]
human_review = true

[stages.done]
terminal = true

[flows.default]
stages = ["plan", "implement", "review", "done"]
"#;

/// All canonical paths within `.conductor/` for a repository root.
#[derive(Debug, Clone)]
pub struct ConductorPaths {
    pub root: PathBuf,
    pub conductor_dir: PathBuf,
    pub items_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub local_dir: PathBuf,
    pub blocked_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub flows_path: PathBuf,
    pub degraded_path: PathBuf,
}

impl ConductorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let conductor_dir = root.join(".conductor");
        let local_dir = conductor_dir.join("local");
        Self {
            root: root.clone(),
            items_dir: conductor_dir.join("items"),
            archive_dir: conductor_dir.join("archive"),
            blocked_dir: local_dir.join("blocked"),
            locks_dir: local_dir.join("locks"),
            degraded_path: local_dir.join("degraded.json"),
            local_dir,
            gitignore_path: conductor_dir.join(".gitignore"),
            config_path: conductor_dir.join("config.toml"),
            flows_path: conductor_dir.join("flows.toml"),
            conductor_dir,
        }
    }

    pub fn item_path(&self, id: &str) -> PathBuf {
        self.items_dir.join(format!("{id}.json"))
    }

    pub fn archived_item_path(&self, id: &str) -> PathBuf {
        self.archive_dir.join(format!("{id}.json"))
    }

    pub fn blocked_marker(&self, id: &str) -> PathBuf {
        self.blocked_dir.join(id)
    }

    pub fn lock_path(&self, id: &str) -> PathBuf {
        self.locks_dir.join(format!("{id}.lock"))
    }

    /// Path relative to the repository root, as git expects it.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }
}

/// A work item's workspace, or the repository root when none was created for it.
pub fn resolve_workspace(root: &Path, template: &str, id: &str) -> PathBuf {
    let path = root.join(render_path(template, id));
    if path.is_dir() {
        path
    } else {
        debug!(item = id, "no workspace directory, using repository root");
        root.to_path_buf()
    }
}

/// Create `.conductor/` scaffolding in `root`.
///
/// Existing config and flow files are left alone unless `force` is set.
pub fn init_conductor(root: &Path, force: bool) -> Result<ConductorPaths> {
    let paths = ConductorPaths::new(root);
    if paths.conductor_dir.exists() && !paths.conductor_dir.is_dir() {
        return Err(anyhow!(".conductor exists but is not a directory"));
    }
    for dir in [
        &paths.items_dir,
        &paths.archive_dir,
        &paths.blocked_dir,
        &paths.locks_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    ensure_gitignore(&paths)?;
    if force || !paths.config_path.exists() {
        write_config(&paths.config_path, &ConductorConfig::default())?;
    }
    if force || !paths.flows_path.exists() {
        write_atomic(&paths.flows_path, STARTER_FLOWS)?;
    }
    info!(root = %root.display(), "initialized .conductor");
    Ok(paths)
}

/// Make sure host-local state is ignored, appending missing entries.
pub fn ensure_gitignore(paths: &ConductorPaths) -> Result<()> {
    let existing = match fs::read_to_string(&paths.gitignore_path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("read {}", paths.gitignore_path.display()));
        }
    };
    let mut updated = existing.clone();
    for entry in CONDUCTOR_GITIGNORE.lines() {
        if existing.lines().any(|line| line.trim() == entry) {
            continue;
        }
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(entry);
        updated.push('\n');
    }
    if updated != existing {
        debug!(path = %paths.gitignore_path.display(), "updating .gitignore");
        write_atomic(&paths.gitignore_path, &updated)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::flows::load_registry;

    #[test]
    fn init_creates_layout_and_valid_starter_flows() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_conductor(temp.path(), false).expect("init");
        assert!(paths.items_dir.is_dir());
        assert!(paths.blocked_dir.is_dir());
        assert!(paths.config_path.is_file());
        let registry = load_registry(&paths.flows_path).expect("starter flows load");
        assert!(registry.is_terminal("done"));
    }

    #[test]
    fn init_keeps_existing_flows_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_conductor(temp.path(), false).expect("init");
        fs::write(&paths.flows_path, "# custom\n").expect("write");
        init_conductor(temp.path(), false).expect("re-init");
        assert_eq!(
            fs::read_to_string(&paths.flows_path).expect("read"),
            "# custom\n"
        );
    }

    #[test]
    fn gitignore_entries_are_appended_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ConductorPaths::new(temp.path());
        fs::create_dir_all(&paths.conductor_dir).expect("mkdir");
        fs::write(&paths.gitignore_path, "scratch/").expect("write");
        ensure_gitignore(&paths).expect("first");
        ensure_gitignore(&paths).expect("second");
        let contents = fs::read_to_string(&paths.gitignore_path).expect("read");
        assert_eq!(contents, "scratch/\nlocal/\nworktrees/\n");
    }
}
