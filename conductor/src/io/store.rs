//! Filesystem State Store replicated through git.
//!
//! One pretty-printed JSON document per work item under `.conductor/items/`.
//! The files are the materialized cache; the repository history is the
//! durable log. Every write is version-checked, appends exactly one history
//! event and lands as a single commit holding only store paths. A write whose
//! commit fails is undone on disk.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{Context, anyhow};
use jsonschema::Validator;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use super::config::SyncConfig;
use super::git::{Git, PullOutcome};
use super::paths::ConductorPaths;
use crate::core::types::{Actor, EventKind, HistoryEvent, WorkItem};

const WORK_ITEM_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/work_item.schema.json"
));

/// Lock files older than this are assumed to belong to a crashed writer.
const STALE_LOCK_AFTER: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("work item '{0}' not found")]
    NotFound(String),
    #[error("work item '{0}' already exists")]
    AlreadyExists(String),
    #[error("version conflict on work item '{id}': expected version {expected}, found {actual}")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("history of work item '{0}' is append-only; existing events were changed")]
    HistoryRewritten(String),
    #[error("work item '{0}' is blocked by an unresolved sync conflict; resolve it and unblock")]
    Blocked(String),
    #[error("work item '{0}' is locked by another local writer")]
    Locked(String),
    #[error("sync failed after {attempts} attempts; blocked work items: [{}]", .ids.join(", "))]
    SyncConflict { ids: Vec<String>, attempts: u32 },
    #[error("invalid work item document {path}: {reason}")]
    InvalidDocument { path: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of a successful sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub attempts: u32,
    pub pushed: bool,
}

/// Versioned key-document store shared by agents and the controller.
pub trait StateStore {
    fn read(&self, id: &str) -> Result<WorkItem, StoreError>;

    /// Replace the document if its stored version is still `expected_version`.
    ///
    /// `item.history` must equal the stored history; `event` is appended and the
    /// version bumped by exactly one. Returns the document as written.
    fn write(
        &self,
        item: WorkItem,
        expected_version: u64,
        event: HistoryEvent,
    ) -> Result<WorkItem, StoreError>;

    /// Every live (non-archived) work item, ordered by id.
    fn list_all(&self) -> Result<Vec<WorkItem>, StoreError>;

    /// Pull, rebase local commits, push.
    fn sync(&self) -> Result<SyncReport, StoreError>;

    /// Store a new item at version 1 with a `created` event.
    fn create(&self, item: WorkItem) -> Result<WorkItem, StoreError>;

    /// Move the document out of the live set.
    fn archive(&self, id: &str) -> Result<(), StoreError>;

    /// Clear the local sync-conflict block on `id`.
    fn unblock(&self, id: &str) -> Result<(), StoreError>;

    fn is_blocked(&self, id: &str) -> Result<bool, StoreError>;

    /// True once `id` has been archived.
    fn is_archived(&self, id: &str) -> Result<bool, StoreError>;
}

/// [`StateStore`] backed by `.conductor/items/*.json` in a git checkout.
pub struct FsStore {
    paths: ConductorPaths,
    git: Option<Git>,
    sync: SyncConfig,
    schema: Validator,
}

impl FsStore {
    /// `git` is `None` for a store that never commits (scratch directories, tests).
    pub fn open(paths: ConductorPaths, git: Option<Git>, sync: SyncConfig) -> anyhow::Result<Self> {
        let schema_value: Value =
            serde_json::from_str(WORK_ITEM_SCHEMA).context("parse work item schema")?;
        let schema = jsonschema::validator_for(&schema_value)
            .map_err(|err| anyhow!("compile work item schema: {err}"))?;
        fs::create_dir_all(&paths.items_dir)
            .with_context(|| format!("create {}", paths.items_dir.display()))?;
        Ok(Self {
            paths,
            git,
            sync,
            schema,
        })
    }

    pub fn paths(&self) -> &ConductorPaths {
        &self.paths
    }

    fn load(&self, path: &Path, id: &str) -> Result<WorkItem, StoreError> {
        self.load_with_source(path, id).map(|(item, _)| item)
    }

    /// The parsed document together with the exact text it was parsed from.
    fn load_with_source(&self, path: &Path, id: &str) -> Result<(WorkItem, String), StoreError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("read {}", path.display()))
                    .into());
            }
        };
        let value: Value =
            serde_json::from_str(&contents).map_err(|err| invalid(path, err.to_string()))?;
        self.validate(path, &value)?;
        let item: WorkItem =
            serde_json::from_value(value).map_err(|err| invalid(path, err.to_string()))?;
        if item.id != id {
            return Err(invalid(
                path,
                format!("id '{}' does not match file name", item.id),
            ));
        }
        Ok((item, contents))
    }

    fn validate(&self, path: &Path, value: &Value) -> Result<(), StoreError> {
        let messages: Vec<String> = self
            .schema
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect();
        if messages.is_empty() {
            return Ok(());
        }
        Err(invalid(path, messages.join("; ")))
    }

    fn persist(&self, item: &WorkItem, path: &Path) -> Result<(), StoreError> {
        let value = serde_json::to_value(item).context("serialize work item")?;
        self.validate(path, &value)?;
        let mut buf = serde_json::to_string_pretty(&value).context("render work item")?;
        buf.push('\n');
        super::write_atomic(path, &buf)?;
        Ok(())
    }

    /// Commit `paths`; if that fails, run `undo` and drop the paths from the index.
    fn commit_or_undo(
        &self,
        paths: &[&Path],
        message: &str,
        undo: impl FnOnce() -> anyhow::Result<()>,
    ) -> Result<(), StoreError> {
        let Some(git) = &self.git else {
            return Ok(());
        };
        let relative: Vec<&Path> = paths.iter().map(|path| self.paths.relative(path)).collect();
        let Err(err) = git.commit_paths(&relative, message) else {
            return Ok(());
        };
        error!(err = %format!("{err:#}"), "commit failed, restoring working copy");
        if let Err(undo_err) = undo() {
            error!(err = %format!("{undo_err:#}"), "could not restore working copy");
        }
        if let Err(reset_err) = git.unstage_paths(&relative) {
            warn!(err = %format!("{reset_err:#}"), "could not unstage store paths");
        }
        Err(err.context(format!("commit '{message}'")).into())
    }

    fn ensure_not_blocked(&self, id: &str) -> Result<(), StoreError> {
        if self.is_blocked(id)? {
            return Err(StoreError::Blocked(id.to_string()));
        }
        Ok(())
    }

    fn block(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        let marker = self.paths.blocked_marker(id);
        super::write_atomic(&marker, &format!("{reason}\n"))?;
        warn!(item = id, reason, "work item blocked");
        Ok(())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.sync.backoff_ms.saturating_mul(factor))
    }
}

impl StateStore for FsStore {
    fn read(&self, id: &str) -> Result<WorkItem, StoreError> {
        self.load(&self.paths.item_path(id), id)
    }

    #[instrument(skip_all, fields(item = %item.id, expected_version))]
    fn write(
        &self,
        mut item: WorkItem,
        expected_version: u64,
        mut event: HistoryEvent,
    ) -> Result<WorkItem, StoreError> {
        let id = item.id.clone();
        self.ensure_not_blocked(&id)?;
        let _lock = ItemLock::acquire(self.paths.lock_path(&id), &id)?;
        let path = self.paths.item_path(&id);
        let (current, previous) = self.load_with_source(&path, &id)?;
        if current.version != expected_version {
            debug!(actual = current.version, "version conflict");
            return Err(StoreError::VersionConflict {
                id,
                expected: expected_version,
                actual: current.version,
            });
        }
        if item.history != current.history {
            return Err(StoreError::HistoryRewritten(id));
        }

        let version = expected_version + 1;
        event.version = version;
        item.version = version;
        item.created = current.created;
        item.updated = event.at;
        let message = commit_message(&id, version, &event);
        item.history.push(event);

        self.persist(&item, &path)?;
        self.commit_or_undo(&[&path], &message, || super::write_atomic(&path, &previous))?;
        debug!(version, "work item written");
        Ok(item)
    }

    fn list_all(&self) -> Result<Vec<WorkItem>, StoreError> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.paths.items_dir)
            .with_context(|| format!("read {}", self.paths.items_dir.display()))?;
        for entry in entries {
            let entry = entry.context("read items entry")?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        ids.iter().map(|id| self.read(id)).collect()
    }

    #[instrument(skip_all)]
    fn sync(&self) -> Result<SyncReport, StoreError> {
        let (Some(git), Some(remote)) = (&self.git, &self.sync.remote) else {
            return Ok(SyncReport::default());
        };
        let branch = &self.sync.branch;
        let max_attempts = self.sync.max_attempts;
        let mut conflicts = Vec::new();
        for attempt in 1..=max_attempts {
            match git.pull_rebase(remote, branch)? {
                PullOutcome::Clean => {
                    conflicts.clear();
                    if git.push(remote, branch)? {
                        debug!(attempt, "sync complete");
                        return Ok(SyncReport {
                            attempts: attempt,
                            pushed: true,
                        });
                    }
                }
                PullOutcome::Conflict(paths) => {
                    warn!(attempt, max_attempts, conflicts = paths.len(), "sync conflict");
                    conflicts = paths;
                }
            }
            if attempt < max_attempts {
                thread::sleep(self.backoff(attempt));
            }
        }

        let ids = conflicted_ids(&conflicts);
        for id in &ids {
            self.block(id, &format!("sync conflict after {max_attempts} attempts"))?;
        }
        Err(StoreError::SyncConflict {
            ids,
            attempts: max_attempts,
        })
    }

    #[instrument(skip_all, fields(item = %item.id))]
    fn create(&self, mut item: WorkItem) -> Result<WorkItem, StoreError> {
        let id = item.id.clone();
        let path = self.paths.item_path(&id);
        if !valid_id(&id) {
            return Err(invalid(&path, format!("invalid work item id '{id}'")));
        }
        let _lock = ItemLock::acquire(self.paths.lock_path(&id), &id)?;
        if path.exists() || self.paths.archived_item_path(&id).exists() {
            return Err(StoreError::AlreadyExists(id));
        }
        let position = item.position();
        let mut event = HistoryEvent::in_place(EventKind::Created, &position, Actor::Human);
        event.version = 1;
        item.version = 1;
        item.created = event.at;
        item.updated = event.at;
        item.history = vec![event];
        self.persist(&item, &path)?;
        self.commit_or_undo(&[&path], &format!("conductor: create {id} at {position}"), || {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))
        })?;
        info!(item = %id, stage = %position, "work item created");
        Ok(item)
    }

    #[instrument(skip_all, fields(item = id))]
    fn archive(&self, id: &str) -> Result<(), StoreError> {
        self.ensure_not_blocked(id)?;
        let _lock = ItemLock::acquire(self.paths.lock_path(id), id)?;
        let from = self.paths.item_path(id);
        let to = self.paths.archived_item_path(id);
        if !from.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        fs::create_dir_all(&self.paths.archive_dir)
            .with_context(|| format!("create {}", self.paths.archive_dir.display()))?;
        fs::rename(&from, &to)
            .with_context(|| format!("move {} to {}", from.display(), to.display()))?;
        self.commit_or_undo(&[&from, &to], &format!("conductor: archive {id}"), || {
            fs::rename(&to, &from)
                .with_context(|| format!("move {} back to {}", to.display(), from.display()))
        })?;
        info!("work item archived");
        Ok(())
    }

    fn unblock(&self, id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.paths.blocked_marker(id)) {
            Ok(()) => {
                info!(item = id, "work item unblocked");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("unblock {id}"))
                .into()),
        }
    }

    fn is_blocked(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.paths.blocked_marker(id).exists())
    }

    fn is_archived(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.paths.archived_item_path(id).exists())
    }
}

/// Exclusive per-item lock file, removed on drop.
struct ItemLock {
    path: PathBuf,
}

impl ItemLock {
    fn acquire(path: PathBuf, id: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if !lock_is_stale(&path) {
                        return Err(StoreError::Locked(id.to_string()));
                    }
                    warn!(item = id, path = %path.display(), "removing stale lock");
                    let _ = fs::remove_file(&path);
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("create lock {}", path.display()))
                        .into());
                }
            }
        }
        Err(StoreError::Locked(id.to_string()))
    }
}

impl Drop for ItemLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to release lock");
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AFTER)
}

fn invalid(path: &Path, reason: String) -> StoreError {
    StoreError::InvalidDocument {
        path: path.display().to_string(),
        reason,
    }
}

fn valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn commit_message(id: &str, version: u64, event: &HistoryEvent) -> String {
    let kind = serde_json::to_value(event.kind)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_else(|| "update".to_string());
    if event.from == event.to {
        format!("conductor: {id} v{version} {kind} at {}", event.to)
    } else {
        format!(
            "conductor: {id} v{version} {kind} {} -> {}",
            event.from, event.to
        )
    }
}

/// Map conflicted repository paths back to work item ids.
fn conflicted_ids(paths: &[String]) -> Vec<String> {
    let mut ids: Vec<String> = paths
        .iter()
        .filter_map(|path| {
            let rest = path.strip_prefix(".conductor/items/")?;
            rest.strip_suffix(".json").map(str::to_string)
        })
        .collect();
    ids.sort();
    ids.dedup();
    ids
}
