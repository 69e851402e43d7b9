//! Hook Executor: runs declared checks and actions against a work item's workspace.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use super::config::ConductorConfig;
use super::forge::{CiStatus, Forge};
use super::git::Git;
use super::paths::resolve_workspace;
use super::process::{command_from_argv, run_command_with_timeout};
use crate::core::guard::count_artifacts;
use crate::core::hooks::{Checkbox, HookRun, HookSpec, Verdict, checkbox_state, evaluate};
use crate::core::naming::managed_env;
use crate::core::registry::{StageDefinition, SubstageDefinition};
use crate::core::types::{HookPhase, WorkItem};

/// Role reported to hook commands through `CONDUCTOR_ROLE`.
const HOOK_ROLE: &str = "hook";

/// What a hook list runs against.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub item: &'a WorkItem,
    /// Stage (or `stage/substage`) the list belongs to, for logs.
    pub scope: &'a str,
    pub phase: HookPhase,
}

/// Seam between the Transition Engine and hook side effects.
pub trait HookRunner {
    /// Run `hooks` in order; the first failure, redirect or trip stops the list.
    fn run(&self, hooks: &[HookSpec], ctx: &HookContext<'_>) -> Result<HookRun>;

    fn run_exit(&self, stage: &StageDefinition, item: &WorkItem) -> Result<HookRun> {
        let ctx = HookContext {
            item,
            scope: &stage.name,
            phase: HookPhase::Exit,
        };
        self.run(&stage.exit_hooks(), &ctx)
    }

    fn run_entry(&self, stage: &StageDefinition, item: &WorkItem) -> Result<HookRun> {
        let ctx = HookContext {
            item,
            scope: &stage.name,
            phase: HookPhase::Entry,
        };
        self.run(&stage.entry_hooks(), &ctx)
    }

    fn run_substage(
        &self,
        substage: &SubstageDefinition,
        phase: HookPhase,
        item: &WorkItem,
    ) -> Result<HookRun> {
        let hooks: Vec<HookSpec> = match phase {
            HookPhase::Exit => substage.hooks.exit().cloned().collect(),
            HookPhase::Entry => substage.hooks.entry().cloned().collect(),
        };
        let ctx = HookContext {
            item,
            scope: &substage.name,
            phase,
        };
        self.run(&hooks, &ctx)
    }
}

/// Production [`HookRunner`] dispatching every [`HookSpec`] kind.
pub struct HookExecutor<F: Forge> {
    root: PathBuf,
    workspace_template: String,
    default_timeout: Duration,
    output_limit_bytes: usize,
    forge: F,
}

impl<F: Forge> HookExecutor<F> {
    pub fn new(root: impl Into<PathBuf>, config: &ConductorConfig, forge: F) -> Self {
        Self {
            root: root.into(),
            workspace_template: config.workspace_template.clone(),
            default_timeout: config.hook_timeout(),
            output_limit_bytes: config.hooks.output_limit_bytes,
            forge,
        }
    }

    pub fn workspace(&self, item: &WorkItem) -> PathBuf {
        resolve_workspace(&self.root, &self.workspace_template, &item.id)
    }

    fn check(&self, hook: &HookSpec, item: &WorkItem) -> Result<Verdict> {
        let workspace = self.workspace(item);
        match hook {
            HookSpec::ContentPresent {
                document, pattern, ..
            } => {
                let Some(contents) = read_optional(&workspace.join(document))? else {
                    return Ok(Verdict::Fail(format!("document '{document}' is missing")));
                };
                let re = Regex::new(pattern)
                    .with_context(|| format!("compile content pattern '{pattern}'"))?;
                if re.is_match(&contents) {
                    Ok(Verdict::Pass)
                } else {
                    Ok(Verdict::Fail(format!(
                        "document '{document}' does not contain /{pattern}/"
                    )))
                }
            }
            HookSpec::ArtifactExists { path, .. } => {
                if workspace.join(path).exists() {
                    Ok(Verdict::Pass)
                } else {
                    Ok(Verdict::Fail(format!("artifact '{path}' does not exist")))
                }
            }
            HookSpec::Command {
                command,
                timeout_secs,
                expect_exit,
                ..
            } => self.run_command(command, *timeout_secs, *expect_exit, &workspace, item),
            HookSpec::CommitPresent { base, pattern, .. } => {
                let subjects = Git::new(&workspace).commits_since(base)?;
                let matched = match pattern {
                    Some(pattern) => {
                        let re = Regex::new(pattern)
                            .with_context(|| format!("compile commit pattern '{pattern}'"))?;
                        subjects.iter().any(|subject| re.is_match(subject))
                    }
                    None => !subjects.is_empty(),
                };
                if matched {
                    Ok(Verdict::Pass)
                } else {
                    Ok(Verdict::Fail(format!(
                        "no matching commit since '{base}' ({} commits checked)",
                        subjects.len()
                    )))
                }
            }
            HookSpec::ApprovalCheckbox {
                document,
                section,
                marker,
                ..
            } => {
                let Some(contents) = read_optional(&workspace.join(document))? else {
                    return Ok(Verdict::Fail(format!("document '{document}' is missing")));
                };
                Ok(match checkbox_state(&contents, section, marker) {
                    Checkbox::Checked => Verdict::Pass,
                    Checkbox::Unchecked => Verdict::Fail(format!(
                        "'{marker}' is not checked in section '{section}' of '{document}'"
                    )),
                    Checkbox::Absent => Verdict::Fail(format!(
                        "no '{marker}' checkbox in section '{section}' of '{document}'"
                    )),
                })
            }
            HookSpec::IterationGuard { pattern, max, dir } => {
                let re = Regex::new(pattern)
                    .with_context(|| format!("compile iteration pattern '{pattern}'"))?;
                let dir = dir.as_ref().map_or(workspace.clone(), |dir| workspace.join(dir));
                let names = list_file_names(&dir)?;
                let count = count_artifacts(names.iter().map(String::as_str), &re);
                if count > *max {
                    warn!(item = %item.id, count, max, "iteration guard tripped");
                    Ok(Verdict::Tripped { count, max: *max })
                } else {
                    Ok(Verdict::Pass)
                }
            }
            HookSpec::CiStatus { .. } => {
                let Some(pull_request) = &item.pull_request else {
                    return Ok(Verdict::Fail("no linked pull request".to_string()));
                };
                Ok(match self.forge.ci_status(pull_request, &workspace)? {
                    CiStatus::Passing => Verdict::Pass,
                    CiStatus::Pending => {
                        Verdict::Fail(format!("CI checks for {pull_request} are still running"))
                    }
                    CiStatus::Failing(reason) => {
                        Verdict::Fail(format!("CI checks for {pull_request} failed: {reason}"))
                    }
                })
            }
            HookSpec::Rebase { onto } => {
                let conflicts = Git::new(&workspace).rebase(onto)?;
                if conflicts.is_empty() {
                    Ok(Verdict::Pass)
                } else {
                    Ok(Verdict::Fail(format!(
                        "rebase onto '{onto}' conflicted in: {}",
                        conflicts.join(", ")
                    )))
                }
            }
            HookSpec::CreateDocument { path, template } => {
                self.create_document(&workspace.join(path), template, item)?;
                Ok(Verdict::Pass)
            }
        }
    }

    fn run_command(
        &self,
        command: &[String],
        timeout_secs: Option<u64>,
        expect_exit: i32,
        workspace: &Path,
        item: &WorkItem,
    ) -> Result<Verdict> {
        let timeout = timeout_secs.map_or(self.default_timeout, Duration::from_secs);
        let mut cmd = command_from_argv(command, workspace)?;
        cmd.envs(managed_env(&item.id, HOOK_ROLE));
        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)?;
        if output.timed_out {
            return Ok(Verdict::Fail(format!(
                "'{}' timed out after {}s",
                command.join(" "),
                timeout.as_secs()
            )));
        }
        if output.code() == Some(expect_exit) {
            return Ok(Verdict::Pass);
        }
        Ok(Verdict::Fail(format!(
            "'{}' {} (expected exit {expect_exit})",
            command.join(" "),
            output.summary()
        )))
    }

    /// Render `template` (relative to the repository root) into `target` unless it already exists.
    fn create_document(&self, target: &Path, template: &str, item: &WorkItem) -> Result<()> {
        if target.exists() {
            debug!(path = %target.display(), "document exists, leaving untouched");
            return Ok(());
        }
        let template_path = self.root.join(template);
        let source = fs::read_to_string(&template_path)
            .with_context(|| format!("read template {}", template_path.display()))?;
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.add_template("document", &source)
            .with_context(|| format!("parse template {}", template_path.display()))?;
        let rendered = env.get_template("document")?.render(context! {
            item => item,
            id => &item.id,
            stage => &item.stage,
        })?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(target, rendered).with_context(|| format!("write {}", target.display()))?;
        info!(item = %item.id, path = %target.display(), "document created");
        Ok(())
    }
}

impl<F: Forge> HookRunner for HookExecutor<F> {
    #[instrument(skip_all, fields(item = %ctx.item.id, scope = ctx.scope, phase = ?ctx.phase, hooks = hooks.len()))]
    fn run(&self, hooks: &[HookSpec], ctx: &HookContext<'_>) -> Result<HookRun> {
        let run = evaluate(hooks, ctx.phase, |hook| {
            debug!(hook = %hook.label(), "running hook");
            self.check(hook, ctx.item)
                .with_context(|| format!("hook {} on work item '{}'", hook.label(), ctx.item.id))
        })?;
        if !run.result.is_pass() {
            info!(result = ?run.result, "hook list stopped");
        }
        Ok(run)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(anyhow!(err).context(format!("read {}", path.display()))),
    }
}

fn list_file_names(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(anyhow!(err).context(format!("list {}", dir.display()))),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("list {}", dir.display()))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}
