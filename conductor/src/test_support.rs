//! Fixtures shared by unit and integration tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, bail};

use crate::core::hooks::{HookResult, HookRun, HookSpec};
use crate::core::registry::Registry;
use crate::core::types::{HookOutcome, HookPhase, HookRecord, WorkItem};
use crate::io::config::{ConductorConfig, SyncConfig};
use crate::io::flows::parse_registry;
use crate::io::forge::{CiStatus, Forge};
use crate::io::hooks::{HookContext, HookRunner};
use crate::io::paths::ConductorPaths;
use crate::io::runtime::{EnvironmentRequest, EnvironmentRuntime, SessionRequest, SessionRuntime};
use crate::io::store::FsStore;

/// Flow used across tests: an auto-advancing backlog, an output-producing
/// plan, an isolated implement stage with two substages, a revise stage
/// running host sessions, and an approval-gated terminal.
pub const SAMPLE_FLOWS: &str = r#"
[stages.backlog]
auto_advance = true

[stages.plan]
output = "plan.md"

[stages.implement]
substages = [{ name = "setup" }, { name = "build" }]

[stages.implement.runtime]
roles = ["coder"]
isolated = true
command = ["bash"]
pre_teardown = [["sh", "-c", "echo teardown"]]

[stages.review]

[stages.revise.runtime]
roles = ["coder", "reviewer"]
command = ["bash"]

[stages.accept]
terminal = true
human_review = true

[flows.default]
stages = ["backlog", "plan", "implement", "review", "revise", "accept"]
"#;

pub fn sample_registry() -> Registry {
    parse_registry(SAMPLE_FLOWS).expect("sample flows are valid")
}

/// A fresh item in the `default` flow.
pub fn work_item(id: &str, stage: &str) -> WorkItem {
    WorkItem::new(id, "default", stage)
}

/// Store without git, rooted at `root`.
pub fn memory_store(root: &Path) -> FsStore {
    FsStore::open(ConductorPaths::new(root), None, SyncConfig::default()).expect("open store")
}

/// Defaults with a stable project name and no settle delay.
pub fn fast_config() -> ConductorConfig {
    let mut config = ConductorConfig {
        project: "acme".to_string(),
        ..ConductorConfig::default()
    };
    config.runtime.session_settle_ms = 0;
    config.sync.backoff_ms = 1;
    config
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("run git");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

/// Initialize a repository on `main` with one commit and a local identity.
pub fn init_git_repo(dir: &Path) {
    git(dir, &["init", "-q", "-b", "main"]);
    configure_identity(dir);
    std::fs::write(dir.join("README.md"), "fixture\n").expect("write readme");
    git(dir, &["add", "README.md"]);
    git(dir, &["commit", "-q", "-m", "initial"]);
}

pub fn configure_identity(dir: &Path) {
    git(dir, &["config", "user.name", "Conductor Test"]);
    git(dir, &["config", "user.email", "conductor@example.com"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
}

/// A bare `remote.git` and two clones of it, all under one temp directory.
pub struct Clones {
    _dir: tempfile::TempDir,
    pub a: PathBuf,
    pub b: PathBuf,
}

/// Seed a repository on `main`, publish it as a bare remote and clone it twice.
pub fn bare_with_clones() -> Clones {
    let dir = tempfile::tempdir().expect("tempdir");
    let seed = dir.path().join("seed");
    std::fs::create_dir_all(&seed).expect("mkdir seed");
    init_git_repo(&seed);
    git(dir.path(), &["clone", "-q", "--bare", "seed", "remote.git"]);
    for name in ["a", "b"] {
        git(dir.path(), &["clone", "-q", "remote.git", name]);
        configure_identity(&dir.path().join(name));
    }
    Clones {
        a: dir.path().join("a"),
        b: dir.path().join("b"),
        _dir: dir,
    }
}

/// Forge answering every query with the same status.
#[derive(Debug, Clone)]
pub struct StaticForge(pub CiStatus);

impl Forge for StaticForge {
    fn ci_status(&self, _pull_request: &str, _workdir: &Path) -> Result<CiStatus> {
        Ok(self.0.clone())
    }
}

/// [`HookRunner`] whose results are scripted per `(scope, phase)`.
///
/// Unscripted lists pass, recording one pass per declared hook.
#[derive(Debug, Default)]
pub struct ScriptedHooks {
    scripted: RefCell<HashMap<(String, HookPhase), HookResult>>,
    errors: RefCell<HashMap<(String, HookPhase), String>>,
    calls: RefCell<Vec<(String, HookPhase)>>,
}

impl ScriptedHooks {
    pub fn fail(&self, scope: &str, phase: HookPhase, reason: &str) {
        self.script(
            scope,
            phase,
            HookResult::Fail {
                hook: "scripted".to_string(),
                reason: reason.to_string(),
            },
        );
    }

    /// Exit hooks of `scope` redirect to `target`.
    pub fn redirect(&self, scope: &str, target: &str, reason: &str) {
        self.script(
            scope,
            HookPhase::Exit,
            HookResult::Redirect {
                hook: "scripted".to_string(),
                target: target.to_string(),
                reason: reason.to_string(),
            },
        );
    }

    pub fn trip(&self, scope: &str, count: u32, max: u32) {
        self.script(
            scope,
            HookPhase::Exit,
            HookResult::Tripped {
                hook: "scripted".to_string(),
                count,
                max,
            },
        );
    }

    /// Hooks of `scope` cannot run at all, as when a command fails to spawn.
    pub fn error(&self, scope: &str, phase: HookPhase, message: &str) {
        self.errors
            .borrow_mut()
            .insert((scope.to_string(), phase), message.to_string());
    }

    pub fn clear(&self, scope: &str, phase: HookPhase) {
        let key = (scope.to_string(), phase);
        self.scripted.borrow_mut().remove(&key);
        self.errors.borrow_mut().remove(&key);
    }

    pub fn calls(&self) -> Vec<(String, HookPhase)> {
        self.calls.borrow().clone()
    }

    fn script(&self, scope: &str, phase: HookPhase, result: HookResult) {
        self.scripted
            .borrow_mut()
            .insert((scope.to_string(), phase), result);
    }
}

impl HookRunner for ScriptedHooks {
    fn run(&self, hooks: &[HookSpec], ctx: &HookContext<'_>) -> Result<HookRun> {
        let key = (ctx.scope.to_string(), ctx.phase);
        self.calls.borrow_mut().push(key.clone());
        if let Some(message) = self.errors.borrow().get(&key) {
            bail!("{message}");
        }
        let Some(result) = self.scripted.borrow().get(&key).cloned() else {
            let records = hooks
                .iter()
                .map(|hook| HookRecord::new(ctx.phase, hook.label(), HookOutcome::Pass))
                .collect();
            return Ok(HookRun {
                result: HookResult::Pass,
                records,
            });
        };
        let (outcome, detail) = match &result {
            HookResult::Pass => (HookOutcome::Pass, None),
            HookResult::Fail { reason, .. } => (HookOutcome::Fail, Some(reason.clone())),
            HookResult::Redirect { target, reason, .. } => {
                (HookOutcome::Redirect, Some(format!("{reason} -> {target}")))
            }
            HookResult::Tripped { count, max, .. } => {
                (HookOutcome::Tripped, Some(format!("{count}/{max}")))
            }
        };
        Ok(HookRun {
            result,
            records: vec![HookRecord::new(ctx.phase, "scripted", outcome).with_detail(detail)],
        })
    }
}

#[derive(Debug, Default)]
struct FakeState {
    environments: BTreeSet<String>,
    /// Session name to owning environment.
    sessions: BTreeMap<String, Option<String>>,
    outputs: HashMap<String, String>,
    die_on_start: HashMap<String, u32>,
    send_failures: BTreeSet<String>,
    sent: Vec<(String, String)>,
    log: Vec<String>,
}

/// In-memory environment and session runtime.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: RefCell<FakeState>,
}

impl FakeRuntime {
    pub fn log(&self) -> Vec<String> {
        self.state.borrow().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.borrow_mut().log.clear();
    }

    pub fn environments(&self) -> Vec<String> {
        self.state.borrow().environments.iter().cloned().collect()
    }

    pub fn sessions(&self) -> Vec<String> {
        self.state.borrow().sessions.keys().cloned().collect()
    }

    pub fn add_environment(&self, name: &str) {
        self.state.borrow_mut().environments.insert(name.to_string());
    }

    pub fn add_session(&self, name: &str) {
        self.state
            .borrow_mut()
            .sessions
            .insert(name.to_string(), None);
    }

    /// Simulate a crash: the environment and every session inside it vanish.
    pub fn kill_environment(&self, name: &str) {
        let mut state = self.state.borrow_mut();
        state.environments.remove(name);
        state
            .sessions
            .retain(|_, owner| owner.as_deref() != Some(name));
    }

    pub fn kill_session(&self, name: &str) {
        self.state.borrow_mut().sessions.remove(name);
    }

    /// The next `times` creations of `name` exit immediately.
    pub fn die_on_start(&self, name: &str, times: u32) {
        self.state
            .borrow_mut()
            .die_on_start
            .insert(name.to_string(), times);
    }

    pub fn set_output(&self, name: &str, output: &str) {
        self.state
            .borrow_mut()
            .outputs
            .insert(name.to_string(), output.to_string());
    }

    pub fn fail_send_keys(&self, name: &str) {
        self.state.borrow_mut().send_failures.insert(name.to_string());
    }

    pub fn sent_keys(&self) -> Vec<(String, String)> {
        self.state.borrow().sent.clone()
    }
}

impl EnvironmentRuntime for FakeRuntime {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.borrow().environments.contains(name))
    }

    fn create(&self, request: &EnvironmentRequest<'_>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.log.push(format!("env.create {}", request.name));
        if !state.environments.insert(request.name.to_string()) {
            bail!("environment '{}' already exists", request.name);
        }
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.log.push(format!("env.destroy {name}"));
        if state
            .sessions
            .values()
            .any(|owner| owner.as_deref() == Some(name))
        {
            bail!("environment '{name}' still owns sessions");
        }
        state.environments.remove(name);
        Ok(())
    }

    fn exec(&self, name: &str, command: &[String]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state
            .log
            .push(format!("env.exec {name} {}", command.join(" ")));
        if !state.environments.contains(name) {
            bail!("environment '{name}' is not running");
        }
        Ok(())
    }
}

impl SessionRuntime for FakeRuntime {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.borrow().sessions.contains_key(name))
    }

    fn create(&self, request: &SessionRequest<'_>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        match request.environment {
            Some(env) => {
                state
                    .log
                    .push(format!("session.create {} in {env}", request.name));
                if !state.environments.contains(env) {
                    bail!("environment '{env}' is not running");
                }
            }
            None => state.log.push(format!("session.create {}", request.name)),
        }
        if let Some(remaining) = state.die_on_start.get_mut(request.name)
            && *remaining > 0
        {
            *remaining -= 1;
            return Ok(());
        }
        state.sessions.insert(
            request.name.to_string(),
            request.environment.map(str::to_string),
        );
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.log.push(format!("session.destroy {name}"));
        state.sessions.remove(name);
        Ok(())
    }

    fn capture(&self, name: &str, _lines: usize) -> Result<String> {
        let state = self.state.borrow();
        if !state.sessions.contains_key(name) {
            bail!("session '{name}' not found");
        }
        Ok(state.outputs.get(name).cloned().unwrap_or_default())
    }

    fn send_keys(&self, name: &str, keys: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.send_failures.contains(name) {
            bail!("session '{name}' rejected input");
        }
        state.sent.push((name.to_string(), keys.to_string()));
        Ok(())
    }
}
