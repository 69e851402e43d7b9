//! `conductor`: entry points for agents, operators and the controller loop.
//!
//! Agents call `advance` when they finish a stage; operators `approve`,
//! `stop` and `unblock`; the controller host runs `heartbeat`.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use conductor::core::registry::Registry;
use conductor::core::types::{Actor, WorkItem};
use conductor::engine::{
    AdvanceOutcome, AdvanceRequest, TransitionAction, TransitionEngine, TransitionError,
};
use conductor::exit_codes;
use conductor::health::{HealthAction, HealthMonitor};
use conductor::heartbeat::{Heartbeat, SyncAction};
use conductor::io::config::{ConductorConfig, load_config};
use conductor::io::flows::load_registry;
use conductor::io::forge::CommandForge;
use conductor::io::git::Git;
use conductor::io::hooks::HookExecutor;
use conductor::io::paths::{ConductorPaths, init_conductor};
use conductor::io::runtime::{ContainerRuntime, TmuxRuntime};
use conductor::io::store::{FsStore, StateStore, StoreError};
use conductor::logging;
use conductor::reconcile::{ReconcileAction, Reconciler};

#[derive(Parser)]
#[command(name = "conductor", version, about = "Work-item pipeline controller")]
struct Cli {
    /// Repository root holding `.conductor/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.conductor/` with a default config and starter flows.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Load config, flows and every work item, failing on the first problem.
    Validate,
    /// Create a work item at its flow's first stage.
    Create {
        id: String,
        #[arg(long, default_value = "default")]
        flow: String,
        #[arg(long = "depends-on")]
        dependencies: Vec<String>,
        #[arg(long = "label")]
        labels: Vec<String>,
    },
    /// Run exit hooks and move the item to its next stage.
    Advance {
        id: String,
        /// Fail instead of re-reading if the item is no longer at this version.
        #[arg(long)]
        expected_version: Option<u64>,
        #[arg(long, value_enum, default_value_t = ActorArg::Agent)]
        actor: ActorArg,
    },
    /// Record approval for the item's pending review.
    Approve { id: String },
    /// Send the item back from `from` to `to` without a successor lookup.
    Redirect {
        id: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long, value_enum, default_value_t = ActorArg::Agent)]
        actor: ActorArg,
    },
    /// Start the item's environment and sessions.
    Start { id: String },
    /// Run the full stop flow and keep the item down.
    Stop { id: String },
    /// Clear a local sync-conflict block.
    Unblock { id: String },
    /// Move a terminal item out of the live set.
    Archive { id: String },
    /// Pull, rebase and push the store once.
    Sync,
    /// Run the controller loop.
    Heartbeat {
        /// Stop after this many ticks.
        #[arg(long)]
        ticks: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ActorArg {
    Agent,
    Controller,
    Human,
}

impl From<ActorArg> for Actor {
    fn from(value: ActorArg) -> Self {
        match value {
            ActorArg::Agent => Actor::Agent,
            ActorArg::Controller => Actor::Controller,
            ActorArg::Human => Actor::Human,
        }
    }
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    if let Command::Init { force } = cli.command {
        let paths = init_conductor(&cli.root, force)?;
        println!("initialized {}", paths.conductor_dir.display());
        return Ok(exit_codes::OK);
    }
    let app = App::load(&cli.root)?;
    dispatch(&app, cli.command)
}

fn dispatch(ctx: &App, command: Command) -> Result<i32> {
    match command {
        Command::Init { force } => {
            init_conductor(&ctx.root, force)?;
            Ok(exit_codes::OK)
        }
        Command::Validate => cmd_validate(ctx),
        Command::Create {
            id,
            flow,
            dependencies,
            labels,
        } => {
            let first = ctx
                .registry
                .flow(&flow)?
                .first_stage()
                .ok_or_else(|| anyhow!("flow '{flow}' has no stages"))?
                .to_string();
            let mut item = WorkItem::new(&id, &flow, &first);
            item.dependencies = dependencies;
            item.labels = labels;
            let item = ctx.store.create(item)?;
            println!("{} created at {} (v{})", item.id, item.position(), item.version);
            Ok(exit_codes::OK)
        }
        Command::Advance {
            id,
            expected_version,
            actor,
        } => {
            let request = match expected_version {
                Some(version) => AdvanceRequest::at_version(actor.into(), version),
                None => AdvanceRequest::by(actor.into()),
            };
            let outcome = ctx.engine().advance(&id, request)?;
            Ok(report_advance(&id, &outcome))
        }
        Command::Approve { id } => {
            let item = ctx.engine().approve(&id, Actor::Human)?;
            println!("{id} approved (v{})", item.version);
            Ok(exit_codes::OK)
        }
        Command::Redirect {
            id,
            from,
            to,
            actor,
        } => {
            let outcome = ctx
                .engine()
                .redirect_and_return(&id, &from, &to, actor.into())?;
            Ok(report_advance(&id, &outcome))
        }
        Command::Start { id } => {
            let item = ctx.reconciler().start(&id)?;
            println!("{id} started (v{})", item.version);
            Ok(exit_codes::OK)
        }
        Command::Stop { id } => {
            ctx.reconciler().stop(&id, true)?;
            println!("{id} stopped");
            Ok(exit_codes::OK)
        }
        Command::Unblock { id } => {
            ctx.store.unblock(&id)?;
            println!("{id} unblocked");
            Ok(exit_codes::OK)
        }
        Command::Archive { id } => {
            ctx.engine().archive(&id)?;
            println!("{id} archived");
            Ok(exit_codes::OK)
        }
        Command::Sync => {
            let report = ctx.store.sync()?;
            println!(
                "synced after {} attempt(s){}",
                report.attempts,
                if report.pushed { ", pushed" } else { "" }
            );
            Ok(exit_codes::OK)
        }
        Command::Heartbeat { ticks } => cmd_heartbeat(ctx, ticks),
    }
}

/// Everything a command needs, loaded once per process.
struct App {
    root: PathBuf,
    config: ConductorConfig,
    registry: Registry,
    store: FsStore,
    hooks: HookExecutor<CommandForge>,
    environments: ContainerRuntime,
    sessions: TmuxRuntime,
}

impl App {
    fn load(root: &Path) -> Result<Self> {
        let paths = ConductorPaths::new(root);
        if !paths.conductor_dir.is_dir() {
            bail!(
                "{} not found; run `conductor init` first",
                paths.conductor_dir.display()
            );
        }
        let config = load_config(&paths.config_path)?;
        let registry = load_registry(&paths.flows_path)?;
        let git = root.join(".git").exists().then(|| Git::new(root));
        let store = FsStore::open(paths, git, config.sync.clone())?;
        let forge = CommandForge::new(
            &config.forge,
            config.hook_timeout(),
            config.hooks.output_limit_bytes,
        );
        let hooks = HookExecutor::new(root, &config, forge);
        Ok(Self {
            root: root.to_path_buf(),
            environments: ContainerRuntime::new(&config.runtime),
            sessions: TmuxRuntime::new(&config.runtime),
            config,
            registry,
            store,
            hooks,
        })
    }

    fn engine(&self) -> TransitionEngine<'_, FsStore, HookExecutor<CommandForge>> {
        TransitionEngine::new(
            &self.registry,
            &self.store,
            &self.hooks,
            self.config.hooks.max_redirects,
        )
    }

    fn reconciler(&self) -> Reconciler<'_, FsStore, ContainerRuntime, TmuxRuntime> {
        Reconciler::new(
            &self.registry,
            &self.store,
            &self.environments,
            &self.sessions,
            &self.config,
            &self.root,
        )
    }
}

fn cmd_validate(ctx: &App) -> Result<i32> {
    let items = ctx.store.list_all()?;
    let mut problems = Vec::new();
    for item in &items {
        match ctx.registry.flow(&item.flow) {
            Ok(flow) if !flow.contains(&item.stage) => problems.push(format!(
                "{}: stage '{}' is not in flow '{}'",
                item.id, item.stage, item.flow
            )),
            Ok(_) => {}
            Err(err) => problems.push(format!("{}: {err}", item.id)),
        }
    }
    if !problems.is_empty() {
        bail!("invalid work items:\n- {}", problems.join("\n- "));
    }
    println!(
        "ok: {} stage(s), {} work item(s)",
        ctx.registry.stages().count(),
        items.len()
    );
    Ok(exit_codes::OK)
}

fn cmd_heartbeat(ctx: &App, ticks: Option<u64>) -> Result<i32> {
    let paths = ctx.store.paths();
    let monitor = HealthMonitor::new(&ctx.store, &ctx.sessions, &ctx.config, &paths.degraded_path)?;
    let mut heartbeat = Heartbeat::new(ctx.config.heartbeat_interval())
        .with_action(SyncAction::new(&ctx.store))
        .with_action(HealthAction::new(monitor))
        .with_action(TransitionAction::new(ctx.engine()))
        .with_action(ReconcileAction::new(ctx.reconciler()));
    heartbeat.run(ticks);
    Ok(exit_codes::OK)
}

fn report_advance(id: &str, outcome: &AdvanceOutcome) -> i32 {
    match outcome {
        AdvanceOutcome::Advanced {
            from,
            to,
            version,
            warnings,
            ..
        } => {
            println!("{id}: {from} -> {to} (v{version})");
            for warning in warnings {
                eprintln!("warning: {warning}");
            }
            exit_codes::OK
        }
        AdvanceOutcome::AwaitingApproval { stage, version } => {
            println!("{id}: awaiting approval to enter {stage} (v{version})");
            exit_codes::WAITING
        }
        AdvanceOutcome::Blocked { waiting_on } => {
            println!("{id}: waiting on {}", waiting_on.join(", "));
            exit_codes::WAITING
        }
        AdvanceOutcome::Terminal { stage } => {
            println!("{id}: already at terminal stage {stage}");
            exit_codes::OK
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(err) = err.downcast_ref::<TransitionError>() {
        return match err {
            TransitionError::ValidationFailed { .. } => exit_codes::REJECTED,
            TransitionError::IterationGuard { .. } => exit_codes::ESCALATE,
            TransitionError::VersionConflict { .. } => exit_codes::CONFLICT,
            TransitionError::Store(store) => store_exit_code(store),
            _ => exit_codes::INVALID,
        };
    }
    err.downcast_ref::<StoreError>()
        .map_or(exit_codes::INVALID, store_exit_code)
}

fn store_exit_code(err: &StoreError) -> i32 {
    match err {
        StoreError::VersionConflict { .. }
        | StoreError::SyncConflict { .. }
        | StoreError::Blocked(_)
        | StoreError::Locked(_) => exit_codes::CONFLICT,
        _ => exit_codes::INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_advance_with_expected_version() {
        let cli = Cli::parse_from(["conductor", "advance", "7", "--expected-version", "3"]);
        assert!(matches!(
            cli.command,
            Command::Advance {
                ref id,
                expected_version: Some(3),
                actor: ActorArg::Agent,
            } if id == "7"
        ));
    }

    #[test]
    fn parse_redirect_requires_both_stages() {
        assert!(Cli::try_parse_from(["conductor", "redirect", "7", "--from", "review"]).is_err());
        let cli = Cli::parse_from([
            "conductor", "redirect", "7", "--from", "review", "--to", "revise",
        ]);
        assert!(matches!(cli.command, Command::Redirect { ref to, .. } if to == "revise"));
    }

    #[test]
    fn parse_root_is_global() {
        let cli = Cli::parse_from(["conductor", "heartbeat", "--ticks", "2", "--root", "/srv/repo"]);
        assert_eq!(cli.root, PathBuf::from("/srv/repo"));
        assert!(matches!(cli.command, Command::Heartbeat { ticks: Some(2) }));
    }

    #[test]
    fn hook_failures_map_to_rejected() {
        let err = anyhow::Error::new(TransitionError::ValidationFailed {
            id: "7".to_string(),
            stage: "plan".to_string(),
            hook: "artifact_exists(plan.md)".to_string(),
            reason: "missing".to_string(),
        });
        assert_eq!(exit_code_for(&err), exit_codes::REJECTED);
        let err = anyhow::Error::new(StoreError::Blocked("7".to_string()));
        assert_eq!(exit_code_for(&err), exit_codes::CONFLICT);
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), exit_codes::INVALID);
    }
}
