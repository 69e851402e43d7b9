//! Session/Environment Reconciler.
//!
//! An environment owns its sessions: it is created before them and destroyed
//! after them. Names come from the naming template, so repeated passes
//! converge on the same identities instead of creating duplicates.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Map;
use tracing::{debug, error, info, instrument, warn};

use crate::core::naming::{ENVIRONMENT_ROLE, managed_env, render_name};
use crate::core::registry::{Registry, RuntimeSpec};
use crate::core::types::{
    Actor, EnvironmentHandle, EventKind, HistoryEvent, RuntimeRecord, SessionHandle, WorkItem,
};
use crate::heartbeat::{TickAction, TickContext};
use crate::io::config::ConductorConfig;
use crate::io::paths::resolve_workspace;
use crate::io::process::{command_from_argv, run_command_with_timeout};
use crate::io::runtime::{EnvironmentRequest, EnvironmentRuntime, SessionRequest, SessionRuntime};
use crate::io::store::{StateStore, StoreError};

const TEARDOWN_OUTPUT_LIMIT: usize = 64 * 1024;

/// Names and declaration the item's current stage asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRuntime {
    pub stage: String,
    pub environment: Option<String>,
    /// `(role, session name)` in declaration order.
    pub sessions: Vec<(String, String)>,
    pub spec: RuntimeSpec,
}

/// What drift repair did for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    InSync,
    Started,
    /// Stage changed to one with a different runtime declaration.
    Restarted,
    /// Environment alive, listed sessions were missing and recreated.
    SessionsRecreated(Vec<String>),
    /// Environment vanished; its sessions were marked dead and everything restarted.
    EnvironmentRecovered(String),
    /// Item left its active stage; runtime torn down.
    TornDown,
    /// Manually stopped; left down.
    Stopped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DriftReport {
    pub repaired: Vec<(String, Drift)>,
    /// Items whose repair failed; escalated to the operator.
    pub failed: Vec<(String, String)>,
}

pub struct Reconciler<'a, S, E, R>
where
    S: StateStore,
    E: EnvironmentRuntime,
    R: SessionRuntime,
{
    registry: &'a Registry,
    store: &'a S,
    environments: &'a E,
    sessions: &'a R,
    config: &'a ConductorConfig,
    root: PathBuf,
}

impl<'a, S, E, R> Reconciler<'a, S, E, R>
where
    S: StateStore,
    E: EnvironmentRuntime,
    R: SessionRuntime,
{
    pub fn new(
        registry: &'a Registry,
        store: &'a S,
        environments: &'a E,
        sessions: &'a R,
        config: &'a ConductorConfig,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            store,
            environments,
            sessions,
            config,
            root: root.into(),
        }
    }

    fn name_for(&self, role: &str, id: &str) -> String {
        render_name(
            &self.config.naming_template,
            &self.config.project,
            role,
            id,
        )
    }

    fn workspace(&self, id: &str) -> PathBuf {
        resolve_workspace(&self.root, &self.config.workspace_template, id)
    }

    /// `None` when the item's stage runs no sessions.
    pub fn desired(&self, item: &WorkItem) -> Result<Option<DesiredRuntime>> {
        let stage = self.registry.stage(&item.stage)?;
        let Some(spec) = stage.runtime.as_ref().filter(|_| stage.is_active()) else {
            return Ok(None);
        };
        let environment = spec
            .isolated
            .then(|| self.name_for(ENVIRONMENT_ROLE, &item.id));
        let sessions = spec
            .roles
            .iter()
            .map(|role| (role.clone(), self.name_for(role, &item.id)))
            .collect();
        Ok(Some(DesiredRuntime {
            stage: stage.name.clone(),
            environment,
            sessions,
            spec: spec.clone(),
        }))
    }

    /// Start flow: tear down any stale environment, create it, then its sessions.
    #[instrument(skip_all, fields(item = id))]
    pub fn start(&self, id: &str) -> Result<WorkItem> {
        let item = self.store.read(id)?;
        let desired = self
            .desired(&item)?
            .ok_or_else(|| anyhow!("work item '{id}' is at '{}', which runs no sessions", item.stage))?;
        let workdir = self.workspace(id);

        if let Some(environment) = &desired.environment {
            if self.environments.exists(environment)? {
                warn!(environment = %environment, "stale environment found, tearing down first");
                for (_, session) in &desired.sessions {
                    self.sessions.destroy(session)?;
                }
                self.environments.destroy(environment)?;
            }
            let image = desired
                .spec
                .image
                .as_deref()
                .unwrap_or(&self.config.runtime.default_image);
            self.environments
                .create(&EnvironmentRequest {
                    name: environment,
                    image,
                    ports: &desired.spec.ports,
                    mounts: &desired.spec.mounts,
                    env: managed_env(id, ENVIRONMENT_ROLE),
                    workdir: &workdir,
                })
                .with_context(|| format!("start environment for work item '{id}'"))?;
        }

        for (role, session) in &desired.sessions {
            if desired.environment.is_none() && self.sessions.exists(session)? {
                warn!(session = %session, "stale session found, replacing");
                self.sessions.destroy(session)?;
            }
            self.start_session(id, role, session, &desired, &workdir)?;
        }

        let runtime = live_record(&desired);
        let note = format!("started {}", describe_runtime(&desired));
        info!("{note}");
        self.record(id, runtime, note)
    }

    /// Create one session, retrying when it dies right after creation.
    fn start_session(
        &self,
        id: &str,
        role: &str,
        session: &str,
        desired: &DesiredRuntime,
        workdir: &Path,
    ) -> Result<()> {
        let attempts = self.config.runtime.session_start_attempts;
        let settle = Duration::from_millis(self.config.runtime.session_settle_ms);
        for attempt in 1..=attempts {
            self.sessions
                .create(&SessionRequest {
                    name: session,
                    command: &desired.spec.command,
                    workdir,
                    env: managed_env(id, role),
                    environment: desired.environment.as_deref(),
                })
                .with_context(|| format!("start session '{session}' for work item '{id}'"))?;
            thread::sleep(settle);
            if self.sessions.exists(session)? {
                debug!(session, attempt, "session alive");
                return Ok(());
            }
            warn!(session, attempt, attempts, "session died immediately");
        }
        bail!("session '{session}' for work item '{id}' died immediately on all {attempts} attempts")
    }

    /// Stop flow. `manual` marks the record stopped so drift repair leaves it down.
    #[instrument(skip_all, fields(item = id, manual = manual))]
    pub fn stop(&self, id: &str, manual: bool) -> Result<WorkItem> {
        let item = self.store.read(id)?;
        let record = item.runtime.clone();
        let spec = record
            .stage
            .as_deref()
            .and_then(|stage| self.registry.stage(stage).ok())
            .and_then(|stage| stage.runtime.clone())
            .unwrap_or_default();
        let environment = record.environment.as_ref().map(|env| env.name.clone());
        let workdir = self.workspace(id);

        for command in &spec.pre_teardown {
            let result = match &environment {
                Some(env) => self.environments.exec(env, command),
                None => self.run_host(command, &workdir),
            };
            if let Err(err) = result {
                warn!(command = %command.join(" "), err = %format!("{err:#}"), "pre-teardown action failed");
            }
        }

        let mut failures = Vec::new();
        for session in &record.sessions {
            if let Err(err) = self.sessions.destroy(&session.name) {
                failures.push(format!("session '{}': {err:#}", session.name));
            }
        }
        if let Some(env) = &environment
            && let Err(err) = self.environments.destroy(env)
        {
            failures.push(format!("environment '{env}': {err:#}"));
        }
        if !failures.is_empty() {
            bail!(
                "stop work item '{id}' incomplete: {}",
                failures.join("; ")
            );
        }

        for command in &spec.post_teardown {
            if let Err(err) = self.run_host(command, &workdir) {
                warn!(command = %command.join(" "), err = %format!("{err:#}"), "post-teardown action failed");
            }
        }

        // a manual stop remembers its stage so a later stage change can start again
        let runtime = RuntimeRecord {
            stage: manual.then(|| item.stage.clone()),
            stopped: manual,
            ..RuntimeRecord::default()
        };
        let note = if manual {
            "stopped by operator".to_string()
        } else {
            "runtime torn down".to_string()
        };
        info!("{note}");
        self.record(id, runtime, note)
    }

    /// Converge one item's actual runtime with its desired runtime.
    #[instrument(skip_all, fields(item = %item.id))]
    pub fn repair(&self, item: &WorkItem) -> Result<Drift> {
        let record = &item.runtime;
        let Some(desired) = self.desired(item)? else {
            if record.environment.is_some() || !record.sessions.is_empty() {
                self.stop(&item.id, false)?;
                return Ok(Drift::TornDown);
            }
            return Ok(Drift::InSync);
        };
        if record.stopped && record.stage.as_deref() == Some(desired.stage.as_str()) {
            return Ok(Drift::Stopped);
        }
        if record.stopped || record.stage.is_none() {
            self.start(&item.id)?;
            return Ok(Drift::Started);
        }
        if live_record(&desired) != live_view(record) {
            self.stop(&item.id, false)?;
            self.start(&item.id)?;
            return Ok(Drift::Restarted);
        }

        if let Some(environment) = &desired.environment
            && !self.environments.exists(environment)?
        {
            let dead: Vec<&str> = record
                .sessions
                .iter()
                .map(|session| session.name.as_str())
                .collect();
            error!(
                environment = %environment,
                sessions = ?dead,
                "environment lost; sessions unreachable"
            );
            let mut marked = record.clone();
            for session in &mut marked.sessions {
                session.live = false;
            }
            if let Some(env) = marked.environment.as_mut() {
                env.live = false;
            }
            self.record(
                &item.id,
                marked,
                format!(
                    "environment '{environment}' lost; sessions {} marked dead",
                    dead.join(", ")
                ),
            )?;
            self.start(&item.id)?;
            return Ok(Drift::EnvironmentRecovered(environment.clone()));
        }

        let workdir = self.workspace(&item.id);
        let mut recreated = Vec::new();
        for (role, session) in &desired.sessions {
            if !self.sessions.exists(session)? {
                warn!(session = %session, "session missing, recreating");
                self.start_session(&item.id, role, session, &desired, &workdir)?;
                recreated.push(session.clone());
            }
        }
        if recreated.is_empty() {
            return Ok(Drift::InSync);
        }
        self.record(
            &item.id,
            live_record(&desired),
            format!("recreated sessions {}", recreated.join(", ")),
        )?;
        Ok(Drift::SessionsRecreated(recreated))
    }

    /// Drift repair across every live work item. One item's failure does not stop the others.
    pub fn repair_all(&self) -> Result<DriftReport> {
        let mut report = DriftReport::default();
        for item in self.store.list_all()? {
            if self.store.is_blocked(&item.id)? {
                continue;
            }
            match self.repair(&item) {
                Ok(Drift::InSync) => {}
                Ok(drift) => report.repaired.push((item.id.clone(), drift)),
                Err(err) => {
                    error!(item = %item.id, err = %format!("{err:#}"), "drift repair failed");
                    report.failed.push((item.id.clone(), format!("{err:#}")));
                }
            }
        }
        Ok(report)
    }

    fn run_host(&self, command: &[String], workdir: &Path) -> Result<()> {
        let cmd = command_from_argv(command, workdir)?;
        let timeout = Duration::from_secs(self.config.runtime.command_timeout_secs);
        let output = run_command_with_timeout(cmd, None, timeout, TEARDOWN_OUTPUT_LIMIT)?;
        if !output.success() {
            bail!("'{}' {}", command.join(" "), output.summary());
        }
        Ok(())
    }

    /// Write only the runtime record onto a fresh read, retrying once on a version race.
    fn record(&self, id: &str, runtime: RuntimeRecord, note: String) -> Result<WorkItem> {
        for attempt in 1..=2 {
            let item = self.store.read(id)?;
            let mut next = item.clone();
            next.runtime = runtime.clone();
            carry_extras(&mut next.runtime, &item.runtime);
            let event = HistoryEvent::in_place(EventKind::Runtime, &item.position(), Actor::Controller)
                .with_note(note.clone());
            match self.store.write(next, item.version, event) {
                Ok(written) => return Ok(written),
                Err(StoreError::VersionConflict { .. }) if attempt == 1 => {
                    debug!(item = id, "runtime record raced a write, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        bail!("runtime record for work item '{id}' lost two version races")
    }
}

fn live_record(desired: &DesiredRuntime) -> RuntimeRecord {
    let sessions: Vec<SessionHandle> = desired
        .sessions
        .iter()
        .map(|(role, name)| SessionHandle {
            name: name.clone(),
            role: role.clone(),
            live: true,
            environment: desired.environment.clone(),
            extra: Map::new(),
        })
        .collect();
    RuntimeRecord {
        stage: Some(desired.stage.clone()),
        environment: desired.environment.as_ref().map(|name| EnvironmentHandle {
            name: name.clone(),
            live: true,
            ports: desired.spec.ports.clone(),
            mounts: desired.spec.mounts.clone(),
            sessions: sessions.iter().map(|session| session.name.clone()).collect(),
            extra: Map::new(),
        }),
        sessions,
        ..RuntimeRecord::default()
    }
}

/// The record as it would look if everything in it were live, for comparing identities.
fn live_view(record: &RuntimeRecord) -> RuntimeRecord {
    let mut view = record.clone();
    view.extra.clear();
    if let Some(env) = view.environment.as_mut() {
        env.live = true;
        env.extra.clear();
    }
    for session in &mut view.sessions {
        session.live = true;
        session.extra.clear();
    }
    view
}

/// Keep fields other writers attached to the record and to handles that survive by name.
fn carry_extras(next: &mut RuntimeRecord, previous: &RuntimeRecord) {
    if next.extra.is_empty() {
        next.extra = previous.extra.clone();
    }
    if let (Some(env), Some(old)) = (next.environment.as_mut(), previous.environment.as_ref())
        && env.name == old.name
        && env.extra.is_empty()
    {
        env.extra = old.extra.clone();
    }
    for session in &mut next.sessions {
        if let Some(old) = previous
            .sessions
            .iter()
            .find(|old| old.name == session.name)
            && session.extra.is_empty()
        {
            session.extra = old.extra.clone();
        }
    }
}

fn describe_runtime(desired: &DesiredRuntime) -> String {
    let sessions: Vec<&str> = desired
        .sessions
        .iter()
        .map(|(_, name)| name.as_str())
        .collect();
    match &desired.environment {
        Some(env) => format!("environment '{env}' with sessions {}", sessions.join(", ")),
        None => format!("host sessions {}", sessions.join(", ")),
    }
}

/// Heartbeat action running drift repair.
pub struct ReconcileAction<'a, S, E, R>
where
    S: StateStore,
    E: EnvironmentRuntime,
    R: SessionRuntime,
{
    reconciler: Reconciler<'a, S, E, R>,
}

impl<'a, S, E, R> ReconcileAction<'a, S, E, R>
where
    S: StateStore,
    E: EnvironmentRuntime,
    R: SessionRuntime,
{
    pub fn new(reconciler: Reconciler<'a, S, E, R>) -> Self {
        Self { reconciler }
    }
}

impl<S, E, R> TickAction for ReconcileAction<'_, S, E, R>
where
    S: StateStore,
    E: EnvironmentRuntime,
    R: SessionRuntime,
{
    fn name(&self) -> &str {
        "reconcile"
    }

    fn run(&mut self, _ctx: &TickContext) -> Result<Vec<String>> {
        let report = self.reconciler.repair_all()?;
        let mut notes: Vec<String> = report
            .repaired
            .iter()
            .map(|(id, drift)| format!("{id}: {drift:?}"))
            .collect();
        notes.extend(
            report
                .failed
                .iter()
                .map(|(id, err)| format!("{id}: repair failed: {err}")),
        );
        Ok(notes)
    }
}
