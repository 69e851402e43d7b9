//! Transition Engine: the work-item state machine.
//!
//! `advance` runs exit hooks, picks the destination (redirect target or flow
//! successor), halts on unapproved `human_review` destinations, writes the
//! transition with the version it read, then runs entry hooks. Entry-hook
//! failures never roll back a durable write; they are recorded as warnings.

use chrono::Utc;
use serde_json::Map;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::core::guard::{RedirectBudget, redirect_budget};
use crate::core::hooks::{HookResult, HookRun};
use crate::core::registry::{NextStage, Registry, RegistryError, StageDefinition};
use crate::core::types::{
    Actor, Approval, EventKind, HistoryEvent, HookPhase, HookRecord, PendingReview, Position,
    WorkItem,
};
use crate::heartbeat::{TickAction, TickContext};
use crate::io::hooks::HookRunner;
use crate::io::store::{StateStore, StoreError};

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("work item '{id}' cannot leave '{stage}': {hook} failed: {reason}")]
    ValidationFailed {
        id: String,
        stage: String,
        hook: String,
        reason: String,
    },
    #[error(
        "work item '{id}' at '{stage}': {hook} reached {count} (max {max}); escalate to a human"
    )]
    IterationGuard {
        id: String,
        stage: String,
        hook: String,
        count: u32,
        max: u32,
    },
    #[error(
        "work item '{id}': expected version {expected}, found {actual} (attempt {attempts}); another writer won"
    )]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
        attempts: u32,
    },
    #[error("work item '{id}' is at '{actual}', not '{expected}'")]
    StageMismatch {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("work item '{0}' has no pending review to approve")]
    NoPendingReview(String),
    #[error("work item '{id}' cannot be archived: {reason}")]
    NotArchivable { id: String, reason: String },
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("hook execution failed for work item '{id}': {error:#}")]
    Hook { id: String, error: anyhow::Error },
}

impl From<StoreError> for TransitionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict {
                id,
                expected,
                actual,
            } => TransitionError::VersionConflict {
                id,
                expected,
                actual,
                attempts: 1,
            },
            other => TransitionError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvanceRequest {
    pub actor: Actor,
    /// Version the caller last observed. When set, a mismatch fails instead of re-reading.
    pub expected_version: Option<u64>,
}

impl AdvanceRequest {
    pub fn by(actor: Actor) -> Self {
        Self {
            actor,
            expected_version: None,
        }
    }

    pub fn at_version(actor: Actor, version: u64) -> Self {
        Self {
            actor,
            expected_version: Some(version),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Advanced {
        from: Position,
        to: Position,
        version: u64,
        redirected: bool,
        /// Entry hooks that did not pass after the write.
        warnings: Vec<String>,
    },
    /// Halted before a `human_review` stage until an approval is recorded.
    AwaitingApproval { stage: String, version: u64 },
    /// Dependencies have not reached a terminal stage yet.
    Blocked { waiting_on: Vec<String> },
    Terminal { stage: String },
}

/// Where an exit-hook pass leads.
enum Exit {
    Next,
    Redirect(String),
}

pub struct TransitionEngine<'a, S: StateStore, H: HookRunner> {
    registry: &'a Registry,
    store: &'a S,
    hooks: &'a H,
    max_redirects: u32,
}

impl<'a, S: StateStore, H: HookRunner> TransitionEngine<'a, S, H> {
    pub fn new(registry: &'a Registry, store: &'a S, hooks: &'a H, max_redirects: u32) -> Self {
        Self {
            registry,
            store,
            hooks,
            max_redirects,
        }
    }

    /// Move `id` one step: to the next substage, the redirect target, or the flow successor.
    ///
    /// A version conflict is retried once from a fresh read unless the caller
    /// pinned `expected_version`.
    #[instrument(skip_all, fields(item = id, actor = %request.actor))]
    pub fn advance(
        &self,
        id: &str,
        request: AdvanceRequest,
    ) -> Result<AdvanceOutcome, TransitionError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let item = self.store.read(id)?;
            if let Some(expected) = request.expected_version
                && item.version != expected
            {
                return Err(TransitionError::VersionConflict {
                    id: id.to_string(),
                    expected,
                    actual: item.version,
                    attempts,
                });
            }
            match self.advance_from(item, request.actor) {
                Err(TransitionError::VersionConflict {
                    id,
                    expected,
                    actual,
                    ..
                }) => {
                    if request.expected_version.is_none() && attempts < 2 {
                        debug!(expected, actual, "version conflict, retrying once");
                        continue;
                    }
                    warn!(expected, actual, attempts, "version conflict surfaced");
                    return Err(TransitionError::VersionConflict {
                        id,
                        expected,
                        actual,
                        attempts,
                    });
                }
                other => return other,
            }
        }
    }

    fn advance_from(
        &self,
        item: WorkItem,
        actor: Actor,
    ) -> Result<AdvanceOutcome, TransitionError> {
        let stage = self.registry.stage(&item.stage)?;
        if stage.terminal {
            return Ok(AdvanceOutcome::Terminal {
                stage: stage.name.clone(),
            });
        }

        let waiting_on = self.unmet_dependencies(&item)?;
        if !waiting_on.is_empty() {
            info!(waiting_on = ?waiting_on, "blocked on dependencies");
            return Ok(AdvanceOutcome::Blocked { waiting_on });
        }

        let mut records = Vec::new();
        let mut exit = Exit::Next;
        if let Some(current) = &item.substage {
            let substage = stage
                .substage(current)
                .ok_or_else(|| RegistryError::UnknownStage(format!("{}/{current}", stage.name)))?;
            let run = self.hook(&item, |hooks| {
                hooks.run_substage(substage, HookPhase::Exit, &item)
            })?;
            exit = self.exit_outcome(&item, run, &mut records)?;
            if let (Exit::Next, Some(next)) = (&exit, stage.next_substage(current)) {
                let to = Position {
                    stage: stage.name.clone(),
                    substage: Some(next.name.clone()),
                };
                let written = self.transition(&item, &to, EventKind::Transition, actor, records)?;
                let run = self.hooks.run_substage(next, HookPhase::Entry, &written);
                let (written, warnings) = self.record_entry_warnings(written, &to, run);
                return Ok(AdvanceOutcome::Advanced {
                    from: item.position(),
                    to,
                    version: written.version,
                    redirected: false,
                    warnings,
                });
            }
        }

        if let Exit::Next = exit {
            let run = self.hook(&item, |hooks| hooks.run_exit(stage, &item))?;
            exit = self.exit_outcome(&item, run, &mut records)?;
        }

        let (destination, kind) = match exit {
            Exit::Redirect(target) => {
                self.check_redirect_budget(&item, &target)?;
                (self.registry.stage(&target)?, EventKind::Redirect)
            }
            Exit::Next => match self.registry.next_stage(&item.flow, &item.stage)? {
                NextStage::Stage(next) => (next, EventKind::Transition),
                NextStage::Terminal => {
                    return Ok(AdvanceOutcome::Terminal {
                        stage: stage.name.clone(),
                    });
                }
            },
        };

        if destination.human_review && !item.is_approved_for(&destination.name) {
            return self.await_approval(item, destination, actor, records);
        }

        let to = Position {
            stage: destination.name.clone(),
            substage: destination.first_substage().map(str::to_string),
        };
        let written = self.transition(&item, &to, kind, actor, records)?;
        let (written, warnings) = self.enter(written, destination, &to);
        info!(from = %item.position(), to = %to, version = written.version, "advanced");
        Ok(AdvanceOutcome::Advanced {
            from: item.position(),
            to,
            version: written.version,
            redirected: kind == EventKind::Redirect,
            warnings,
        })
    }

    /// Record an approval for the pending review target. Approving twice is a no-op.
    #[instrument(skip_all, fields(item = id, actor = %actor))]
    pub fn approve(&self, id: &str, actor: Actor) -> Result<WorkItem, TransitionError> {
        let item = self.store.read(id)?;
        let Some(review) = &item.review else {
            return Err(TransitionError::NoPendingReview(id.to_string()));
        };
        let target = review.target.clone();
        if item.is_approved_for(&target) {
            return Ok(item);
        }
        let mut next = item.clone();
        next.approvals.push(Approval {
            stage: target.clone(),
            actor,
            at: Utc::now(),
            extra: Map::new(),
        });
        let event = HistoryEvent::in_place(EventKind::Approval, &item.position(), actor)
            .with_note(format!("approved entry to '{target}'"));
        let written = self.store.write(next, item.version, event)?;
        info!(target = %target, "approval recorded");
        Ok(written)
    }

    /// Send a work item from `from` straight to `to`, bypassing the flow successor.
    ///
    /// Bounded by the same redirect budget as hook redirects: the redirect past
    /// the configured maximum hard-fails instead of looping.
    #[instrument(skip_all, fields(item = id, from, to))]
    pub fn redirect_and_return(
        &self,
        id: &str,
        from: &str,
        to: &str,
        actor: Actor,
    ) -> Result<AdvanceOutcome, TransitionError> {
        let item = self.store.read(id)?;
        if item.stage != from {
            return Err(TransitionError::StageMismatch {
                id: id.to_string(),
                expected: from.to_string(),
                actual: item.stage.clone(),
            });
        }
        let destination = self.registry.stage(to)?;
        if !destination.terminal && !self.registry.flow(&item.flow)?.contains(to) {
            return Err(RegistryError::NotInFlow {
                flow: item.flow.clone(),
                stage: to.to_string(),
            }
            .into());
        }
        self.check_redirect_budget(&item, to)?;

        let target = Position {
            stage: destination.name.clone(),
            substage: destination.first_substage().map(str::to_string),
        };
        let written = self.transition(&item, &target, EventKind::Redirect, actor, Vec::new())?;
        let (written, warnings) = self.enter(written, destination, &target);
        info!(version = written.version, "redirected");
        Ok(AdvanceOutcome::Advanced {
            from: item.position(),
            to: target,
            version: written.version,
            redirected: true,
            warnings,
        })
    }

    /// Archive a work item that reached a terminal stage and holds no live runtime.
    pub fn archive(&self, id: &str) -> Result<(), TransitionError> {
        let item = self.store.read(id)?;
        if !self.registry.is_terminal(&item.stage) {
            return Err(TransitionError::NotArchivable {
                id: id.to_string(),
                reason: format!("stage '{}' is not terminal", item.stage),
            });
        }
        if item.runtime.any_live() {
            return Err(TransitionError::NotArchivable {
                id: id.to_string(),
                reason: "sessions or environment still live".to_string(),
            });
        }
        self.store.archive(id)?;
        Ok(())
    }

    fn hook(
        &self,
        item: &WorkItem,
        run: impl FnOnce(&H) -> anyhow::Result<HookRun>,
    ) -> Result<HookRun, TransitionError> {
        run(self.hooks).map_err(|error| TransitionError::Hook {
            id: item.id.clone(),
            error,
        })
    }

    /// Turn an exit-hook result into the next step, or the error that stops the transition.
    fn exit_outcome(
        &self,
        item: &WorkItem,
        run: HookRun,
        records: &mut Vec<HookRecord>,
    ) -> Result<Exit, TransitionError> {
        records.extend(run.records);
        match run.result {
            HookResult::Pass => Ok(Exit::Next),
            HookResult::Redirect { hook, target, reason } => {
                info!(hook = %hook, target = %target, reason = %reason, "exit hook redirected");
                Ok(Exit::Redirect(target))
            }
            HookResult::Fail { hook, reason } => Err(TransitionError::ValidationFailed {
                id: item.id.clone(),
                stage: item.position().to_string(),
                hook,
                reason,
            }),
            HookResult::Tripped { hook, count, max } => Err(TransitionError::IterationGuard {
                id: item.id.clone(),
                stage: item.position().to_string(),
                hook,
                count,
                max,
            }),
        }
    }

    fn check_redirect_budget(&self, item: &WorkItem, target: &str) -> Result<(), TransitionError> {
        match redirect_budget(&item.history, &item.stage, target, self.max_redirects) {
            RedirectBudget::Allowed { next } => {
                debug!(next, max = self.max_redirects, "redirect allowed");
                Ok(())
            }
            RedirectBudget::Exhausted { count } => {
                warn!(count, max = self.max_redirects, "redirect budget exhausted");
                Err(TransitionError::IterationGuard {
                    id: item.id.clone(),
                    stage: item.stage.clone(),
                    hook: format!("redirect {} -> {target}", item.stage),
                    count,
                    max: self.max_redirects,
                })
            }
        }
    }

    fn unmet_dependencies(&self, item: &WorkItem) -> Result<Vec<String>, TransitionError> {
        if item.dependencies.is_empty() {
            return Ok(Vec::new());
        }
        let flow = self.registry.flow(&item.flow)?;
        if flow.first_stage() != Some(item.stage.as_str()) {
            return Ok(Vec::new());
        }
        let mut waiting = Vec::new();
        for dependency in &item.dependencies {
            let done = match self.store.read(dependency) {
                Ok(dep) => self.registry.is_terminal(&dep.stage),
                Err(StoreError::NotFound(_)) => self.store.is_archived(dependency)?,
                Err(err) => return Err(err.into()),
            };
            if !done {
                waiting.push(dependency.clone());
            }
        }
        Ok(waiting)
    }

    /// Record the pending review once; repeated calls report the same halt.
    fn await_approval(
        &self,
        item: WorkItem,
        destination: &StageDefinition,
        actor: Actor,
        records: Vec<HookRecord>,
    ) -> Result<AdvanceOutcome, TransitionError> {
        let stage = destination.name.clone();
        if item
            .review
            .as_ref()
            .is_some_and(|review| review.target == stage)
        {
            return Ok(AdvanceOutcome::AwaitingApproval {
                stage,
                version: item.version,
            });
        }
        let mut next = item.clone();
        next.review = Some(PendingReview {
            target: stage.clone(),
            since: Utc::now(),
            extra: Map::new(),
        });
        let event = HistoryEvent::in_place(EventKind::AwaitingApproval, &item.position(), actor)
            .with_hooks(records)
            .with_note(format!("awaiting approval to enter '{stage}'"));
        let written = self.store.write(next, item.version, event)?;
        info!(stage = %stage, "halted awaiting approval");
        Ok(AdvanceOutcome::AwaitingApproval {
            stage,
            version: written.version,
        })
    }

    /// Version-checked position change. Consumes a matching approval and clears the review.
    fn transition(
        &self,
        item: &WorkItem,
        to: &Position,
        kind: EventKind,
        actor: Actor,
        records: Vec<HookRecord>,
    ) -> Result<WorkItem, TransitionError> {
        let from = item.position();
        let key = format!("{from}->{to}#v{}", item.version);
        let mut next = item.clone();
        next.stage = to.stage.clone();
        next.substage = to.substage.clone();
        if from.stage != to.stage {
            next.approvals.retain(|approval| approval.stage != to.stage);
            next.review = None;
        }
        let event = HistoryEvent::new(kind, &from, to, actor)
            .with_key(key)
            .with_hooks(records);
        Ok(self.store.write(next, item.version, event)?)
    }

    /// Stage entry hooks, then the first substage's entry hooks.
    ///
    /// Returns the item as last written so callers report its current version.
    fn enter(
        &self,
        item: WorkItem,
        stage: &StageDefinition,
        at: &Position,
    ) -> (WorkItem, Vec<String>) {
        let run = self.hooks.run_entry(stage, &item);
        let passed = matches!(&run, Ok(run) if run.result.is_pass());
        let (item, mut warnings) = self.record_entry_warnings(item, at, run);
        let Some(first) = stage.substages.first().filter(|_| passed) else {
            return (item, warnings);
        };
        let run = self.hooks.run_substage(first, HookPhase::Entry, &item);
        let (item, more) = self.record_entry_warnings(item, at, run);
        warnings.extend(more);
        (item, warnings)
    }

    /// Entry-hook problems become an `entry_hook_warning` event; the transition stands.
    ///
    /// A lost race is retried once from a fresh read. If the event still cannot
    /// be written, that failure joins the returned warnings.
    fn record_entry_warnings(
        &self,
        item: WorkItem,
        at: &Position,
        run: anyhow::Result<HookRun>,
    ) -> (WorkItem, Vec<String>) {
        let (warning, records) = match run {
            Ok(HookRun {
                result: HookResult::Pass,
                ..
            }) => return (item, Vec::new()),
            Ok(HookRun { result, records }) => (describe(&result), records),
            Err(err) => (format!("entry hooks errored: {err:#}"), Vec::new()),
        };
        warn!(item = %item.id, at = %at, warning = %warning, "entry hook failed after transition");
        let mut warnings = vec![warning.clone()];
        let mut current = item;
        for attempt in 1..=2 {
            let event = HistoryEvent::in_place(EventKind::EntryHookWarning, at, Actor::Controller)
                .with_hooks(records.clone())
                .with_note(warning.clone());
            let err = match self.store.write(current.clone(), current.version, event) {
                Ok(written) => return (written, warnings),
                Err(err) => err,
            };
            let retry = attempt == 1
                && matches!(err, StoreError::VersionConflict { .. } | StoreError::Locked(_));
            let fresh = if retry {
                self.store.read(&current.id)
            } else {
                Err(err)
            };
            match fresh {
                Ok(fresh) => {
                    debug!(item = %fresh.id, "entry hook warning raced a write, retrying");
                    current = fresh;
                }
                Err(err) => {
                    error!(item = %current.id, err = %err, "could not record entry hook warning");
                    warnings.push(format!("entry hook warning not recorded: {err}"));
                    break;
                }
            }
        }
        (current, warnings)
    }
}

fn describe(result: &HookResult) -> String {
    match result {
        HookResult::Pass => "passed".to_string(),
        HookResult::Fail { hook, reason } => format!("{hook} failed: {reason}"),
        HookResult::Redirect { hook, target, reason } => {
            format!("{hook} failed: {reason} (redirect to '{target}' ignored on entry)")
        }
        HookResult::Tripped { hook, count, max } => {
            format!("{hook} tripped: {count} exceeds max {max}")
        }
    }
}

/// Controller-side transitions: `auto_advance` stages and approved pending reviews.
pub struct TransitionAction<'a, S: StateStore, H: HookRunner> {
    engine: TransitionEngine<'a, S, H>,
}

impl<'a, S: StateStore, H: HookRunner> TransitionAction<'a, S, H> {
    pub fn new(engine: TransitionEngine<'a, S, H>) -> Self {
        Self { engine }
    }

    fn wants_advance(&self, item: &WorkItem) -> Result<bool, TransitionError> {
        if let Some(review) = &item.review {
            return Ok(item.is_approved_for(&review.target));
        }
        let stage = self.engine.registry.stage(&item.stage)?;
        Ok(stage.auto_advance && !stage.terminal)
    }
}

impl<S: StateStore, H: HookRunner> TickAction for TransitionAction<'_, S, H> {
    fn name(&self) -> &str {
        "transitions"
    }

    fn run(&mut self, _ctx: &TickContext) -> anyhow::Result<Vec<String>> {
        let mut notes = Vec::new();
        for item in self.engine.store.list_all()? {
            if self.engine.store.is_blocked(&item.id)? || !self.wants_advance(&item)? {
                continue;
            }
            let request = AdvanceRequest::at_version(Actor::Controller, item.version);
            match self.engine.advance(&item.id, request) {
                Ok(AdvanceOutcome::Advanced { from, to, .. }) => {
                    notes.push(format!("{}: {from} -> {to}", item.id));
                }
                Ok(AdvanceOutcome::AwaitingApproval { stage, .. }) => {
                    notes.push(format!("{}: awaiting approval for '{stage}'", item.id));
                }
                Ok(AdvanceOutcome::Blocked { waiting_on }) => {
                    notes.push(format!("{}: waiting on {}", item.id, waiting_on.join(", ")));
                }
                Ok(AdvanceOutcome::Terminal { .. }) => {}
                Err(err) => {
                    warn!(item = %item.id, err = %err, "controller transition failed");
                    notes.push(format!("{}: {err}", item.id));
                }
            }
        }
        Ok(notes)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::core::hooks::HookSpec;
    use crate::core::types::HookOutcome;
    use crate::io::store::FsStore;
    use crate::test_support::{ScriptedHooks, memory_store, sample_registry, work_item};

    struct Fixture {
        _temp: tempfile::TempDir,
        store: FsStore,
        registry: Registry,
        hooks: ScriptedHooks,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = memory_store(temp.path());
        Fixture {
            _temp: temp,
            store,
            registry: sample_registry(),
            hooks: ScriptedHooks::default(),
        }
    }

    impl Fixture {
        fn engine(&self) -> TransitionEngine<'_, FsStore, ScriptedHooks> {
            TransitionEngine::new(&self.registry, &self.store, &self.hooks, 5)
        }

        fn create(&self, id: &str, stage: &str) -> WorkItem {
            self.store.create(work_item(id, stage)).expect("create")
        }
    }

    #[test]
    fn plan_advances_to_first_implement_substage() {
        let fx = fixture();
        fx.create("1", "plan");
        let outcome = fx
            .engine()
            .advance("1", AdvanceRequest::by(Actor::Agent))
            .expect("advance");
        let AdvanceOutcome::Advanced { to, version, .. } = outcome else {
            panic!("expected advance, got {outcome:?}");
        };
        assert_eq!(to.to_string(), "implement/setup");
        assert_eq!(version, 2);
        let item = fx.store.read("1").expect("read");
        assert_eq!(item.history.len(), 2);
        assert_eq!(item.history[1].key.as_deref(), Some("plan->implement/setup#v1"));
    }

    #[test]
    fn substages_advance_before_the_stage() {
        let fx = fixture();
        let mut item = work_item("1", "implement");
        item.substage = Some("setup".to_string());
        fx.store.create(item).expect("create");
        let engine = fx.engine();
        engine
            .advance("1", AdvanceRequest::by(Actor::Agent))
            .expect("advance");
        assert_eq!(
            fx.store.read("1").expect("read").position().to_string(),
            "implement/build"
        );
        engine
            .advance("1", AdvanceRequest::by(Actor::Agent))
            .expect("advance");
        let item = fx.store.read("1").expect("read");
        assert_eq!(item.position().to_string(), "review");
        assert!(item.review.is_none());
    }

    #[test]
    fn failed_exit_hook_leaves_version_unchanged() {
        let fx = fixture();
        fx.create("1", "plan");
        fx.hooks.fail("plan", HookPhase::Exit, "plan.md missing");
        let err = fx
            .engine()
            .advance("1", AdvanceRequest::by(Actor::Agent))
            .expect_err("fail");
        assert!(matches!(
            err,
            TransitionError::ValidationFailed { ref stage, ref reason, .. }
                if stage == "plan" && reason == "plan.md missing"
        ));
        assert_eq!(fx.store.read("1").expect("read").version, 1);
    }

    #[test]
    fn stale_expected_version_is_a_conflict() {
        let fx = fixture();
        fx.create("1", "plan");
        let engine = fx.engine();
        engine
            .advance("1", AdvanceRequest::at_version(Actor::Agent, 1))
            .expect("first");
        let err = engine
            .advance("1", AdvanceRequest::at_version(Actor::Agent, 1))
            .expect_err("second");
        assert!(matches!(
            err,
            TransitionError::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
        assert_eq!(fx.store.read("1").expect("read").history.len(), 2);
    }

    #[test]
    fn redirect_hook_changes_destination() {
        let fx = fixture();
        fx.create("1", "review");
        fx.hooks.redirect("review", "implement", "changes requested");
        let outcome = fx
            .engine()
            .advance("1", AdvanceRequest::by(Actor::Agent))
            .expect("advance");
        assert!(matches!(
            outcome,
            AdvanceOutcome::Advanced { redirected: true, ref to, .. }
                if to.to_string() == "implement/setup"
        ));
        let item = fx.store.read("1").expect("read");
        assert_eq!(item.history[1].kind, EventKind::Redirect);
        assert_eq!(item.history[1].hooks[0].outcome, HookOutcome::Redirect);
    }

    #[test]
    fn approval_gate_halts_once_then_completes() {
        let fx = fixture();
        fx.create("1", "revise");
        let engine = fx.engine();
        let first = engine
            .advance("1", AdvanceRequest::by(Actor::Agent))
            .expect("advance");
        assert_eq!(
            first,
            AdvanceOutcome::AwaitingApproval {
                stage: "accept".to_string(),
                version: 2
            }
        );
        let again = engine
            .advance("1", AdvanceRequest::by(Actor::Agent))
            .expect("advance");
        assert_eq!(first, again);
        assert_eq!(fx.store.read("1").expect("read").stage, "revise");

        engine.approve("1", Actor::Human).expect("approve");
        let done = engine
            .advance("1", AdvanceRequest::by(Actor::Agent))
            .expect("advance");
        assert!(matches!(done, AdvanceOutcome::Advanced { ref to, .. } if to.stage == "accept"));
        let item = fx.store.read("1").expect("read");
        assert!(item.review.is_none());
        assert!(item.approvals.is_empty());
        let kinds: Vec<EventKind> = item.history.iter().map(|event| event.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Created,
                EventKind::AwaitingApproval,
                EventKind::Approval,
                EventKind::Transition
            ]
        );
    }

    #[test]
    fn approve_without_pending_review_fails() {
        let fx = fixture();
        fx.create("1", "plan");
        assert!(matches!(
            fx.engine().approve("1", Actor::Human),
            Err(TransitionError::NoPendingReview(_))
        ));
    }

    #[test]
    fn entry_hook_failure_is_recorded_not_rolled_back() {
        let fx = fixture();
        fx.create("1", "plan");
        fx.hooks.fail("implement", HookPhase::Entry, "template missing");
        let outcome = fx
            .engine()
            .advance("1", AdvanceRequest::by(Actor::Agent))
            .expect("advance");
        let AdvanceOutcome::Advanced {
            warnings, version, ..
        } = outcome
        else {
            panic!("expected advance");
        };
        assert_eq!(warnings.len(), 1);
        let item = fx.store.read("1").expect("read");
        assert_eq!(item.stage, "implement");
        assert_eq!(item.history.last().map(|e| e.kind), Some(EventKind::EntryHookWarning));
        assert_eq!(version, 3);
        assert_eq!(item.version, version);

        // the reported version is the one to pin the next advance to
        fx.engine()
            .advance("1", AdvanceRequest::at_version(Actor::Agent, version))
            .expect("pinned advance");
    }

    #[test]
    fn entry_hook_error_is_recorded_as_warning() {
        let fx = fixture();
        fx.create("1", "plan");
        fx.hooks
            .error("implement", HookPhase::Entry, "spawn ./setup.sh: permission denied");
        let outcome = fx
            .engine()
            .advance("1", AdvanceRequest::by(Actor::Agent))
            .expect("advance");
        let AdvanceOutcome::Advanced {
            to,
            warnings,
            version,
            ..
        } = outcome
        else {
            panic!("expected advance, got {outcome:?}");
        };
        assert_eq!(to.to_string(), "implement/setup");
        assert_eq!(
            warnings,
            vec!["entry hooks errored: spawn ./setup.sh: permission denied".to_string()]
        );
        let item = fx.store.read("1").expect("read");
        assert_eq!(item.version, version);
        let last = item.history.last().expect("event");
        assert_eq!(last.kind, EventKind::EntryHookWarning);
        assert_eq!(last.note.as_deref(), Some(warnings[0].as_str()));
        // a stage entry that errored skips the substage entry hooks
        assert!(!fx.hooks.calls().contains(&("setup".to_string(), HookPhase::Entry)));
    }

    /// Delegates to [`FsStore`] but refuses the first `refusals` entry-hook warning writes.
    struct RefusingStore {
        inner: FsStore,
        refusals: std::cell::Cell<u32>,
    }

    impl StateStore for RefusingStore {
        fn read(&self, id: &str) -> Result<WorkItem, StoreError> {
            self.inner.read(id)
        }

        fn write(
            &self,
            item: WorkItem,
            expected_version: u64,
            event: HistoryEvent,
        ) -> Result<WorkItem, StoreError> {
            if event.kind == EventKind::EntryHookWarning && self.refusals.get() > 0 {
                self.refusals.set(self.refusals.get() - 1);
                return Err(StoreError::Locked(item.id));
            }
            self.inner.write(item, expected_version, event)
        }

        fn list_all(&self) -> Result<Vec<WorkItem>, StoreError> {
            self.inner.list_all()
        }

        fn sync(&self) -> Result<crate::io::store::SyncReport, StoreError> {
            self.inner.sync()
        }

        fn create(&self, item: WorkItem) -> Result<WorkItem, StoreError> {
            self.inner.create(item)
        }

        fn archive(&self, id: &str) -> Result<(), StoreError> {
            self.inner.archive(id)
        }

        fn unblock(&self, id: &str) -> Result<(), StoreError> {
            self.inner.unblock(id)
        }

        fn is_blocked(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.is_blocked(id)
        }

        fn is_archived(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.is_archived(id)
        }
    }

    fn refusing(temp: &Path, refusals: u32) -> RefusingStore {
        let store = RefusingStore {
            inner: memory_store(temp),
            refusals: std::cell::Cell::new(refusals),
        };
        store.create(work_item("1", "plan")).expect("create");
        store
    }

    #[test]
    fn entry_hook_warning_write_is_retried_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = refusing(temp.path(), 1);
        let registry = sample_registry();
        let hooks = ScriptedHooks::default();
        hooks.fail("implement", HookPhase::Entry, "template missing");
        let outcome = TransitionEngine::new(&registry, &store, &hooks, 5)
            .advance("1", AdvanceRequest::by(Actor::Agent))
            .expect("advance");
        let AdvanceOutcome::Advanced {
            warnings, version, ..
        } = outcome
        else {
            panic!("expected advance, got {outcome:?}");
        };
        assert_eq!(warnings.len(), 1);
        assert_eq!(version, 3);
        let item = store.read("1").expect("read");
        assert_eq!(item.history.last().map(|e| e.kind), Some(EventKind::EntryHookWarning));
    }

    #[test]
    fn unrecorded_entry_hook_warning_is_surfaced() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = refusing(temp.path(), 2);
        let registry = sample_registry();
        let hooks = ScriptedHooks::default();
        hooks.fail("implement", HookPhase::Entry, "template missing");
        let outcome = TransitionEngine::new(&registry, &store, &hooks, 5)
            .advance("1", AdvanceRequest::by(Actor::Agent))
            .expect("advance");
        let AdvanceOutcome::Advanced {
            warnings, version, ..
        } = outcome
        else {
            panic!("expected advance, got {outcome:?}");
        };
        assert_eq!(warnings.len(), 2);
        assert!(warnings[1].starts_with("entry hook warning not recorded"));
        assert_eq!(version, 2);
        assert_eq!(store.read("1").expect("read").version, 2);
    }

    #[test]
    fn redirect_and_return_hard_fails_past_budget() {
        let fx = fixture();
        fx.create("1", "review");
        let engine = TransitionEngine::new(&fx.registry, &fx.store, &fx.hooks, 2);
        for _ in 0..2 {
            engine
                .redirect_and_return("1", "review", "revise", Actor::Agent)
                .expect("redirect");
            engine
                .redirect_and_return("1", "revise", "review", Actor::Agent)
                .expect("back");
        }
        let err = engine
            .redirect_and_return("1", "review", "revise", Actor::Agent)
            .expect_err("third redirect");
        assert!(matches!(
            err,
            TransitionError::IterationGuard { count: 3, max: 2, .. }
        ));
    }

    #[test]
    fn redirect_and_return_checks_current_stage() {
        let fx = fixture();
        fx.create("1", "plan");
        assert!(matches!(
            fx.engine()
                .redirect_and_return("1", "review", "revise", Actor::Agent),
            Err(TransitionError::StageMismatch { .. })
        ));
    }

    #[test]
    fn dependencies_block_leaving_first_stage() {
        let fx = fixture();
        fx.create("dep", "plan");
        let mut item = work_item("1", "backlog");
        item.dependencies = vec!["dep".to_string()];
        fx.store.create(item).expect("create");
        let outcome = fx
            .engine()
            .advance("1", AdvanceRequest::by(Actor::Agent))
            .expect("advance");
        assert_eq!(
            outcome,
            AdvanceOutcome::Blocked {
                waiting_on: vec!["dep".to_string()]
            }
        );
    }

    #[test]
    fn terminal_items_report_terminal_and_archive() {
        let fx = fixture();
        fx.create("1", "accept");
        let engine = fx.engine();
        assert_eq!(
            engine
                .advance("1", AdvanceRequest::by(Actor::Agent))
                .expect("advance"),
            AdvanceOutcome::Terminal {
                stage: "accept".to_string()
            }
        );
        engine.archive("1").expect("archive");
        assert!(fx.store.is_archived("1").expect("archived"));
    }

    #[test]
    fn transition_action_advances_auto_stages() {
        let fx = fixture();
        fx.create("1", "backlog");
        fx.create("2", "plan");
        let mut action = TransitionAction::new(fx.engine());
        let notes = action
            .run(&TickContext {
                now: Utc::now(),
                tick: 1,
            })
            .expect("tick");
        assert_eq!(notes, vec!["1: backlog -> plan".to_string()]);
        assert_eq!(fx.store.read("2").expect("read").stage, "plan");
    }

    #[test]
    fn output_artifact_is_checked_before_exit_hooks() {
        let registry = sample_registry();
        let plan = registry.stage("plan").expect("plan");
        assert!(matches!(
            plan.exit_hooks().first(),
            Some(HookSpec::ArtifactExists { path, .. }) if path == "plan.md"
        ));
    }
}
