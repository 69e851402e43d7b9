//! Work-item document model shared by every layer.
//!
//! A [`WorkItem`] is owned by the State Store and only mutated through its
//! version-checked write path. Fields the system does not know about are
//! kept in the `extra` map of whichever object carries them and written back
//! in their original order, after the known fields.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One unit of work moving through a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substage: Option<String>,
    pub flow: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Ids that must reach a terminal stage before this item leaves its first stage.
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Optimistic-concurrency counter, bumped by exactly one per store write.
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<String>,
    /// Set while a transition is halted on a `human_review` destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<PendingReview>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approvals: Vec<Approval>,
    #[serde(default, skip_serializing_if = "RuntimeRecord::is_empty")]
    pub runtime: RuntimeRecord,
    /// Append-only audit trail.
    #[serde(default)]
    pub history: Vec<HistoryEvent>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkItem {
    /// Build a fresh backlog item. The store assigns `version` on create.
    pub fn new(id: impl Into<String>, flow: impl Into<String>, stage: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            stage: stage.into(),
            substage: None,
            flow: flow.into(),
            priority: 0,
            labels: Vec::new(),
            dependencies: Vec::new(),
            created: now,
            updated: now,
            version: 0,
            pull_request: None,
            review: None,
            approvals: Vec::new(),
            runtime: RuntimeRecord::default(),
            history: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn position(&self) -> Position {
        Position {
            stage: self.stage.clone(),
            substage: self.substage.clone(),
        }
    }

    /// True when an approval for entering `stage` has been recorded and not yet consumed.
    pub fn is_approved_for(&self, stage: &str) -> bool {
        self.approvals.iter().any(|approval| approval.stage == stage)
    }
}

/// A stage plus optional substage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub stage: String,
    pub substage: Option<String>,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.substage {
            Some(substage) => write!(f, "{}/{}", self.stage, substage),
            None => f.write_str(&self.stage),
        }
    }
}

/// Who triggered a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Agent,
    Controller,
    Human,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Actor::Agent => "agent",
            Actor::Controller => "controller",
            Actor::Human => "human",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Transition,
    Redirect,
    AwaitingApproval,
    Approval,
    EntryHookWarning,
    Runtime,
    Update,
}

/// Immutable audit record appended by every store write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_substage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_substage: Option<String>,
    pub actor: Actor,
    /// Document version produced by the write that appended this event.
    #[serde(default)]
    pub version: u64,
    /// Identifies the transition (and therefore the hook set) this event completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HistoryEvent {
    pub fn new(kind: EventKind, from: &Position, to: &Position, actor: Actor) -> Self {
        Self {
            at: Utc::now(),
            kind,
            from: from.stage.clone(),
            to: to.stage.clone(),
            from_substage: from.substage.clone(),
            to_substage: to.substage.clone(),
            actor,
            version: 0,
            key: None,
            hooks: Vec::new(),
            note: None,
            extra: Map::new(),
        }
    }

    /// Event that leaves the position unchanged (approvals, runtime bookkeeping, warnings).
    pub fn in_place(kind: EventKind, at: &Position, actor: Actor) -> Self {
        Self::new(kind, at, at, actor)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_hooks(mut self, hooks: Vec<HookRecord>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    Exit,
    Entry,
}

/// Outcome of a single hook as stored in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookRecord {
    pub phase: HookPhase,
    pub hook: String,
    pub outcome: HookOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HookRecord {
    pub fn new(phase: HookPhase, hook: impl Into<String>, outcome: HookOutcome) -> Self {
        Self {
            phase,
            hook: hook.into(),
            outcome,
            detail: None,
            extra: Map::new(),
        }
    }

    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookOutcome {
    Pass,
    Fail,
    Redirect,
    Tripped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReview {
    pub target: String,
    pub since: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub stage: String,
    pub actor: Actor,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Live session/environment bookkeeping for an active work item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeRecord {
    /// Stage whose runtime declaration the handles were started from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentHandle>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<SessionHandle>,
    /// Manually stopped; drift repair leaves it down until the next explicit start.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stopped: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RuntimeRecord {
    pub fn is_empty(&self) -> bool {
        self.stage.is_none()
            && self.environment.is_none()
            && self.sessions.is_empty()
            && !self.stopped
            && self.extra.is_empty()
    }

    /// True if anything is still recorded as running.
    pub fn any_live(&self) -> bool {
        self.environment.as_ref().is_some_and(|env| env.live)
            || self.sessions.iter().any(|session| session.live)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    pub name: String,
    pub live: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<String>,
    /// Names of the sessions this environment owns.
    #[serde(default)]
    pub sessions: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub name: String,
    pub role: String,
    pub live: bool,
    /// Owning environment; `None` means the session runs on the controller host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_survive_a_rewrite_in_order() {
        let raw = r#"{
  "id": "42",
  "stage": "plan",
  "flow": "default",
  "priority": 1,
  "labels": [],
  "dependencies": [],
  "created": "2026-01-01T00:00:00Z",
  "updated": "2026-01-01T00:00:00Z",
  "version": 3,
  "history": [],
  "zeta": {
    "nested": true
  },
  "alpha": "kept"
}"#;
        let item: WorkItem = serde_json::from_str(raw).expect("parse");
        let keys: Vec<&str> = item.extra.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);

        let written = serde_json::to_string_pretty(&item).expect("serialize");
        assert_eq!(written, raw);
    }

    #[test]
    fn unknown_fields_inside_nested_objects_survive() {
        let raw = r#"{
  "id": "7",
  "stage": "review",
  "flow": "default",
  "priority": 0,
  "labels": [],
  "dependencies": [],
  "created": "2026-01-01T00:00:00Z",
  "updated": "2026-01-01T00:00:00Z",
  "version": 2,
  "review": {
    "target": "accept",
    "since": "2026-01-01T00:00:00Z",
    "ticket": "OPS-1"
  },
  "runtime": {
    "stage": "review",
    "sessions": [
      {
        "name": "acme-7-reviewer",
        "role": "reviewer",
        "live": true,
        "pane": 2
      }
    ],
    "host": "ci-3"
  },
  "history": [
    {
      "at": "2026-01-01T00:00:00Z",
      "kind": "created",
      "from": "review",
      "to": "review",
      "actor": "human",
      "version": 1,
      "hooks": [
        {
          "phase": "exit",
          "hook": "lint",
          "outcome": "pass",
          "duration_ms": 40
        }
      ],
      "signed_by": "ops-bot"
    }
  ]
}"#;
        let item: WorkItem = serde_json::from_str(raw).expect("parse");
        assert_eq!(item.history[0].extra["signed_by"], "ops-bot");
        assert_eq!(item.runtime.extra["host"], "ci-3");
        assert!(!item.runtime.is_empty());

        let written = serde_json::to_string_pretty(&item).expect("serialize");
        assert_eq!(written, raw);
    }

    #[test]
    fn empty_runtime_record_is_omitted() {
        let item = WorkItem::new("1", "default", "backlog");
        let value = serde_json::to_value(&item).expect("serialize");
        assert!(value.get("runtime").is_none());
        assert!(value.get("substage").is_none());
    }

    #[test]
    fn position_display_includes_substage() {
        let position = Position {
            stage: "implement".to_string(),
            substage: Some("setup".to_string()),
        };
        assert_eq!(position.to_string(), "implement/setup");
    }
}
