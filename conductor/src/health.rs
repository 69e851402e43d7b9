//! Health/Fault Monitor.
//!
//! Scans live session output for the configured fault signature. A hit in any
//! one session switches every live session into the degraded mode and opens a
//! [`RateLimitWindow`]; once the resume time plus buffer has passed, the
//! switched sessions go back to their original mode and the window is removed.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use tracing::{debug, error, info, instrument, warn};

use crate::core::fault::{RateLimitWindow, SwitchedSession, detect};
use crate::heartbeat::{TickAction, TickContext};
use crate::io::config::{ConductorConfig, FaultConfig};
use crate::io::degraded::{delete_window, load_window, write_window};
use crate::io::runtime::SessionRuntime;
use crate::io::store::StateStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// Fault found; the listed sessions were switched to the degraded mode.
    Degraded {
        source: String,
        resume_at: DateTime<Utc>,
        switched: Vec<String>,
    },
    /// Sessions that started while the window was open were switched too.
    Joined(Vec<String>),
    Recovered(Vec<String>),
    /// Some sessions could not be switched back; the window stays open for them.
    RecoveryIncomplete(Vec<String>),
    /// Window still recorded long after its recovery time.
    StaleWindow { resume_at: DateTime<Utc> },
}

impl fmt::Display for HealthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthEvent::Degraded {
                source,
                resume_at,
                switched,
            } => write!(
                f,
                "fault in {source}; {} session(s) degraded until {}",
                switched.len(),
                resume_at.to_rfc3339()
            ),
            HealthEvent::Joined(sessions) => {
                write!(f, "degraded late joiners {}", sessions.join(", "))
            }
            HealthEvent::Recovered(sessions) => {
                write!(f, "recovered {} session(s)", sessions.len())
            }
            HealthEvent::RecoveryIncomplete(sessions) => {
                write!(f, "recovery incomplete for {}", sessions.join(", "))
            }
            HealthEvent::StaleWindow { resume_at } => write!(
                f,
                "degraded-mode record for resume {} is stale",
                resume_at.to_rfc3339()
            ),
        }
    }
}

pub struct HealthMonitor<'a, S: StateStore, R: SessionRuntime> {
    store: &'a S,
    sessions: &'a R,
    fault: &'a FaultConfig,
    capture_lines: usize,
    degraded_path: PathBuf,
    pattern: Regex,
}

impl<'a, S: StateStore, R: SessionRuntime> HealthMonitor<'a, S, R> {
    pub fn new(
        store: &'a S,
        sessions: &'a R,
        config: &'a ConductorConfig,
        degraded_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let pattern = Regex::new(&config.fault.pattern)
            .with_context(|| format!("compile fault pattern '{}'", config.fault.pattern))?;
        Ok(Self {
            store,
            sessions,
            fault: &config.fault,
            capture_lines: config.runtime.capture_lines,
            degraded_path: degraded_path.into(),
            pattern,
        })
    }

    fn buffer(&self) -> Duration {
        secs(self.fault.resume_buffer_secs)
    }

    fn switch_keys(&self, mode: &str) -> String {
        self.fault.switch_template.replace("{mode}", mode)
    }

    /// Sessions recorded live on any work item that the runtime still has.
    fn live_sessions(&self) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        for item in self.store.list_all()? {
            for session in item.runtime.sessions.iter().filter(|s| s.live) {
                names.insert(session.name.clone());
            }
        }
        let mut live = Vec::new();
        for name in names {
            if self.sessions.exists(&name)? {
                live.push(name);
            }
        }
        Ok(live)
    }

    /// One monitoring pass.
    #[instrument(skip_all, fields(now = %now))]
    pub fn check(&self, now: DateTime<Utc>) -> Result<Vec<HealthEvent>> {
        match load_window(&self.degraded_path)? {
            None => Ok(self.scan(now)?.into_iter().collect()),
            Some(window) => self.maintain(window, now),
        }
    }

    fn scan(&self, now: DateTime<Utc>) -> Result<Option<HealthEvent>> {
        let live = self.live_sessions()?;
        let fallback = secs(self.fault.default_backoff_secs);
        for session in &live {
            let output = match self.sessions.capture(session, self.capture_lines) {
                Ok(output) => output,
                Err(err) => {
                    warn!(session = %session, err = %format!("{err:#}"), "capture failed");
                    continue;
                }
            };
            let Some(detection) = detect(&self.pattern, &output, now, fallback) else {
                continue;
            };
            if detection.resume_at + self.buffer() <= now {
                debug!(session = %session, matched = %detection.matched, "ignoring expired fault signature");
                continue;
            }
            warn!(session = %session, matched = %detection.matched, resume_at = %detection.resume_at, "fault signature detected");
            let switched = self.switch_to_degraded(&live);
            let window = RateLimitWindow {
                switched,
                detected_at: now,
                resume_at: detection.resume_at,
                source: Some(session.clone()),
            };
            write_window(&self.degraded_path, &window)?;
            return Ok(Some(HealthEvent::Degraded {
                source: session.clone(),
                resume_at: window.resume_at,
                switched: window.switched.into_iter().map(|s| s.session).collect(),
            }));
        }
        Ok(None)
    }

    fn switch_to_degraded(&self, sessions: &[String]) -> Vec<SwitchedSession> {
        let keys = self.switch_keys(&self.fault.degraded_mode);
        sessions
            .iter()
            .filter_map(|session| match self.sessions.send_keys(session, &keys) {
                Ok(()) => Some(SwitchedSession {
                    session: session.clone(),
                    original_mode: self.fault.primary_mode.clone(),
                }),
                Err(err) => {
                    warn!(session = %session, err = %format!("{err:#}"), "switch to degraded mode failed");
                    None
                }
            })
            .collect()
    }

    fn maintain(&self, mut window: RateLimitWindow, now: DateTime<Utc>) -> Result<Vec<HealthEvent>> {
        let mut events = Vec::new();
        if window.is_stale(now, self.buffer(), secs(self.fault.stale_after_secs)) {
            error!(resume_at = %window.resume_at, "degraded-mode record is stale");
            events.push(HealthEvent::StaleWindow {
                resume_at: window.resume_at,
            });
        }

        if window.recovery_due(now, self.buffer()) {
            let mut restored = Vec::new();
            let mut remaining = Vec::new();
            for switched in window.switched {
                if !self.sessions.exists(&switched.session)? {
                    debug!(session = %switched.session, "switched session gone, nothing to restore");
                    continue;
                }
                let keys = self.switch_keys(&switched.original_mode);
                match self.sessions.send_keys(&switched.session, &keys) {
                    Ok(()) => restored.push(switched.session),
                    Err(err) => {
                        warn!(session = %switched.session, err = %format!("{err:#}"), "switch back failed");
                        remaining.push(switched);
                    }
                }
            }
            if remaining.is_empty() {
                delete_window(&self.degraded_path)?;
                info!(sessions = restored.len(), "degraded mode ended");
                events.push(HealthEvent::Recovered(restored));
            } else {
                let pending = remaining.iter().map(|s| s.session.clone()).collect();
                window.switched = remaining;
                write_window(&self.degraded_path, &window)?;
                events.push(HealthEvent::RecoveryIncomplete(pending));
            }
            return Ok(events);
        }

        let known: BTreeSet<&str> = window.switched.iter().map(|s| s.session.as_str()).collect();
        let joiners: Vec<String> = self
            .live_sessions()?
            .into_iter()
            .filter(|session| !known.contains(session.as_str()))
            .collect();
        if !joiners.is_empty() {
            let switched = self.switch_to_degraded(&joiners);
            if !switched.is_empty() {
                let names = switched.iter().map(|s| s.session.clone()).collect();
                window.switched.extend(switched);
                write_window(&self.degraded_path, &window)?;
                events.push(HealthEvent::Joined(names));
            }
        }
        Ok(events)
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

/// Heartbeat action running one monitoring pass.
pub struct HealthAction<'a, S: StateStore, R: SessionRuntime> {
    monitor: HealthMonitor<'a, S, R>,
}

impl<'a, S: StateStore, R: SessionRuntime> HealthAction<'a, S, R> {
    pub fn new(monitor: HealthMonitor<'a, S, R>) -> Self {
        Self { monitor }
    }
}

impl<S: StateStore, R: SessionRuntime> TickAction for HealthAction<'_, S, R> {
    fn name(&self) -> &str {
        "health"
    }

    fn run(&mut self, ctx: &TickContext) -> Result<Vec<String>> {
        Ok(self
            .monitor
            .check(ctx.now)?
            .iter()
            .map(ToString::to_string)
            .collect())
    }
}
