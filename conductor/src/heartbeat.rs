//! Heartbeat Scheduler: a single-threaded loop running tick actions in order.
//!
//! Each tick runs to completion before the next begins. Actions are injected,
//! so a test drives the controller by calling [`Heartbeat::tick`] directly.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, info_span, warn};

use crate::io::store::{StateStore, StoreError};

/// What every action sees for the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickContext {
    pub now: DateTime<Utc>,
    pub tick: u64,
}

/// One step of controller work per tick.
pub trait TickAction {
    fn name(&self) -> &str;

    /// Returns human-readable notes. An error aborts the remaining actions of this tick.
    fn run(&mut self, ctx: &TickContext) -> Result<Vec<String>>;
}

/// Notes produced by one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReport {
    pub action: String,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub actions: Vec<ActionReport>,
    /// Action that failed and the error; later actions did not run.
    pub aborted: Option<(String, String)>,
}

impl TickReport {
    pub fn notes(&self) -> impl Iterator<Item = &str> {
        self.actions
            .iter()
            .flat_map(|report| report.notes.iter().map(String::as_str))
    }
}

pub struct Heartbeat<'a> {
    interval: Duration,
    actions: Vec<Box<dyn TickAction + 'a>>,
    ticks: u64,
}

impl<'a> Heartbeat<'a> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            actions: Vec::new(),
            ticks: 0,
        }
    }

    /// Append an action; actions run in the order they were added.
    pub fn with_action(mut self, action: impl TickAction + 'a) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    /// Run every action once, stopping at the first error.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        self.ticks += 1;
        let ctx = TickContext {
            now,
            tick: self.ticks,
        };
        let span = info_span!("tick", tick = ctx.tick);
        let _guard = span.enter();

        let mut report = TickReport {
            tick: ctx.tick,
            actions: Vec::new(),
            aborted: None,
        };
        for action in &mut self.actions {
            let name = action.name().to_string();
            match action.run(&ctx) {
                Ok(notes) => {
                    debug!(action = %name, notes = notes.len(), "action finished");
                    report.actions.push(ActionReport {
                        action: name,
                        notes,
                    });
                }
                Err(err) => {
                    error!(action = %name, err = %format!("{err:#}"), "tick aborted");
                    report.aborted = Some((name, format!("{err:#}")));
                    break;
                }
            }
        }
        report
    }

    /// Tick every interval until `max_ticks` ticks ran (forever when `None`).
    pub fn run(&mut self, max_ticks: Option<u64>) {
        if max_ticks == Some(0) {
            return;
        }
        info!(interval_secs = self.interval.as_secs(), "heartbeat started");
        let mut remaining = max_ticks;
        loop {
            let report = self.tick(Utc::now());
            for note in report.notes() {
                info!(tick = report.tick, "{note}");
            }
            if let Some((action, err)) = &report.aborted {
                warn!(tick = report.tick, action = %action, err = %err, "tick incomplete");
            }
            if let Some(left) = remaining.as_mut() {
                *left = left.saturating_sub(1);
                if *left == 0 {
                    break;
                }
            }
            thread::sleep(self.interval);
        }
    }
}

/// Pull and push the State Store. Exhausted retries abort the tick.
pub struct SyncAction<'a, S: StateStore> {
    store: &'a S,
}

impl<'a, S: StateStore> SyncAction<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }
}

impl<S: StateStore> TickAction for SyncAction<'_, S> {
    fn name(&self) -> &str {
        "sync"
    }

    fn run(&mut self, _ctx: &TickContext) -> Result<Vec<String>> {
        match self.store.sync() {
            Ok(report) if report.attempts > 1 => Ok(vec![format!(
                "synced after {} attempts",
                report.attempts
            )]),
            Ok(_) => Ok(Vec::new()),
            Err(err @ StoreError::SyncConflict { .. }) => Err(err.into()),
            Err(err) => Err(anyhow::Error::new(err).context("sync state store")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use anyhow::bail;

    use super::*;

    struct Recorder {
        name: &'static str,
        log: Rc<RefCell<Vec<String>>>,
        fail: bool,
    }

    impl TickAction for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn run(&mut self, ctx: &TickContext) -> Result<Vec<String>> {
            self.log
                .borrow_mut()
                .push(format!("{}#{}", self.name, ctx.tick));
            if self.fail {
                bail!("{} broke", self.name);
            }
            Ok(vec![format!("{} ok", self.name)])
        }
    }

    fn recorder(name: &'static str, log: &Rc<RefCell<Vec<String>>>, fail: bool) -> Recorder {
        Recorder {
            name,
            log: Rc::clone(log),
            fail,
        }
    }

    #[test]
    fn actions_run_in_order_each_tick() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut heartbeat = Heartbeat::new(Duration::from_secs(60))
            .with_action(recorder("sync", &log, false))
            .with_action(recorder("repair", &log, false));
        let first = heartbeat.tick(Utc::now());
        heartbeat.tick(Utc::now());
        assert_eq!(
            *log.borrow(),
            vec!["sync#1", "repair#1", "sync#2", "repair#2"]
        );
        assert_eq!(first.notes().collect::<Vec<_>>(), vec!["sync ok", "repair ok"]);
        assert_eq!(first.aborted, None);
    }

    #[test]
    fn failing_action_aborts_rest_of_tick() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut heartbeat = Heartbeat::new(Duration::from_secs(60))
            .with_action(recorder("sync", &log, true))
            .with_action(recorder("repair", &log, false));
        let report = heartbeat.tick(Utc::now());
        assert_eq!(*log.borrow(), vec!["sync#1"]);
        assert_eq!(
            report.aborted,
            Some(("sync".to_string(), "sync broke".to_string()))
        );
    }

    #[test]
    fn run_stops_after_max_ticks() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut heartbeat =
            Heartbeat::new(Duration::from_millis(1)).with_action(recorder("sync", &log, false));
        heartbeat.run(Some(3));
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn zero_ticks_runs_nothing() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut heartbeat =
            Heartbeat::new(Duration::from_millis(1)).with_action(recorder("sync", &log, false));
        heartbeat.run(Some(0));
        assert!(log.borrow().is_empty());
    }
}
