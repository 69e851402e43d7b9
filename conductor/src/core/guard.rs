//! Loop bounds for redirect cycles.
//!
//! Both the iteration-count hook and `redirect_and_return` rely on counts
//! derived from durable state (history events or produced artifacts), never
//! on in-memory counters.

use regex::Regex;

use crate::core::types::{EventKind, HistoryEvent};

/// Number of redirect events recorded from `from` to `to`.
pub fn redirect_count(history: &[HistoryEvent], from: &str, to: &str) -> u32 {
    history
        .iter()
        .filter(|event| event.kind == EventKind::Redirect && event.from == from && event.to == to)
        .count() as u32
}

/// Outcome of checking a redirect against its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectBudget {
    /// Redirect allowed; this will be redirect number `next`.
    Allowed { next: u32 },
    /// `max` redirects already happened; another one must hard-fail.
    Exhausted { count: u32 },
}

pub fn redirect_budget(history: &[HistoryEvent], from: &str, to: &str, max: u32) -> RedirectBudget {
    let count = redirect_count(history, from, to);
    if count >= max {
        RedirectBudget::Exhausted { count: count + 1 }
    } else {
        RedirectBudget::Allowed { next: count + 1 }
    }
}

/// Count names matching an artifact-version pattern such as `^review-v\d+\.md$`.
pub fn count_artifacts<'a>(names: impl IntoIterator<Item = &'a str>, pattern: &Regex) -> u32 {
    names.into_iter().filter(|name| pattern.is_match(name)).count() as u32
}
