//! Work-item pipeline controller.
//!
//! Work items move through named stages of a flow. Every move runs the
//! stage's hooks, is written with an optimistic version check and is
//! recorded in the item's append-only history. A single-threaded heartbeat
//! keeps the store synced, watches session output for fleet-wide faults,
//! advances items that need no agent and converges sessions and
//! environments onto what each item's stage declares.
//!
//! - **[`core`]**: pure logic (data model, registry, hook evaluation,
//!   naming, fault parsing). No I/O.
//! - **[`io`]**: side effects (config, git, processes, the filesystem store,
//!   hook execution, environment and session runtimes).
//!
//! Orchestration modules ([`engine`], [`reconcile`], [`health`],
//! [`heartbeat`]) combine the two behind trait seams so tests can swap in
//! fakes.

pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod health;
pub mod heartbeat;
pub mod io;
pub mod logging;
pub mod reconcile;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
