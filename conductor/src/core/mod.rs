//! Deterministic, pure logic shared by the conductor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod fault;
pub mod guard;
pub mod hooks;
pub mod naming;
pub mod registry;
pub mod types;
