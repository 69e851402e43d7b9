//! Stable exit codes for `conductor` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid configuration, missing item or any other error.
pub const INVALID: i32 = 1;
/// An exit hook failed; the item did not move.
pub const REJECTED: i32 = 2;
/// A redirect or iteration limit was exceeded; a human must step in.
pub const ESCALATE: i32 = 3;
/// Another writer won a version race, or the item is blocked by a sync conflict.
pub const CONFLICT: i32 = 4;
/// The item is waiting on an approval or on unfinished dependencies.
pub const WAITING: i32 = 5;
