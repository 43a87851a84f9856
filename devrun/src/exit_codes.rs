//! Stable exit codes for devrun CLI commands.

/// Command succeeded, or the run finished successfully.
pub const OK: i32 = 0;
/// Invalid input, config or state transition, or any other error.
pub const INVALID: i32 = 1;
/// The run is parked at WAITING_CHECKPOINT.
pub const CHECKPOINT: i32 = 2;
/// The run ended FAILED or CANCELED.
pub const FAILED: i32 = 3;
