//! Stable exit codes for `shipper` commands.

use crate::core::types::ExecutionStatus;

/// Command succeeded or the execution COMPLETED.
pub const OK: i32 = 0;
/// Invalid input, layout or config, or any other error.
pub const INVALID: i32 = 1;
/// The execution FAILED.
pub const FAILED: i32 = 2;
/// The execution was ABORTED (fatal violation or cancellation).
pub const ABORTED: i32 = 3;
/// Another execution holds the project lock.
pub const BUSY: i32 = 4;

pub fn for_status(status: ExecutionStatus) -> i32 {
    match status {
        ExecutionStatus::Completed => OK,
        ExecutionStatus::Failed => FAILED,
        ExecutionStatus::Aborted => ABORTED,
        ExecutionStatus::Running => INVALID,
    }
}
