//! Stable exit codes for speckit CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, config, or a collaborator/persistence error.
pub const INVALID: i32 = 1;
/// A workflow or pipeline step finished as failed.
pub const WORKFLOW_FAILED: i32 = 2;
/// A workflow was cancelled, usually by Ctrl-C.
pub const CANCELLED: i32 = 3;
