//! Stable exit codes for the `scientist` binary.

/// The pipeline ran to completion and teardown finished.
pub const OK: i32 = 0;
/// A phase failed (configuration, idea loading, delegate error, missing review
/// artifact). Teardown still ran before exiting.
pub const FAILED: i32 = 1;
