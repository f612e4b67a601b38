/// The command finished without problems.
pub const NO_ERROR: i32 = 0;

/// The command finished, but detected problems (e.g. failed checks).
pub const NON_FATAL_ERROR: i32 = 1;

/// The command couldn't finish.
pub const FATAL_ERROR: i32 = 2;
