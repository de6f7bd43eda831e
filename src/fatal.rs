//! Hard-exit error type recognized by the top-level entry point.
//!
//! A `FatalError` anywhere in the call chain means the process must
//! terminate with a specific exit code: configuration problems that
//! nothing downstream can recover from (version floor violations, missing
//! prerequisite probes) and fail-fast sub-package failures. `main` downcasts and maps it to
//! `std::process::exit`; everything else unwinds as a normal error.

use std::fmt;

#[derive(Debug)]
pub struct FatalError {
    message: String,
    pub exit_code: i32,
}

impl FatalError {
    /// A fatal error with the default exit code of 1.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: 1,
        }
    }

    /// A fatal error carrying a specific exit code (e.g. a failed
    /// sub-package's status, propagated verbatim).
    pub fn with_code(message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FatalError {}
