//! Exit code constants for phaseguard.
//!
//! # Exit Code Table
//!
//! | Code | Constant | Description |
//! |------|----------|-------------|
//! | 0 | `SUCCESS` | Decision produced, no block |
//! | 1 | `INTERNAL` | Internal failure or contract violation |
//! | 2 | `CLI_ARGS` | Invalid CLI arguments or configuration |
//! | 3 | `BLOCKED` | Engine returned a `BLOCKED-*` decision |
//! | 4 | `NEEDS_HUMAN` | Terminal needs-human state |
//! | 9 | `LOCK_HELD` | Another process holds the session lock |
//! | 11 | `INTEGRITY` | Hash mismatch or engine rollback performed |

/// Exit codes matching the documented exit code table.
///
/// The numeric values are part of the public API and will not change in 1.x
/// releases.
///
/// ```rust
/// use phaseguard_utils::exit_codes::ExitCode;
///
/// assert_eq!(ExitCode::BLOCKED.as_i32(), 3);
/// assert_eq!(ExitCode::from_i32(9), ExitCode::LOCK_HELD);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(i32);

impl ExitCode {
    /// Success - a decision was produced without a block
    pub const SUCCESS: ExitCode = ExitCode(0);

    /// Internal error - general failure
    pub const INTERNAL: ExitCode = ExitCode(1);

    /// CLI arguments error - invalid arguments or configuration
    pub const CLI_ARGS: ExitCode = ExitCode(2);

    /// Blocked - the engine refused with a `BLOCKED-*` reason code
    pub const BLOCKED: ExitCode = ExitCode(3);

    /// Needs human - the workflow is parked awaiting an operator
    pub const NEEDS_HUMAN: ExitCode = ExitCode(4);

    /// Lock held - another process is working on the same session
    pub const LOCK_HELD: ExitCode = ExitCode(9);

    /// Integrity - unexplained hash change or a rollback was performed
    pub const INTEGRITY: ExitCode = ExitCode(11);

    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn from_i32(code: i32) -> Self {
        ExitCode(code)
    }

    /// Stable lowercase name used in the output envelope.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self.0 {
            0 => "success",
            2 => "cli_args",
            3 => "blocked",
            4 => "needs_human",
            9 => "lock_held",
            11 => "integrity",
            _ => "internal",
        }
    }
}

impl From<i32> for ExitCode {
    fn from(code: i32) -> Self {
        ExitCode(code)
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.0
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
