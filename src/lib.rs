//! phaseguard - evidence-gated phase/gate orchestration
//!
//! phaseguard drives a repository workflow through an ordered set of phases.
//! Progress past a gate needs recorded evidence, not narrative: a claim
//! without a fresh, trusted, correctly typed evidence record is
//! `NOT_VERIFIED` and the gate does not approve. Session state is
//! invariant-checked on every load and save, and each run pins the hash of
//! the rule bundle it is governed by, so an unexplained change to the rules
//! blocks the run instead of silently changing what it enforces.
//!
//! phaseguard can be used in two ways:
//! - **CLI**: every command prints one JCS-canonical JSON envelope on stdout
//!   and exits with the code from [`ExitCode`]
//! - **Library**: open an [`EngineHandle`] for a run and call its operations
//!
//! # Quick Start (CLI)
//!
//! ```bash
//! # Start a run from an identity_signal record
//! phaseguard evidence add --repo a1b2c3 --run run-001 identity.json
//!
//! # See where the run is and what it needs next
//! phaseguard status --repo a1b2c3 --run run-001
//!
//! # Submit architecture review feedback
//! phaseguard review --repo a1b2c3 --run run-001 --gate P5-Architecture review.json
//!
//! # Activate a locked rule bundle
//! phaseguard activate --bundle ./bundles/core
//! ```
//!
//! # Quick Start (Library)
//!
//! ```rust,no_run
//! use phaseguard::{Config, EngineHandle, SessionKey};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::builder().build()?;
//! let key = SessionKey::new("a1b2c3", "run-001")?;
//! let handle = EngineHandle::open(config, key)?;
//! let report = handle.status()?;
//! println!("{}", phaseguard::emit_jcs(&report.envelope)?);
//! handle.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Stable Public API
//!
//! - [`EngineHandle`], [`OperationReport`] and [`OutputEnvelope`]
//! - [`Config`], [`ConfigBuilder`] and [`CliArgs`]
//! - [`EngineError`], [`ExitCode`] and [`UserFriendlyError`]
//! - [`PhaseId`], [`GateName`], [`GateStatus`], [`Mode`] and [`SessionKey`]
//! - [`emit_jcs`]
//!
//! Component crates are reachable through hidden module paths and are not
//! covered by semver stability guarantees.

// ============================================================================
// Stable Public API - covered by semver guarantees for 1.x
// ============================================================================

pub use phaseguard_engine::{
    EngineError, EngineHandle, EnvelopeStatus, NextAction, NextActionKind, OperationReport, OutputEnvelope,
    activate_bundle, rollback_engine,
};

pub use phaseguard_config::{CliArgs, Config, ConfigBuilder};

pub use phaseguard_utils::canonicalization::emit_jcs;
pub use phaseguard_utils::error::{ErrorCategory, UserFriendlyError};
pub use phaseguard_utils::exit_codes::ExitCode;
pub use phaseguard_utils::types::{ExecutionMode, GateName, GateStatus, Mode, PhaseId, SessionKey};

// ============================================================================
// Internal modules - not covered by semver
// ============================================================================

#[doc(hidden)]
pub use phaseguard_config as config;
#[doc(hidden)]
pub use phaseguard_engine as engine;
#[doc(hidden)]
pub use phaseguard_evidence as evidence;
#[doc(hidden)]
pub use phaseguard_gate as gate;
#[doc(hidden)]
pub use phaseguard_integrity as integrity;
#[doc(hidden)]
pub use phaseguard_policy as policy;
#[doc(hidden)]
pub use phaseguard_reason as reason;
#[doc(hidden)]
pub use phaseguard_router as router;
#[doc(hidden)]
pub use phaseguard_state as state;
#[doc(hidden)]
pub use phaseguard_utils::{canonicalization, logging, paths, types};

#[cfg(any(test, feature = "test-utils"))]
#[doc(hidden)]
pub use phaseguard_utils::test_support;

// Exported with #[doc(hidden)] to allow white-box testing of CLI parsing
#[doc(hidden)]
pub mod cli;
