//! The phaseguard engine.
//!
//! Ties the component crates together behind one entry point per operation.
//! [`EngineHandle`] serializes access to a run through its lock, folds new
//! evidence and review feedback into session state, routes it, and applies
//! the activation-hash guard before every save. [`bundle`] covers the
//! engine-level bundle lifecycle, which belongs to no run.
//!
//! Every operation answers with an [`OutputEnvelope`]: a status, the phase
//! and gate, at most one primary reason code, and exactly one next action.

pub mod bundle;
pub mod envelope;
pub mod error;
pub mod handle;
pub mod integrity;

pub use bundle::{ActivationReport, RollbackReport, activate_bundle, rollback_engine};
pub use envelope::{EnvelopeStatus, MAX_FIELD_CHARS, NextAction, NextActionKind, OutputEnvelope, bound};
pub use error::EngineError;
pub use handle::{EngineHandle, OperationReport, derive_mode};
pub use integrity::{StateSmokeTest, guard_session, state_schema_flag};
