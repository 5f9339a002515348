//! Gate evaluation.
//!
//! Gates are pure functions from session state (plus evidence, for the
//! evidence-backed gates) to a [`GateOutcome`]. Nothing here writes state;
//! the phase router applies outcomes.

pub mod architecture;
pub mod error;
pub mod evidence_gate;
pub mod outcome;

pub use architecture::{ReviewInput, evaluate_architecture};
pub use error::GateError;
pub use evidence_gate::evaluate_evidence_gate;
pub use outcome::{GateCondition, GateOutcome};
