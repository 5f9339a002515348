//! Persistence policy.
//!
//! [`decide`] answers "may this artifact be written now?" from the artifact
//! kind, the current phase, the execution mode, the governing gate and any
//! operator confirmation. [`GuardedWriter`] is the only code path that
//! performs durable writes and it re-asks the question itself.

pub mod decision;
pub mod writer;

pub use decision::{
    ArtifactClass, ArtifactKind, CONFIRMATION_FIELD, CONFIRMATION_PHRASE, GovernedRun,
    PersistenceDecision, PersistenceRequest, Verdict, decide, is_confirmed,
};
pub use writer::{GuardedWriter, PolicyError, WriteContext, artifact_path};
