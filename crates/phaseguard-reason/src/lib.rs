//! Reason code registry.
//!
//! [`ReasonCode`] is the closed set of codes the engine can emit. The
//! [`ReasonRegistry`] pairs each code with its required payload fields and
//! the recovery guidance rendered into every refusal.

pub mod code;
pub mod registry;

pub use code::{Category, ReasonCode};
pub use registry::{
    BUILTIN_REGISTRY, PayloadProblem, ReasonEmission, ReasonPayload, ReasonRegistry, ReasonSpec,
    RegistryError, RenderContext, payload_of,
};
