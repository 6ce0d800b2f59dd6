//! Public API of the consent gate.
//!
//! [`gate::GateApiService`] is the single entry point for hosts and user
//! interfaces; [`types`] holds the request and response types of every
//! service in the stack.

pub mod gate;
pub mod types;

// Re-export all types for convenience
pub use types::*;
