//! Internal services composed by the gate API.
//!
//! - **Store**: validated persistence of the consent envelope and prompt history
//! - **Audit**: append-only trail of consent transitions
//! - **Rate limit**: sliding-window throttle on consent updates
//! - **Orchestrator**: consent-driven loading and teardown of third-party services

pub mod audit;
pub mod orchestrator;
pub mod rate_limit;
pub mod store;
