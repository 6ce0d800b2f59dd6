//! Capabilities injected into the consent services: time, timers, storage
//! and the per-service load strategies.

pub mod clock;
pub mod integration;
pub mod scheduler;
pub mod storage;
