//! Consent gate.
//!
//! Keeps one user's consent decision, records every change of it and decides
//! which third-party services may run.
//!
//! ## Architecture
//!
//! ### Gate API
//! Single entry point for hosts and user interfaces: consent queries and
//! updates, banner prompting, service status, audit history and change
//! notifications. It is the only writer of consent and audit state.
//!
//! ### Services
//! - **Store**: validated persistence of the consent envelope, with expiry
//! - **Audit**: append-only, optionally persisted, trail of transitions
//! - **Rate limit**: sliding-window throttle on updates per identity
//! - **Orchestrator**: per-service state machine driven by consent diffs
//!
//! ### Core
//! Pure model code: the consent record and its validation, the service
//! registry and its dependency graph, and the banner fatigue policy.
//!
//! ### Infrastructure
//! Capabilities injected into the services: storage backends, the wall
//! clock, the timer scheduler and per-service integrations.
//!
//! ## Initialization
//!
//! [`init_gate`] wires a [`GateApiDefaultStack`] with the system clock and the
//! tokio scheduler; [`init_gate_with`] accepts both for deterministic tests.
use std::sync::Arc;

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod infrastructure;
pub mod services;

use crate::gate::{
    api::gate::GateApiService,
    config::GateConfig,
    core::registry::ServiceRegistry,
    infrastructure::{
        clock::{Clock, SystemClock},
        integration::IntegrationSet,
        scheduler::{Scheduler, TokioScheduler},
        storage::StorageBackend,
    },
    services::{audit::AuditService, orchestrator::OrchestratorService, store::ConsentStoreService},
};

/// Gate API over the default store, audit and orchestrator services.
pub type GateApiDefaultStack = GateApiService<ConsentStoreService, AuditService, OrchestratorService>;

/// Initialize a consent gate backed by `storage`.
///
/// Consent, prompt history and the audit trail share `storage`, under the
/// slots named in `config`.
pub fn init_gate(
    config: &GateConfig,
    registry: ServiceRegistry,
    integrations: IntegrationSet,
    storage: Arc<dyn StorageBackend>,
) -> GateApiDefaultStack {
    init_gate_with(config, registry, integrations, storage, Arc::new(SystemClock), Arc::new(TokioScheduler))
}

/// Initialize a consent gate with an explicit clock and scheduler.
pub fn init_gate_with(
    config: &GateConfig,
    registry: ServiceRegistry,
    integrations: IntegrationSet,
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
) -> GateApiDefaultStack {
    let store =
        ConsentStoreService::new(storage.clone(), clock.clone(), &config.storage_key, &config.history_key);
    let audit = AuditService::persisted(storage, &config.audit_key);
    let orchestrator = OrchestratorService::new(Arc::new(registry), integrations, scheduler)
        .with_health_check_delay(config.health_check_delay())
        .with_dependency_recheck(config.dependency_recheck_interval(), config.max_dependency_rechecks);
    GateApiService::new(store, audit, orchestrator, clock, config)
}
