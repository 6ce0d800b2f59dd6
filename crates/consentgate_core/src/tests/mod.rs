
mod consent;

use std::sync::Arc;

use tower::Service;

use crate::gate::{
    api::{GateRequest, GateResponse},
    config::GateConfig,
    core::{
        record::{ConsentCategory, ConsentChoice},
        registry::ServiceRegistry,
    },
    infrastructure::{integration::IntegrationSet, storage::MemoryStorage},
    init_gate,
    services::orchestrator::ServiceStatus,
};

#[tokio::test]
async fn integration_init_gate() {
    crate::gate_tracing::init();
    let mut gate = init_gate(
        &GateConfig::default(),
        ServiceRegistry::default_catalog().unwrap(),
        IntegrationSet::new(),
        Arc::new(MemoryStorage::new()),
    );

    assert!(matches!(gate.call(GateRequest::Initialize).await.unwrap(), GateResponse::Ack));
    assert!(matches!(gate.call(GateRequest::Initialize).await.unwrap(), GateResponse::Ack));
    assert!(matches!(gate.call(GateRequest::GetConsent).await.unwrap(), GateResponse::Consent(None)));
    assert!(consent_status!(gate, ConsentCategory::Necessary));
    assert!(!consent_status!(gate, ConsentCategory::Preferences));

    // Without integrations every load fails, and the failure stays contained.
    let status = service_status!(gate);
    assert_eq!(status["session"].status, ServiceStatus::Error);
    assert_eq!(
        status["session"].last_error.as_deref(),
        Some("Consent error, service load failed (service: session, reason: no integration registered)")
    );
    assert_eq!(status["hotjar"].status, ServiceStatus::Pending);

    let outcome = update_consent!(gate, ConsentChoice::decline_all());
    assert!(outcome.persisted());
    assert_eq!(consent_history!(gate, None).len(), 1);
}
