use std::{hint::black_box, sync::Arc, time::Duration};

use chrono::Utc;
use consentgate_core::gate::{
    api::OrchestratorRequest,
    core::{
        fatigue::{FatiguePolicy, PromptHistory},
        record::{ConsentChoice, ConsentFlags, ConsentRecord, validate},
        registry::ServiceRegistry,
    },
    infrastructure::{
        integration::{CookieJar, Integration, IntegrationSet, NamespacedIntegration},
        scheduler::TokioScheduler,
    },
    services::orchestrator::OrchestratorService,
};
use criterion::{Criterion, criterion_group, criterion_main};
use tower::Service;

fn default_orchestrator() -> OrchestratorService {
    let registry = ServiceRegistry::default_catalog().unwrap();
    let jar = CookieJar::new();
    let mut integrations = IntegrationSet::new();
    for descriptor in registry.iter() {
        let integration: Arc<dyn Integration> = Arc::new(NamespacedIntegration::simulated(
            &descriptor.id,
            jar.clone(),
            Duration::ZERO,
            0,
        ));
        integrations.insert(descriptor.id.clone(), integration);
    }
    OrchestratorService::new(Arc::new(registry), integrations, Arc::new(TokioScheduler))
        .with_health_check_delay(Duration::from_secs(3600))
}

// Record Benchmarks
fn bench_record_validate(c: &mut Criterion) {
    let record = ConsentRecord::grant(ConsentChoice::custom(true, false, true), Utc::now(), "1.0", 24);
    let envelope = serde_json::to_value(record.to_envelope()).unwrap();
    c.bench_function("record_validate_envelope", |b| {
        b.iter(|| black_box(validate(black_box(&envelope))));
    });
}

fn bench_fatigue_should_prompt(c: &mut Criterion) {
    let policy = FatiguePolicy::default();
    let history = PromptHistory { show_count: 7, rejections: 2, last_shown: Some(Utc::now()) };
    c.bench_function("fatigue_should_prompt", |b| {
        b.iter(|| black_box(policy.should_prompt(black_box(&history), None, Utc::now())));
    });
}

// OrchestratorService Benchmarks
fn bench_orchestrator_grant_all(c: &mut Criterion) {
    c.bench_function("orchestrator_grant_all", |b| {
        b.to_async(tokio::runtime::Runtime::new().unwrap()).iter(|| async {
            let mut orchestrator = default_orchestrator();
            let _ = black_box(orchestrator.call(OrchestratorRequest::Boot).await);
            let _ = black_box(orchestrator.call(OrchestratorRequest::ApplyConsent(ConsentFlags::all())).await);
        });
    });
}

fn bench_orchestrator_toggle_category(c: &mut Criterion) {
    c.bench_function("orchestrator_toggle_category", |b| {
        b.to_async(tokio::runtime::Runtime::new().unwrap()).iter(|| async {
            let mut orchestrator = default_orchestrator();
            let _ = orchestrator.call(OrchestratorRequest::ApplyConsent(ConsentFlags::all())).await;
            let _ = black_box(
                orchestrator
                    .call(OrchestratorRequest::ApplyConsent(ConsentFlags::new(false, true, true)))
                    .await,
            );
            let _ = black_box(orchestrator.call(OrchestratorRequest::ApplyConsent(ConsentFlags::all())).await);
        });
    });
}

criterion_group!(record_benches, bench_record_validate, bench_fatigue_should_prompt);
criterion_group!(orchestrator_benches, bench_orchestrator_grant_all, bench_orchestrator_toggle_category);
criterion_main!(record_benches, orchestrator_benches);
