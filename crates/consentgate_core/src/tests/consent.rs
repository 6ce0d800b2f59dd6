use chrono::{Months, TimeDelta, Utc};
use tower::Service;

use super::fixtures::Harness;
use crate::gate::{
    api::{ConsentEvent, GateRequest, GateResponse},
    config::GateConfig,
    core::{
        fatigue::PromptHistory,
        record::{ConsentCategory, ConsentChoice, ConsentFlags, ConsentRecord, ConsentSource},
    },
    error::{ConsentError, StoreError},
    infrastructure::storage::{MemoryStorage, StorageBackend},
    services::{
        audit::{AuditAction, RequestMetadata},
        orchestrator::ServiceStatus,
    },
};

#[tokio::test(start_paused = true)]
async fn integration_fresh_user_accepts_everything() {
    crate::gate_tracing::init();
    let Harness { mut gate, jar, .. } = Harness::new();

    assert!(should_show_banner!(gate));
    for category in ConsentCategory::OPTIONAL {
        assert!(!consent_status!(gate, category));
    }
    assert!(consent_status!(gate, ConsentCategory::Necessary));

    let outcome = update_consent!(gate, ConsentChoice::accept_all(), ConsentSource::Banner);
    assert!(outcome.persisted());
    assert_eq!(outcome.record.flags(), ConsentFlags::all());
    for category in ConsentCategory::ALL {
        assert!(consent_status!(gate, category));
    }

    let status = service_status!(gate);
    assert_eq!(status.len(), 9);
    for (id, state) in &status {
        assert_eq!(state.status, ServiceStatus::Loaded, "{id}: {state:?}");
        assert_eq!(jar.count(id), 2);
    }
    assert!(!should_show_banner!(gate));
}

#[tokio::test(start_paused = true)]
async fn integration_withdraw_single_category() {
    let Harness { mut gate, jar, .. } = Harness::new();
    update_consent!(gate, ConsentChoice::accept_all());

    update_consent!(gate, ConsentChoice::custom(false, true, true));

    let status = service_status!(gate);
    for id in ["google-analytics", "hotjar"] {
        assert_status!(status, id, ServiceStatus::Disabled);
        assert_eq!(jar.count(id), 0);
    }
    for id in ["tag-manager", "facebook-pixel", "google-ads", "recommendations", "saved-searches"] {
        assert_status!(status, id, ServiceStatus::Loaded);
        assert_eq!(jar.count(id), 2);
    }
    assert!(!consent_status!(gate, ConsentCategory::Analytics));
    assert!(consent_status!(gate, ConsentCategory::Marketing));
}

#[tokio::test(start_paused = true)]
async fn integration_withdraw_everything() {
    let Harness { mut gate, jar, storage, .. } = Harness::new();
    let granted = update_consent!(gate, ConsentChoice::accept_all()).record;

    let GateResponse::Events(mut events) = gate.call(GateRequest::Subscribe).await.unwrap() else {
        panic!("Expected Events");
    };
    let outcome = withdraw_consent!(gate, Some("changed my mind".to_string()));

    assert!(outcome.record.flags().declines_everything());
    assert_ne!(outcome.record.version(), granted.version());
    assert_eq!(
        events.try_recv().unwrap(),
        ConsentEvent::Changed { record: outcome.record.clone(), source: ConsentSource::Settings }
    );
    assert!(matches!(
        events.try_recv().unwrap(),
        ConsentEvent::Withdrawn { reason: Some(reason), .. } if reason == "changed my mind"
    ));

    let status = service_status!(gate);
    for (id, state) in &status {
        if ["session", "consent-log"].contains(&id.as_str()) {
            assert_eq!(state.status, ServiceStatus::Loaded);
        } else {
            assert_eq!(state.status, ServiceStatus::Disabled, "{id}");
            assert_eq!(jar.count(id), 0);
        }
    }

    let history = consent_history!(gate, None);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].action, AuditAction::Withdrawn);
    assert_eq!(history[1].action, AuditAction::Granted);

    // The withdrawal is itself a stored decision.
    let stored = storage.get(&GateConfig::default().storage_key).unwrap().unwrap();
    assert!(stored.contains("\"analytics\":false"));
}

#[tokio::test(start_paused = true)]
async fn integration_stored_consent_expires_once() {
    let now = Utc::now();
    let storage = MemoryStorage::new();
    let granted_at = now.checked_sub_months(Months::new(25)).unwrap();
    let record = ConsentRecord::grant(ConsentChoice::accept_all(), granted_at, "1.0", 24);
    let key = GateConfig::default().storage_key;
    storage.set(&key, &serde_json::to_string(&record.to_envelope()).unwrap()).unwrap();

    let Harness { mut gate, .. } = Harness::builder().storage(storage.clone()).now(now).build();

    assert!(!consent_status!(gate, ConsentCategory::Analytics));
    assert!(!consent_status!(gate, ConsentCategory::Marketing));
    assert!(should_show_banner!(gate));
    assert_eq!(storage.get(&key).unwrap(), None);

    let history = consent_history!(gate, None);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, AuditAction::Expired);
    assert_eq!(history[0].consent, ConsentFlags::all());

    let status = service_status!(gate);
    assert_status!(status, "google-analytics", ServiceStatus::Pending);
    assert_status!(status, "session", ServiceStatus::Loaded);
}

#[tokio::test(start_paused = true)]
async fn integration_consent_expires_during_session() {
    let Harness { mut gate, clock, jar, .. } = Harness::new();
    update_consent!(gate, ConsentChoice::accept_all());
    let GateResponse::Events(mut events) = gate.call(GateRequest::Subscribe).await.unwrap() else {
        panic!("Expected Events");
    };

    clock.advance(TimeDelta::days(800));
    let GateResponse::Consent(current) = gate.call(GateRequest::GetConsent).await.unwrap() else {
        panic!("Expected Consent");
    };
    assert_eq!(current, None);
    assert!(matches!(
        events.try_recv().unwrap(),
        ConsentEvent::Changed { source: ConsentSource::Expiry, record } if record.granted_at().is_none()
    ));

    let history = consent_history!(gate, None);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].action, AuditAction::Expired);

    let status = service_status!(gate);
    assert_status!(status, "hotjar", ServiceStatus::Disabled);
    assert_eq!(jar.count("hotjar"), 0);

    // Expiry is observed once.
    gate.call(GateRequest::GetConsent).await.unwrap();
    assert_eq!(consent_history!(gate, None).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn integration_update_rate_limit() {
    let Harness { mut gate, .. } = Harness::new();
    for _ in 0..10 {
        update_consent!(gate, ConsentChoice::accept_all());
    }

    let error = gate
        .call(GateRequest::UpdateConsent {
            choice: ConsentChoice::decline_all(),
            source: ConsentSource::Settings,
            metadata: RequestMetadata::default(),
        })
        .await
        .unwrap_err();
    assert!(matches!(error, ConsentError::RateLimitExceeded { limit: 10, window_secs: 3600, .. }));

    assert_eq!(consent_history!(gate, None).len(), 10);
    assert!(consent_status!(gate, ConsentCategory::Marketing));
}

#[tokio::test(start_paused = true)]
async fn integration_rate_limit_survives_restart() {
    let storage = MemoryStorage::new();
    for _ in 0..10 {
        let Harness { mut gate, .. } = Harness::builder().storage(storage.clone()).build();
        update_consent!(gate, ConsentChoice::accept_all());
    }

    let Harness { mut gate, .. } = Harness::builder().storage(storage.clone()).build();
    let error = gate
        .call(GateRequest::WithdrawConsent { reason: None, metadata: RequestMetadata::default() })
        .await
        .unwrap_err();
    assert!(matches!(error, ConsentError::RateLimitExceeded { limit: 10, .. }));
    assert_eq!(consent_history!(gate, None).len(), 10);
    assert!(consent_status!(gate, ConsentCategory::Analytics));

    // Another identity sharing the storage has its own window.
    let Harness { gate: mut other, .. } = Harness::builder().storage(storage).subject("dave").build();
    update_consent!(other, ConsentChoice::decline_all());
}

#[tokio::test(start_paused = true)]
async fn integration_identical_updates_are_both_audited() {
    let Harness { mut gate, jar, .. } = Harness::new();
    let first = update_consent!(gate, ConsentChoice::custom(true, false, false));
    let second = update_consent!(gate, ConsentChoice::custom(true, false, false));

    assert_eq!(first.record.flags(), second.record.flags());
    // Same instant on the manual clock, still distinct versions.
    assert!(second.record.revision() > first.record.revision());
    let history = consent_history!(gate, None);
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|entry| entry.action == AuditAction::Granted));
    assert_eq!(jar.count("google-analytics"), 2);
    assert_status!(service_status!(gate), "google-analytics", ServiceStatus::Loaded);
}

#[tokio::test(start_paused = true)]
async fn integration_store_failure_keeps_consent_in_memory() {
    let storage = MemoryStorage::new().with_quota(64);
    let Harness { mut gate, .. } = Harness::builder().storage(storage.clone()).build();

    let outcome = update_consent!(gate, ConsentChoice::custom(true, false, true));
    assert!(!outcome.persisted());
    assert!(matches!(outcome.store_error, Some(StoreError::QuotaExceeded { .. })));

    assert!(consent_status!(gate, ConsentCategory::Analytics));
    assert!(!consent_status!(gate, ConsentCategory::Marketing));
    assert_status!(service_status!(gate), "recommendations", ServiceStatus::Loaded);
    assert_eq!(consent_history!(gate, None).len(), 1);

    // Nothing reached storage, so a new session starts undecided.
    let Harness { gate: mut next, .. } = Harness::builder().storage(storage).build();
    assert!(!consent_status!(next, ConsentCategory::Analytics));
}

#[tokio::test(start_paused = true)]
async fn integration_consent_survives_restart() {
    let storage = MemoryStorage::new();
    let Harness { mut gate, .. } = Harness::builder().storage(storage.clone()).subject("alice").build();
    let granted = update_consent!(gate, ConsentChoice::custom(false, true, false));

    let Harness { gate: mut restarted, .. } =
        Harness::builder().storage(storage).subject("alice").build();
    let GateResponse::Consent(Some(restored)) = restarted.call(GateRequest::GetConsent).await.unwrap()
    else {
        panic!("Expected stored consent");
    };
    assert_eq!(restored, granted.record);
    assert_status!(service_status!(restarted), "google-ads", ServiceStatus::Loaded);
    assert_status!(service_status!(restarted), "hotjar", ServiceStatus::Pending);
    assert_eq!(consent_history!(restarted, Some("alice".to_string())).len(), 1);
    assert!(consent_history!(restarted, None).is_empty());
}

#[tokio::test(start_paused = true)]
async fn integration_banner_fatigue() {
    let config = GateConfig::default()
        .with_fatigue(std::time::Duration::from_secs(3600), std::time::Duration::from_secs(86400));
    let Harness { mut gate, clock, storage, .. } = Harness::builder().config(config.clone()).build();

    assert!(should_show_banner!(gate));
    gate.call(GateRequest::RecordBannerShown).await.unwrap();
    assert!(!should_show_banner!(gate));
    clock.advance(TimeDelta::hours(2));
    assert!(should_show_banner!(gate));

    update_consent!(gate, ConsentChoice::decline_all(), ConsentSource::Banner);
    let history: PromptHistory =
        serde_json::from_str(&storage.get(&config.history_key).unwrap().unwrap()).unwrap();
    assert_eq!(history.show_count, 1);
    assert_eq!(history.rejections, 1);
    // A decision, even a refusal, stops the prompt until it expires.
    assert!(!should_show_banner!(gate));
}

#[tokio::test(start_paused = true)]
async fn integration_export_history() {
    let Harness { mut gate, .. } = Harness::builder().subject("bob").build();
    gate.call(GateRequest::UpdateConsent {
        choice: ConsentChoice::accept_all(),
        source: ConsentSource::Api,
        metadata: RequestMetadata {
            ip_address: Some("203.0.113.7".to_string()),
            user_agent: Some("curl/8.5".to_string()),
        },
    })
    .await
    .unwrap();

    let GateResponse::Export(json) =
        gate.call(GateRequest::ExportConsentHistory(Some("bob".to_string()))).await.unwrap()
    else {
        panic!("Expected Export");
    };
    let entries: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(entries.as_array().unwrap().len(), 1);
    assert_eq!(entries[0]["ipAddress"], "203.0.113.7");
    assert_eq!(entries[0]["userAgent"], "curl/8.5");
    assert_eq!(entries[0]["action"], "GRANTED");
}
