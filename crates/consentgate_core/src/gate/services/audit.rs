//! Append-only audit trail of consent transitions.
//!
//! Entries are snapshots: the full flag set, version and expiry of the record
//! at the moment of the transition, plus optional requester metadata. They
//! are never mutated or removed. History is returned newest-first.
//!
//! Appends are not rate limited here; the gate's update path is the only
//! writer and applies the limiter before appending.
use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    task::Poll,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tower::Service;
use tracing::{debug, info, warn};

use crate::gate::{
    api::types::{AuditRequest, AuditResponse},
    core::record::{ConsentFlags, ConsentRecord},
    error::{ConsentError, StoreError},
    infrastructure::storage::{StorageBackend, offload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Granted,
    Withdrawn,
    Expired,
}

/// Who asked for a transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Immutable snapshot of one consent transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Position in the trail, unique across subjects.
    pub sequence: u64,
    /// Owning identity; `None` for anonymous consent.
    pub subject: Option<String>,
    pub consent: ConsentFlags,
    pub version: String,
    pub action: AuditAction,
    #[serde(flatten)]
    pub metadata: RequestMetadata,
    pub timestamp: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

type Trail = DashMap<Option<String>, Vec<AuditEntry>>;

/// Storage slot mirroring the trail. Backend calls run on the blocking pool.
#[derive(Debug, Clone)]
struct Persistence {
    backend: Arc<dyn StorageBackend>,
    key: String,
    /// Orders snapshot-then-write so the slot always ends with the latest trail.
    lock: Arc<Mutex<()>>,
    restored: Arc<OnceCell<()>>,
}

impl Persistence {
    /// An unreadable slot is logged and the trail starts empty; the slot is
    /// only overwritten on the next append.
    fn read(&self) -> Vec<AuditEntry> {
        match self.backend.get(&self.key) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|error| {
                warn!("[audit] persisted trail unreadable, starting empty: {}", error);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(error) => {
                warn!("[audit] persisted trail unavailable, starting empty: {}", error);
                Vec::new()
            }
        }
    }

    fn write(&self, trail: &Trail) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut snapshot: Vec<AuditEntry> =
            trail.iter().flat_map(|entries| entries.value().clone()).collect();
        snapshot.sort_by_key(|entry| entry.sequence);
        let raw = serde_json::to_string(&snapshot)
            .map_err(|error| StoreError::Serialization(error.to_string()))?;
        self.backend.set(&self.key, &raw)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditService {
    entries: Arc<Trail>,
    sequence: Arc<AtomicU64>,
    persistence: Option<Persistence>,
}

impl AuditService {
    /// In-memory trail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trail mirrored into a storage slot, restored from it on first use.
    pub fn persisted(backend: Arc<dyn StorageBackend>, key: &str) -> Self {
        Self {
            persistence: Some(Persistence {
                backend,
                key: key.to_string(),
                lock: Arc::new(Mutex::new(())),
                restored: Arc::new(OnceCell::new()),
            }),
            ..Self::default()
        }
    }

    async fn ensure_restored(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        persistence
            .restored
            .get_or_init(|| async {
                let reader = persistence.clone();
                let restored = offload(move || Ok::<_, StoreError>(reader.read())).await.unwrap_or_else(|error| {
                    warn!("[audit] persisted trail unavailable, starting empty: {}", error);
                    Vec::new()
                });
                debug!("[audit] restored {} entries", restored.len());
                for entry in restored {
                    self.sequence.fetch_max(entry.sequence + 1, Ordering::SeqCst);
                    self.entries.entry(entry.subject.clone()).or_default().push(entry);
                }
            })
            .await;
    }

    async fn append(
        &self,
        subject: Option<String>,
        record: &ConsentRecord,
        action: AuditAction,
        metadata: RequestMetadata,
        at: DateTime<Utc>,
    ) -> AuditEntry {
        let entry = AuditEntry {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            subject: subject.clone(),
            consent: record.flags(),
            version: record.version().to_string(),
            action,
            metadata,
            timestamp: at,
            expires_at: record.expires_at(),
        };
        self.entries.entry(subject).or_default().push(entry.clone());
        if let Some(persistence) = self.persistence.clone() {
            let trail = self.entries.clone();
            if let Err(error) = offload(move || persistence.write(&trail)).await {
                warn!("[audit] failed to persist trail, keeping it in memory: {}", error);
            }
        }
        entry
    }

    /// Newest-first entries of `subject`.
    fn history(&self, subject: &Option<String>) -> Vec<AuditEntry> {
        let mut history = self.entries.get(subject).map(|entries| entries.clone()).unwrap_or_default();
        history.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        history
    }

    fn export(&self, subject: &Option<String>) -> Result<String, ConsentError> {
        serde_json::to_string_pretty(&self.history(subject))
            .map_err(|error| StoreError::Serialization(error.to_string()).into())
    }
}

impl Service<AuditRequest> for AuditService {
    type Response = AuditResponse;
    type Error = ConsentError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: AuditRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            this.ensure_restored().await;
            match request {
                AuditRequest::Append { subject, record, action, metadata, at } => {
                    info!(
                        subject = subject.as_deref().unwrap_or("anonymous"),
                        version = %record.version(),
                        "[audit] {:?}",
                        action
                    );
                    Ok(AuditResponse::Entry(this.append(subject, &record, action, metadata, at).await))
                }
                AuditRequest::History(subject) => Ok(AuditResponse::History(this.history(&subject))),
                AuditRequest::Export(subject) => Ok(AuditResponse::Export(this.export(&subject)?)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use tower::ServiceExt;

    use super::*;
    use crate::gate::{core::record::ConsentChoice, infrastructure::storage::MemoryStorage};

    async fn append(
        audit: &AuditService,
        subject: Option<&str>,
        record: &ConsentRecord,
        action: AuditAction,
        at: DateTime<Utc>,
    ) -> AuditEntry {
        let request = AuditRequest::Append {
            subject: subject.map(str::to_string),
            record: record.clone(),
            action,
            metadata: RequestMetadata::default(),
            at,
        };
        match audit.clone().oneshot(request).await.unwrap() {
            AuditResponse::Entry(entry) => entry,
            other => panic!("Expected Entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unit_audit_history_is_newest_first_per_subject() {
        let audit = AuditService::new();
        let now = Utc::now();
        let granted = ConsentRecord::grant(ConsentChoice::accept_all(), now, "1.0", 24);
        let withdrawn = granted.withdraw(now + TimeDelta::minutes(1));

        append(&audit, Some("alice"), &granted, AuditAction::Granted, now).await;
        append(&audit, None, &granted, AuditAction::Granted, now).await;
        let last = append(&audit, Some("alice"), &withdrawn, AuditAction::Withdrawn, now).await;

        let AuditResponse::History(history) =
            audit.clone().oneshot(AuditRequest::History(Some("alice".into()))).await.unwrap()
        else {
            panic!("Expected History");
        };
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], last);
        assert_eq!(history[0].action, AuditAction::Withdrawn);
        assert!(history[0].consent.declines_everything());
        assert_eq!(history[1].action, AuditAction::Granted);
        assert_eq!(history[1].consent, ConsentFlags::all());

        let AuditResponse::History(anonymous) =
            audit.clone().oneshot(AuditRequest::History(None)).await.unwrap()
        else {
            panic!("Expected History");
        };
        assert_eq!(anonymous.len(), 1);
        assert_eq!(anonymous[0].subject, None);
    }

    #[tokio::test]
    async fn unit_audit_export_is_json() {
        let audit = AuditService::new();
        let now = Utc::now();
        let record = ConsentRecord::grant(ConsentChoice::custom(true, false, false), now, "1.0", 24);
        append(&audit, Some("bob"), &record, AuditAction::Granted, now).await;

        let AuditResponse::Export(json) =
            audit.clone().oneshot(AuditRequest::Export(Some("bob".into()))).await.unwrap()
        else {
            panic!("Expected Export");
        };
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["action"], "GRANTED");
        assert_eq!(value[0]["consent"]["analytics"], true);
        assert_eq!(value[0]["consent"]["necessary"], true);
        assert_eq!(value[0]["subject"], "bob");
        assert!(value[0]["expiresAt"].is_string());
    }

    #[tokio::test]
    async fn unit_audit_persisted_trail_survives_restart() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let now = Utc::now();
        let record = ConsentRecord::grant(ConsentChoice::accept_all(), now, "1.0", 24);

        let audit = AuditService::persisted(storage.clone(), "audit");
        append(&audit, Some("carol"), &record, AuditAction::Granted, now).await;
        append(&audit, Some("carol"), &record.withdraw(now), AuditAction::Withdrawn, now).await;

        let restored = AuditService::persisted(storage, "audit");
        let next = append(&restored, Some("carol"), &record, AuditAction::Expired, now).await;
        assert_eq!(next.sequence, 2);
        assert_eq!(restored.history(&Some("carol".into())).len(), 3);
    }
}
