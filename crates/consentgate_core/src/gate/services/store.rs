//! Consent store adapter.
//!
//! Wraps a [`StorageBackend`] slot holding the `{consent, timestamp, version,
//! expiresAt}` envelope. Reads never fail: an unreadable or invalid slot is
//! logged, cleared and reported as absent, and an expired record is cleared
//! and reported as [`ReadOutcome::Expired`] so the caller can audit the
//! expiry. Because the slot is cleared on that read, the expiry is observed
//! exactly once.
//!
//! Writes report backend failures (quota, io) as [`StoreError`] instead of
//! propagating them further.
use std::{future::Future, pin::Pin, sync::Arc, task::Poll};

use serde_json::Value;
use tower::Service;
use tracing::{debug, info, warn};

use crate::gate::{
    api::types::{StoreRequest, StoreResponse},
    core::{
        fatigue::PromptHistory,
        record::{ConsentRecord, validate},
    },
    error::{ConsentError, StoreError},
    infrastructure::{
        clock::Clock,
        storage::{StorageBackend, offload},
    },
};

/// Result of reading the consent slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Present(ConsentRecord),
    /// Nothing usable in the slot.
    Absent,
    /// The slot held a decision past its expiry; it has been cleared.
    Expired(ConsentRecord),
}

impl ReadOutcome {
    /// The record, if it is present and unexpired. Expired reads as absent.
    pub fn present(self) -> Option<ConsentRecord> {
        match self {
            ReadOutcome::Present(record) => Some(record),
            ReadOutcome::Absent | ReadOutcome::Expired(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsentStoreService {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    consent_key: String,
    history_key: String,
}

impl ConsentStoreService {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        consent_key: &str,
        history_key: &str,
    ) -> Self {
        Self {
            backend,
            clock,
            consent_key: consent_key.to_string(),
            history_key: history_key.to_string(),
        }
    }

    fn read_consent(&self) -> ReadOutcome {
        let raw = match self.backend.get(&self.consent_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return ReadOutcome::Absent,
            Err(error) => {
                warn!("[store] consent slot unreadable, treating as absent: {}", error);
                return ReadOutcome::Absent;
            }
        };
        let candidate: Value = match serde_json::from_str(&raw) {
            Ok(candidate) => candidate,
            Err(error) => {
                warn!("[store] consent slot is not valid JSON, clearing it: {}", error);
                self.clear_consent();
                return ReadOutcome::Absent;
            }
        };
        let record = match validate(&candidate) {
            Ok(record) => record,
            Err(errors) => {
                warn!(?errors, "[store] consent slot failed validation, clearing it");
                self.clear_consent();
                return ReadOutcome::Absent;
            }
        };
        if record.granted_at().is_none() {
            debug!("[store] consent slot holds no decision, clearing it");
            self.clear_consent();
            return ReadOutcome::Absent;
        }
        if record.is_expired(self.clock.now()) {
            info!(version = %record.version(), "[store] stored consent expired, clearing it");
            self.clear_consent();
            return ReadOutcome::Expired(record);
        }
        ReadOutcome::Present(record)
    }

    fn write_consent(&self, record: &ConsentRecord) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&record.to_envelope())
            .map_err(|error| StoreError::Serialization(error.to_string()))?;
        self.backend.set(&self.consent_key, &raw)
    }

    fn clear_consent(&self) {
        if let Err(error) = self.backend.remove(&self.consent_key) {
            warn!("[store] failed to clear consent slot: {}", error);
        }
    }

    fn read_history(&self) -> PromptHistory {
        match self.backend.get(&self.history_key) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|error| {
                warn!("[store] prompt history unreadable, starting over: {}", error);
                PromptHistory::default()
            }),
            Ok(None) => PromptHistory::default(),
            Err(error) => {
                warn!("[store] prompt history slot unreadable: {}", error);
                PromptHistory::default()
            }
        }
    }

    fn write_history(&self, history: &PromptHistory) -> Result<(), StoreError> {
        let raw = serde_json::to_string(history)
            .map_err(|error| StoreError::Serialization(error.to_string()))?;
        self.backend.set(&self.history_key, &raw)
    }
}

impl ConsentStoreService {
    /// Blocking body of a request; runs on the blocking pool.
    fn handle(&self, request: StoreRequest) -> Result<StoreResponse, ConsentError> {
        match request {
            StoreRequest::ReadConsent => {
                debug!("[store] ReadConsent");
                Ok(StoreResponse::Consent(self.read_consent()))
            }
            StoreRequest::WriteConsent(record) => {
                debug!(version = %record.version(), "[store] WriteConsent");
                self.write_consent(&record)?;
                Ok(StoreResponse::Ack)
            }
            StoreRequest::ClearConsent => {
                debug!("[store] ClearConsent");
                self.clear_consent();
                Ok(StoreResponse::Ack)
            }
            StoreRequest::ReadPromptHistory => Ok(StoreResponse::PromptHistory(self.read_history())),
            StoreRequest::WritePromptHistory(history) => {
                self.write_history(&history)?;
                Ok(StoreResponse::Ack)
            }
        }
    }
}

impl Service<StoreRequest> for ConsentStoreService {
    type Response = StoreResponse;
    type Error = ConsentError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: StoreRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(offload(move || this.handle(request)))
    }
}
