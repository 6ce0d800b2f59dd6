//! Consent gate API type definitions.
//!
//! This module defines the request and response types of every service in the
//! consent gate. The public surface is the gate API ([`GateRequest`] /
//! [`GateResponse`]), which hosts and user interfaces talk to. The gate API
//! composes three internal services, each with its own request/response pair:
//!
//! - **Store**: the persisted consent envelope and the banner prompt history
//! - **Audit**: the append-only trail of consent transitions
//! - **Orchestrator**: loading and tearing down third-party services according
//!   to the current consent

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::gate::{
    core::{
        fatigue::PromptHistory,
        record::{ConsentCategory, ConsentChoice, ConsentFlags, ConsentRecord, ConsentSource},
    },
    error::StoreError,
    services::{
        audit::{AuditAction, AuditEntry, RequestMetadata},
        orchestrator::ServiceRuntimeState,
        store::ReadOutcome,
    },
};

/// Gate API request types.
///
/// Every request except the read-only queries first hydrates the in-memory
/// consent from storage on its first use, so hosts do not have to send
/// `Initialize` explicitly.
#[derive(Debug, Clone)]
pub enum GateRequest {
    /// Load stored consent, activate the necessary services and apply the
    /// stored decision. Idempotent.
    Initialize,

    /// Whether services of a category may currently run.
    ///
    /// `Necessary` is always granted. Optional categories are denied while no
    /// unexpired decision exists.
    GetConsentStatus(ConsentCategory),

    /// The current unexpired decision, if any.
    GetConsent,

    /// Record a new decision.
    ///
    /// Subject to the per-identity rate limit. The decision is applied in
    /// memory and to the running services even if persisting it fails.
    UpdateConsent {
        choice: ConsentChoice,
        /// Where the decision was made; a decline-all from the banner counts
        /// as a rejection for prompt fatigue
        source: ConsentSource,
        /// Requester details recorded in the audit trail
        metadata: RequestMetadata,
    },

    /// Switch every optional category off and tear down the affected services.
    WithdrawConsent {
        /// Free-form reason broadcast to subscribers
        reason: Option<String>,
        metadata: RequestMetadata,
    },

    /// Whether the consent banner should be presented now.
    ShouldShowBanner,

    /// Record that the banner was presented.
    RecordBannerShown,

    /// Runtime state of every registered service, keyed by service id.
    GetServiceStatus,

    /// Audit entries of an identity, newest first. `None` is the anonymous user.
    GetConsentHistory(Option<String>),

    /// Audit entries of an identity serialized as a JSON document.
    ExportConsentHistory(Option<String>),

    /// Re-run activation for every enabled service that is not loaded and tear
    /// down every loaded service whose category is disabled.
    ReinitializeServices,

    /// Register for consent change notifications.
    Subscribe,
}

/// Gate API response types.
#[derive(Debug)]
pub enum GateResponse {
    /// Answer to `GetConsentStatus`.
    Status(bool),

    /// Answer to `GetConsent`.
    Consent(Option<ConsentRecord>),

    /// Result of `UpdateConsent` and `WithdrawConsent`.
    Updated(UpdateOutcome),

    /// Answer to `ShouldShowBanner`.
    ShowBanner(bool),

    /// Answer to `GetServiceStatus`.
    ServiceStatus(BTreeMap<String, ServiceRuntimeState>),

    /// Answer to `GetConsentHistory`.
    History(Vec<AuditEntry>),

    /// Answer to `ExportConsentHistory`.
    Export(String),

    /// Receiver of consent change notifications, answer to `Subscribe`.
    ///
    /// A receiver that falls behind skips the oldest notifications.
    Events(broadcast::Receiver<ConsentEvent>),

    /// Acknowledgment of `Initialize`, `RecordBannerShown` and
    /// `ReinitializeServices`.
    Ack,
}

/// Applied decision together with the outcome of persisting it.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    /// The record now held in memory
    pub record: ConsentRecord,
    /// Set when the record could not be written to storage; the decision
    /// still governs the running session
    pub store_error: Option<StoreError>,
}

impl UpdateOutcome {
    pub fn persisted(&self) -> bool {
        self.store_error.is_none()
    }
}

/// Notification broadcast to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsentEvent {
    /// The effective consent changed. Emitted for updates, withdrawals and
    /// expiry (with [`ConsentSource::Expiry`] and an undecided record).
    Changed { record: ConsentRecord, source: ConsentSource },

    /// Emitted after `Changed` when the change was a withdrawal.
    Withdrawn { reason: Option<String>, at: DateTime<Utc> },
}

/// Consent store request types.
#[derive(Debug, Clone)]
pub enum StoreRequest {
    /// Read and validate the consent slot. Invalid or expired content is cleared.
    ReadConsent,

    /// Persist a record as the consent envelope.
    WriteConsent(ConsentRecord),

    /// Remove the consent slot.
    ClearConsent,

    /// Read the banner prompt history, defaulting to an empty history.
    ReadPromptHistory,

    /// Persist the banner prompt history.
    WritePromptHistory(PromptHistory),
}

/// Consent store response types.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreResponse {
    Consent(ReadOutcome),
    PromptHistory(PromptHistory),
    Ack,
}

/// Audit trail request types.
#[derive(Debug, Clone)]
pub enum AuditRequest {
    /// Append a snapshot of `record` for `subject`.
    Append {
        subject: Option<String>,
        record: ConsentRecord,
        action: AuditAction,
        metadata: RequestMetadata,
        at: DateTime<Utc>,
    },

    /// Entries of a subject, newest first.
    History(Option<String>),

    /// Entries of a subject as pretty-printed JSON.
    Export(Option<String>),
}

/// Audit trail response types.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditResponse {
    Entry(AuditEntry),
    History(Vec<AuditEntry>),
    Export(String),
}

/// Service orchestrator request types.
#[derive(Debug, Clone)]
pub enum OrchestratorRequest {
    /// Activate the necessary services. Only the first boot has an effect.
    Boot,

    /// Make `flags` the current consent: tear down services of newly disabled
    /// categories, then activate services of newly enabled ones.
    ApplyConsent(ConsentFlags),

    /// [`OrchestratorRequest::ApplyConsent`] tagged with the caller's
    /// revision. Skipped when a newer revision has already been applied, so
    /// diffs that reach the orchestrator out of order cannot roll consent back.
    ApplyConsentRevision { flags: ConsentFlags, revision: u64 },

    /// Reconcile every service with the current consent.
    ReinitializeAll,

    /// Snapshot of every service's runtime state.
    GetServiceStatus,
}

/// Service orchestrator response types.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorResponse {
    ServiceStatus(BTreeMap<String, ServiceRuntimeState>),
    Ack,
}
