//! Gate API service implementation.
//!
//! `GateApiService` is the single update path for consent: every decision,
//! withdrawal and expiry goes through it, so the rate limiter, the audit
//! trail, the persisted record and the running services never disagree.
//!
//! ## Service Architecture
//!
//! The service coordinates three inner services:
//! - **Store**: reads and writes the persisted consent envelope and the
//!   banner prompt history
//! - **Audit**: appends a snapshot for every transition
//! - **Orchestrator**: loads and tears down third-party services to match
//!   the current consent
//!
//! ## Session
//!
//! The current record lives in memory behind a lock that also serializes
//! updates. The lock covers the record, the store write and the audit append
//! only: the resulting service diff is handed to the orchestrator after the
//! lock is released, tagged with a revision so that a late diff cannot undo a
//! newer one. Status reads therefore never wait for third-party loads.
//!
//! The record is hydrated from the store on first use, together with the rate
//! limit window of earlier sessions, rebuilt from the audit trail. A store
//! write failure degrades to in-memory operation for the rest of the session.
//! An in-memory record that crosses its expiry is expired on the next request,
//! exactly as if it had been found expired in the store.
use std::{future::Future, pin::Pin, sync::Arc, task::Poll};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tower::Service;
use tracing::{debug, info, warn};

use crate::gate::{
    api::types::{
        AuditRequest, AuditResponse, ConsentEvent, GateRequest, GateResponse, OrchestratorRequest,
        OrchestratorResponse, StoreRequest, StoreResponse, UpdateOutcome,
    },
    config::GateConfig,
    core::{
        fatigue::{FatiguePolicy, PromptHistory},
        record::{ConsentCategory, ConsentChoice, ConsentFlags, ConsentRecord, ConsentSource},
    },
    error::ConsentError,
    infrastructure::clock::Clock,
    services::{
        audit::{AuditAction, RequestMetadata},
        rate_limit::{ANONYMOUS, RateLimiter},
        store::ReadOutcome,
    },
};

/// Notifications buffered per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct Session {
    hydrated: bool,
    current: Option<ConsentRecord>,
    /// Bumped on every staged diff; orders diffs at the orchestrator.
    revision: u64,
    staged: Staged,
}

impl Session {
    fn stage_apply(&mut self, flags: ConsentFlags) {
        self.revision += 1;
        self.staged.apply = Some((flags, self.revision));
    }
}

/// Orchestrator work decided under the session lock, run once it is released.
#[derive(Debug, Default)]
struct Staged {
    boot: bool,
    apply: Option<(ConsentFlags, u64)>,
}

/// Gate API Service
///
/// Answers [`GateRequest`]s for one consent subject (or the anonymous user)
/// on top of a store, an audit trail and an orchestrator.
#[derive(Clone)]
pub struct GateApiService<S, A, O> {
    /// Persisted consent envelope and prompt history
    store: S,
    /// Append-only trail of transitions
    audit: A,
    /// Third-party service lifecycle
    orchestrator: O,
    rate_limiter: RateLimiter,
    fatigue: FatiguePolicy,
    clock: Arc<dyn Clock>,
    /// Identity recorded in the audit trail; `None` is the anonymous user
    subject: Option<String>,
    policy_version: String,
    lifetime_months: u32,
    session: Arc<Mutex<Session>>,
    events: broadcast::Sender<ConsentEvent>,
}

impl<S, A, O> GateApiService<S, A, O> {
    pub fn new(store: S, audit: A, orchestrator: O, clock: Arc<dyn Clock>, config: &GateConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            audit,
            orchestrator,
            rate_limiter: RateLimiter::new(config.rate_limit_max_updates, config.rate_limit_window()),
            fatigue: config.fatigue_policy(),
            clock,
            subject: None,
            policy_version: config.policy_version.clone(),
            lifetime_months: config.consent_lifetime_months,
            session: Arc::new(Mutex::new(Session::default())),
            events,
        }
    }

    /// Attributes every transition to `subject` instead of the anonymous user.
    pub fn with_subject(self, subject: &str) -> Self {
        Self { subject: Some(subject.to_string()), ..self }
    }

    /// Shares a limiter between several gates.
    pub fn with_rate_limiter(self, rate_limiter: RateLimiter) -> Self {
        Self { rate_limiter, ..self }
    }

    fn identity(&self) -> &str {
        self.subject.as_deref().unwrap_or(ANONYMOUS)
    }
}

impl<S, A, O> GateApiService<S, A, O>
where
    S: Service<StoreRequest, Response = StoreResponse, Error = ConsentError> + Clone + Send + Sync + 'static,
    S::Future: Send,
    A: Service<AuditRequest, Response = AuditResponse, Error = ConsentError> + Clone + Send + Sync + 'static,
    A::Future: Send,
    O: Service<OrchestratorRequest, Response = OrchestratorResponse, Error = ConsentError>
        + Clone
        + Send
        + Sync
        + 'static,
    O::Future: Send,
{
    async fn orchestrate(&self, request: OrchestratorRequest) -> Result<OrchestratorResponse, ConsentError> {
        self.orchestrator.clone().call(request).await
    }

    async fn store(&self, request: StoreRequest) -> Result<StoreResponse, ConsentError> {
        self.store.clone().call(request).await
    }

    async fn append_audit(
        &self,
        record: &ConsentRecord,
        action: AuditAction,
        metadata: RequestMetadata,
        at: DateTime<Utc>,
    ) -> Result<(), ConsentError> {
        let request = AuditRequest::Append {
            subject: self.subject.clone(),
            record: record.clone(),
            action,
            metadata,
            at,
        };
        match self.audit.clone().call(request).await? {
            AuditResponse::Entry(_) => Ok(()),
            _ => Err(ConsentError::InternalConsentGateError),
        }
    }

    fn notify(&self, event: ConsentEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Releases the session lock, then runs the orchestrator work staged
    /// under it. Loads never hold up other requests.
    async fn release(&self, mut session: MutexGuard<'_, Session>) -> Result<(), ConsentError> {
        let staged = std::mem::take(&mut session.staged);
        drop(session);
        if staged.boot {
            self.orchestrate(OrchestratorRequest::Boot).await?;
        }
        if let Some((flags, revision)) = staged.apply {
            self.orchestrate(OrchestratorRequest::ApplyConsentRevision { flags, revision }).await?;
        }
        Ok(())
    }

    /// Loads stored consent and restores the rate limit window on first use,
    /// and expires an in-memory record that has lapsed since.
    async fn ensure_hydrated(&self, session: &mut Session) -> Result<(), ConsentError> {
        if !session.hydrated {
            self.restore_rate_limit().await?;
            session.staged.boot = true;
            match self.store(StoreRequest::ReadConsent).await? {
                StoreResponse::Consent(ReadOutcome::Present(record)) => {
                    info!(version = %record.version(), "[gate] restored stored consent");
                    session.stage_apply(record.flags());
                    session.current = Some(record);
                }
                StoreResponse::Consent(ReadOutcome::Expired(record)) => self.expire(session, record).await?,
                StoreResponse::Consent(ReadOutcome::Absent) => debug!("[gate] no stored consent"),
                _ => return Err(ConsentError::InternalConsentGateError),
            }
            session.hydrated = true;
            return Ok(());
        }
        let now = self.clock.now();
        if let Some(record) = session.current.take_if(|record| record.is_expired(now)) {
            self.store(StoreRequest::ClearConsent).await?;
            self.expire(session, record).await?;
        }
        Ok(())
    }

    /// Counts updates accepted by earlier sessions against the rate limit.
    async fn restore_rate_limit(&self) -> Result<(), ConsentError> {
        let AuditResponse::History(entries) =
            self.audit.clone().call(AuditRequest::History(self.subject.clone())).await?
        else {
            return Err(ConsentError::InternalConsentGateError);
        };
        let accepted = entries
            .into_iter()
            .filter(|entry| entry.action != AuditAction::Expired)
            .map(|entry| entry.timestamp);
        self.rate_limiter.restore(self.identity(), accepted, self.clock.now());
        Ok(())
    }

    async fn expire(&self, session: &mut Session, record: ConsentRecord) -> Result<(), ConsentError> {
        info!(version = %record.version(), "[gate] consent expired");
        let now = self.clock.now();
        self.append_audit(&record, AuditAction::Expired, RequestMetadata::default(), now).await?;
        session.stage_apply(ConsentFlags::necessary_only());
        self.notify(ConsentEvent::Changed {
            record: ConsentRecord::undecided(&self.policy_version),
            source: ConsentSource::Expiry,
        });
        Ok(())
    }

    /// Makes `record` current: memory first, then store and audit. The
    /// service diff is staged for [`Self::release`].
    async fn commit(
        &self,
        session: &mut Session,
        record: ConsentRecord,
        action: AuditAction,
        metadata: RequestMetadata,
        at: DateTime<Utc>,
    ) -> Result<UpdateOutcome, ConsentError> {
        session.current = Some(record.clone());
        session.stage_apply(record.flags());
        let store_error = match self.store(StoreRequest::WriteConsent(record.clone())).await {
            Ok(_) => None,
            Err(ConsentError::Store(error)) => {
                warn!("[gate] consent kept in memory only: {}", error);
                Some(error)
            }
            Err(error) => return Err(error),
        };
        self.append_audit(&record, action, metadata, at).await?;
        Ok(UpdateOutcome { record, store_error })
    }

    async fn update_consent(
        &self,
        choice: ConsentChoice,
        source: ConsentSource,
        metadata: RequestMetadata,
    ) -> Result<UpdateOutcome, ConsentError> {
        let mut session = self.session.lock().await;
        let outcome = self.update_locked(&mut session, choice, source, metadata).await;
        self.release(session).await?;
        outcome
    }

    async fn update_locked(
        &self,
        session: &mut Session,
        choice: ConsentChoice,
        source: ConsentSource,
        metadata: RequestMetadata,
    ) -> Result<UpdateOutcome, ConsentError> {
        self.ensure_hydrated(session).await?;
        let now = self.clock.now();
        self.rate_limiter.try_acquire(self.identity(), now)?;
        let record = ConsentRecord::grant(choice, now, &self.policy_version, self.lifetime_months)
            .succeeding(session.current.as_ref());
        info!(source = %source, flags = ?record.flags(), "[gate] consent updated");
        let outcome = self.commit(session, record, AuditAction::Granted, metadata, now).await?;
        self.notify(ConsentEvent::Changed { record: outcome.record.clone(), source });
        if source == ConsentSource::Banner && choice.flags().declines_everything() {
            self.update_prompt_history(|history| history.record_rejection()).await?;
        }
        Ok(outcome)
    }

    async fn withdraw_consent(
        &self,
        reason: Option<String>,
        metadata: RequestMetadata,
    ) -> Result<UpdateOutcome, ConsentError> {
        let mut session = self.session.lock().await;
        let outcome = self.withdraw_locked(&mut session, reason, metadata).await;
        self.release(session).await?;
        outcome
    }

    async fn withdraw_locked(
        &self,
        session: &mut Session,
        reason: Option<String>,
        metadata: RequestMetadata,
    ) -> Result<UpdateOutcome, ConsentError> {
        self.ensure_hydrated(session).await?;
        let now = self.clock.now();
        self.rate_limiter.try_acquire(self.identity(), now)?;
        let record = session
            .current
            .as_ref()
            .map_or_else(|| ConsentRecord::undecided(&self.policy_version), ConsentRecord::clone)
            .withdraw(now);
        info!(reason = reason.as_deref().unwrap_or("none"), "[gate] consent withdrawn");
        let outcome = self.commit(session, record, AuditAction::Withdrawn, metadata, now).await?;
        self.notify(ConsentEvent::Changed {
            record: outcome.record.clone(),
            source: ConsentSource::Settings,
        });
        self.notify(ConsentEvent::Withdrawn { reason, at: now });
        Ok(outcome)
    }

    /// Current record, hydrating first. The lock is held only while reading.
    async fn snapshot(&self) -> Result<Option<ConsentRecord>, ConsentError> {
        let mut session = self.session.lock().await;
        let hydrated = self.ensure_hydrated(&mut session).await;
        let current = session.current.clone();
        self.release(session).await?;
        hydrated.map(|_| current)
    }

    async fn consent_status(&self, category: ConsentCategory) -> Result<bool, ConsentError> {
        if category == ConsentCategory::Necessary {
            return Ok(true);
        }
        Ok(self.snapshot().await?.is_some_and(|record| record.allows(category)))
    }

    async fn prompt_history(&self) -> Result<PromptHistory, ConsentError> {
        match self.store(StoreRequest::ReadPromptHistory).await? {
            StoreResponse::PromptHistory(history) => Ok(history),
            _ => Err(ConsentError::InternalConsentGateError),
        }
    }

    /// Read-modify-write of the prompt history. A failed write is only logged.
    async fn update_prompt_history(
        &self,
        update: impl FnOnce(&mut PromptHistory) + Send,
    ) -> Result<(), ConsentError> {
        let mut history = self.prompt_history().await?;
        update(&mut history);
        match self.store(StoreRequest::WritePromptHistory(history)).await {
            Ok(_) => Ok(()),
            Err(ConsentError::Store(error)) => {
                warn!("[gate] prompt history kept in memory only: {}", error);
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn should_show_banner(&self) -> Result<bool, ConsentError> {
        let current = self.snapshot().await?;
        let history = self.prompt_history().await?;
        Ok(self.fatigue.should_prompt(&history, current.as_ref(), self.clock.now()))
    }

    async fn initialize(&self) -> Result<(), ConsentError> {
        self.snapshot().await.map(|_| ())
    }

    async fn reinitialize(&self) -> Result<(), ConsentError> {
        self.initialize().await?;
        self.orchestrate(OrchestratorRequest::ReinitializeAll).await?;
        Ok(())
    }
}

impl<S, A, O> Service<GateRequest> for GateApiService<S, A, O>
where
    S: Service<StoreRequest, Response = StoreResponse, Error = ConsentError> + Clone + Send + Sync + 'static,
    S::Future: Send,
    A: Service<AuditRequest, Response = AuditResponse, Error = ConsentError> + Clone + Send + Sync + 'static,
    A::Future: Send,
    O: Service<OrchestratorRequest, Response = OrchestratorResponse, Error = ConsentError>
        + Clone
        + Send
        + Sync
        + 'static,
    O::Future: Send,
{
    type Response = GateResponse;
    type Error = ConsentError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: GateRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            match request {
                GateRequest::Initialize => {
                    debug!("[gate] Initialize");
                    this.initialize().await?;
                    Ok(GateResponse::Ack)
                }
                GateRequest::GetConsentStatus(category) => {
                    Ok(GateResponse::Status(this.consent_status(category).await?))
                }
                GateRequest::GetConsent => Ok(GateResponse::Consent(this.snapshot().await?)),
                GateRequest::UpdateConsent { choice, source, metadata } => {
                    debug!("[gate] UpdateConsent: choice: {:?}, source: {}", choice, source);
                    Ok(GateResponse::Updated(this.update_consent(choice, source, metadata).await?))
                }
                GateRequest::WithdrawConsent { reason, metadata } => {
                    debug!("[gate] WithdrawConsent: reason: {:?}", reason);
                    Ok(GateResponse::Updated(this.withdraw_consent(reason, metadata).await?))
                }
                GateRequest::ShouldShowBanner => {
                    Ok(GateResponse::ShowBanner(this.should_show_banner().await?))
                }
                GateRequest::RecordBannerShown => {
                    let now = this.clock.now();
                    this.update_prompt_history(|history| history.record_shown(now)).await?;
                    Ok(GateResponse::Ack)
                }
                GateRequest::GetServiceStatus => {
                    match this.orchestrate(OrchestratorRequest::GetServiceStatus).await? {
                        OrchestratorResponse::ServiceStatus(status) => Ok(GateResponse::ServiceStatus(status)),
                        _ => Err(ConsentError::InternalConsentGateError),
                    }
                }
                GateRequest::GetConsentHistory(subject) => {
                    match this.audit.clone().call(AuditRequest::History(subject)).await? {
                        AuditResponse::History(entries) => Ok(GateResponse::History(entries)),
                        _ => Err(ConsentError::InternalConsentGateError),
                    }
                }
                GateRequest::ExportConsentHistory(subject) => {
                    match this.audit.clone().call(AuditRequest::Export(subject)).await? {
                        AuditResponse::Export(json) => Ok(GateResponse::Export(json)),
                        _ => Err(ConsentError::InternalConsentGateError),
                    }
                }
                GateRequest::ReinitializeServices => {
                    debug!("[gate] ReinitializeServices");
                    this.reinitialize().await?;
                    Ok(GateResponse::Ack)
                }
                GateRequest::Subscribe => Ok(GateResponse::Events(this.events.subscribe())),
            }
        })
    }
}
