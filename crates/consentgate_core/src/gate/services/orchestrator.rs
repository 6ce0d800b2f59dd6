//! Service orchestrator.
//!
//! Drives every registered service through
//! `pending -> loading -> (loaded | error)`, `loaded | error -> disabled` on
//! withdrawal, `disabled -> loading` on re-grant and `error -> pending` when a
//! retry fires. There is no terminal state.
//!
//! ## Consent diffs
//!
//! Diffs are applied one at a time: a diff holds the orchestrator lock until
//! every load it started has resolved, so a second diff queues behind it.
//! Services of newly disabled categories are torn down first, then services
//! of newly enabled categories are loaded in registry order (dependencies
//! first, then ascending priority value). A service whose dependencies are not
//! all `loaded` is re-checked on a timer, a bounded number of times, before it
//! is put in `error`.
//!
//! A diff sent as `ApplyConsentRevision` is dropped when a newer revision
//! already went through, so the applied consent always follows the caller's
//! latest decision even if requests race to the lock.
//!
//! ## Superseded loads
//!
//! Loads are never aborted. Each slot carries an epoch that teardown bumps;
//! a load that resolves under a stale epoch, or for a service that is no
//! longer enabled, is discarded and the service's cleanup runs again.
//!
//! Retries, health checks and dependency re-checks run on the injected
//! [`Scheduler`] and do not take the diff lock.
use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::Poll,
    time::Duration,
};

use dashmap::DashMap;
use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, watch},
    time::Instant,
};
use tower::Service;
use tracing::{debug, error, info, warn};

use crate::gate::{
    api::types::{OrchestratorRequest, OrchestratorResponse},
    core::{
        record::{ConsentCategory, ConsentFlags},
        registry::{ServiceDescriptor, ServiceRegistry},
    },
    error::ConsentError,
    infrastructure::{integration::IntegrationSet, scheduler::Scheduler},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Pending,
    Loading,
    Loaded,
    Error,
    Disabled,
}

/// Outcome of the post-load health check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthCheck {
    #[default]
    NotRun,
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRuntimeState {
    pub status: ServiceStatus,
    /// Duration of the last successful load.
    pub load_time_ms: Option<u64>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub health: HealthCheck,
}

impl Default for ServiceRuntimeState {
    fn default() -> Self {
        Self {
            status: ServiceStatus::Pending,
            load_time_ms: None,
            last_error: None,
            retry_count: 0,
            health: HealthCheck::NotRun,
        }
    }
}

#[derive(Debug)]
struct Slot {
    descriptor: ServiceDescriptor,
    state: ServiceRuntimeState,
    /// Bumped on teardown; loads and timers started under an older epoch are stale.
    epoch: u64,
    retry_pending: bool,
}

#[derive(Clone)]
pub struct OrchestratorService {
    registry: Arc<ServiceRegistry>,
    integrations: Arc<IntegrationSet>,
    slots: Arc<DashMap<String, Slot>>,
    consent: Arc<watch::Sender<ConsentFlags>>,
    diff_lock: Arc<Mutex<()>>,
    booted: Arc<AtomicBool>,
    /// Highest revision applied through `ApplyConsentRevision`.
    applied_revision: Arc<AtomicU64>,
    scheduler: Arc<dyn Scheduler>,
    health_check_delay: Duration,
    recheck_interval: Duration,
    max_rechecks: u32,
}

impl OrchestratorService {
    /// Every registered service starts `pending` under necessary-only consent.
    pub fn new(
        registry: Arc<ServiceRegistry>,
        integrations: IntegrationSet,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let slots = registry
            .iter()
            .map(|descriptor| {
                if !integrations.contains_key(&descriptor.id) {
                    warn!("[orchestrator] no integration registered for {}", descriptor.id);
                }
                let slot = Slot {
                    descriptor: descriptor.clone(),
                    state: ServiceRuntimeState::default(),
                    epoch: 0,
                    retry_pending: false,
                };
                (descriptor.id.clone(), slot)
            })
            .collect();
        let (consent, _) = watch::channel(ConsentFlags::necessary_only());
        Self {
            registry,
            integrations: Arc::new(integrations),
            slots: Arc::new(slots),
            consent: Arc::new(consent),
            diff_lock: Arc::new(Mutex::new(())),
            booted: Arc::new(AtomicBool::new(false)),
            applied_revision: Arc::new(AtomicU64::new(0)),
            scheduler,
            health_check_delay: Duration::from_secs(5),
            recheck_interval: Duration::from_millis(500),
            max_rechecks: 20,
        }
    }

    pub fn with_health_check_delay(self, health_check_delay: Duration) -> Self {
        Self { health_check_delay, ..self }
    }

    pub fn with_dependency_recheck(self, recheck_interval: Duration, max_rechecks: u32) -> Self {
        Self { recheck_interval, max_rechecks, ..self }
    }

    fn is_enabled(&self, category: ConsentCategory) -> bool {
        category == ConsentCategory::Necessary || self.consent.borrow().allows(category)
    }

    fn status_of(&self, id: &str) -> Option<ServiceStatus> {
        self.slots.get(id).map(|slot| slot.state.status)
    }

    fn service_status(&self) -> BTreeMap<String, ServiceRuntimeState> {
        self.slots.iter().map(|slot| (slot.key().clone(), slot.state.clone())).collect()
    }

    fn unmet_dependencies(&self, id: &str) -> Vec<String> {
        self.registry
            .get(id)
            .map(|descriptor| {
                descriptor
                    .dependencies
                    .iter()
                    .filter(|dependency| self.status_of(dependency) != Some(ServiceStatus::Loaded))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn boot(&self) {
        if self.booted.swap(true, Ordering::SeqCst) {
            return;
        }
        let _diff = self.diff_lock.lock().await;
        let necessary = self
            .registry
            .in_category(ConsentCategory::Necessary)
            .map(|descriptor| descriptor.id.clone())
            .collect();
        info!("[orchestrator] boot");
        self.activate(necessary).await;
    }

    async fn apply_consent(&self, flags: ConsentFlags, revision: Option<u64>) {
        let _diff = self.diff_lock.lock().await;
        if let Some(revision) = revision
            && self.applied_revision.fetch_max(revision, Ordering::SeqCst) >= revision
        {
            debug!(revision, "[orchestrator] consent revision superseded, skipping");
            return;
        }
        let previous = self.consent.send_replace(flags);
        let diff = previous.diff(&flags);
        if diff.is_empty() {
            debug!("[orchestrator] consent unchanged");
            return;
        }
        info!(enabled = ?diff.enabled, disabled = ?diff.disabled, "[orchestrator] applying consent diff");
        for category in &diff.disabled {
            for descriptor in self.registry.in_category(*category) {
                self.disable(&descriptor.id);
            }
        }
        let enabled = self
            .registry
            .iter()
            .filter(|descriptor| diff.enabled.contains(&descriptor.category))
            .map(|descriptor| descriptor.id.clone())
            .collect();
        self.activate(enabled).await;
    }

    async fn reinitialize_all(&self) {
        let _diff = self.diff_lock.lock().await;
        let mut to_activate = Vec::new();
        for descriptor in self.registry.iter() {
            let enabled = self.is_enabled(descriptor.category);
            let Some(mut slot) = self.slots.get_mut(&descriptor.id) else {
                continue;
            };
            let status = slot.state.status;
            match status {
                ServiceStatus::Loading | ServiceStatus::Loaded | ServiceStatus::Error if !enabled => {
                    drop(slot);
                    self.disable(&descriptor.id);
                }
                _ if !enabled => {}
                ServiceStatus::Pending | ServiceStatus::Disabled => to_activate.push(descriptor.id.clone()),
                ServiceStatus::Error if !slot.retry_pending => {
                    slot.state.retry_count = 0;
                    to_activate.push(descriptor.id.clone());
                }
                _ => {}
            }
        }
        debug!("[orchestrator] reinitialize {:?}", to_activate);
        self.activate(to_activate).await;
    }

    /// Loads `ids` in waves: each wave holds the services whose dependencies
    /// are loaded. Whatever is still blocked afterwards is deferred.
    fn activate(&self, ids: Vec<String>) -> BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move {
            let mut waiting = ids;
            while !waiting.is_empty() {
                let (ready, blocked): (Vec<_>, Vec<_>) =
                    waiting.into_iter().partition(|id| this.unmet_dependencies(id).is_empty());
                if ready.is_empty() {
                    for id in blocked {
                        this.defer(id, 0);
                    }
                    return;
                }
                join_all(ready.into_iter().map(|id| this.start_load(id))).await;
                waiting = blocked;
            }
        })
    }

    fn start_load(&self, id: String) -> BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move {
            let Some((epoch, timeout_ms)) = this.begin_load(&id) else {
                return;
            };
            let started = Instant::now();
            let result = match this.integrations.get(&id) {
                None => Err(ConsentError::ServiceLoad(id.clone(), "no integration registered".into())),
                Some(integration) => {
                    match tokio::time::timeout(Duration::from_millis(timeout_ms), integration.load()).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(reason)) => Err(ConsentError::ServiceLoad(id.clone(), reason)),
                        Err(_) => Err(ConsentError::ServiceLoadTimeout(id.clone(), timeout_ms)),
                    }
                }
            };
            this.finish_load(&id, epoch, started.elapsed(), result);
        })
    }

    /// Marks `id` as loading. Returns `None` when the service is already
    /// loading or loaded, or is not enabled.
    fn begin_load(&self, id: &str) -> Option<(u64, u64)> {
        let mut slot = self.slots.get_mut(id)?;
        let status = slot.state.status;
        match status {
            ServiceStatus::Loading | ServiceStatus::Loaded => {
                debug!("[orchestrator] {} already {:?}, skipping load", id, status);
                None
            }
            _ if !self.is_enabled(slot.descriptor.category) => None,
            _ => {
                debug!("[orchestrator] loading {}", id);
                slot.state.status = ServiceStatus::Loading;
                slot.retry_pending = false;
                Some((slot.epoch, slot.descriptor.load_timeout_ms))
            }
        }
    }

    fn finish_load(&self, id: &str, epoch: u64, elapsed: Duration, result: Result<(), ConsentError>) {
        let Some(mut slot) = self.slots.get_mut(id) else {
            return;
        };
        let enabled = self.is_enabled(slot.descriptor.category);
        if slot.epoch != epoch || slot.state.status != ServiceStatus::Loading || !enabled {
            drop(slot);
            info!("[orchestrator] discarding superseded load of {}", id);
            if !enabled && let Some(integration) = self.integrations.get(id) {
                integration.cleanup();
            }
            return;
        }
        match result {
            Ok(()) => {
                slot.state.status = ServiceStatus::Loaded;
                slot.state.load_time_ms = Some(elapsed.as_millis() as u64);
                slot.state.last_error = None;
                slot.state.retry_count = 0;
                slot.state.health = HealthCheck::NotRun;
                drop(slot);
                info!("[orchestrator] {} loaded in {}ms", id, elapsed.as_millis());
                self.schedule_health_check(id.to_string(), epoch);
            }
            Err(reason) => {
                slot.state.status = ServiceStatus::Error;
                slot.state.last_error = Some(reason.to_string());
                if slot.state.retry_count < slot.descriptor.max_retries {
                    let delay = Duration::from_secs(2u64.saturating_pow(slot.state.retry_count));
                    slot.state.retry_count += 1;
                    slot.retry_pending = true;
                    let attempt = slot.state.retry_count;
                    drop(slot);
                    warn!("[orchestrator] {}, retry {} in {:?}", reason, attempt, delay);
                    self.schedule_retry(id.to_string(), epoch, delay);
                } else if slot.descriptor.is_essential {
                    drop(slot);
                    error!("[orchestrator] {}, retries exhausted", reason);
                } else {
                    drop(slot);
                    warn!("[orchestrator] {}, retries exhausted", reason);
                }
            }
        }
    }

    fn schedule_retry(&self, id: String, epoch: u64, delay: Duration) {
        let this = self.clone();
        self.scheduler.schedule_after(
            delay,
            Box::pin(async move {
                let retry = this.slots.get_mut(&id).is_some_and(|mut slot| {
                    let due = slot.epoch == epoch
                        && slot.retry_pending
                        && slot.state.status == ServiceStatus::Error
                        && this.is_enabled(slot.descriptor.category);
                    if due {
                        slot.state.status = ServiceStatus::Pending;
                        slot.retry_pending = false;
                    }
                    due
                });
                if retry {
                    this.activate(vec![id]).await;
                }
            }),
        );
    }

    fn schedule_health_check(&self, id: String, epoch: u64) {
        let this = self.clone();
        self.scheduler.schedule_after(
            self.health_check_delay,
            Box::pin(async move {
                let current = |this: &Self| {
                    this.slots
                        .get(&id)
                        .is_some_and(|slot| slot.epoch == epoch && slot.state.status == ServiceStatus::Loaded)
                };
                let Some(integration) = this.integrations.get(&id) else {
                    return;
                };
                if !current(&this) {
                    return;
                }
                let healthy = integration.health_check();
                if current(&this)
                    && let Some(mut slot) = this.slots.get_mut(&id)
                {
                    slot.state.health = if healthy { HealthCheck::Passed } else { HealthCheck::Failed };
                }
                if !healthy {
                    warn!("[orchestrator] health check failed for {}", id);
                }
            }),
        );
    }

    /// Parks `id` in `pending` and re-checks its dependencies later.
    fn defer(&self, id: String, attempt: u32) {
        let unmet = self.unmet_dependencies(&id);
        let epoch = {
            let Some(mut slot) = self.slots.get_mut(&id) else {
                return;
            };
            if attempt >= self.max_rechecks {
                slot.state.status = ServiceStatus::Error;
                slot.state.last_error = Some(format!("unmet dependencies: {}", unmet.join(", ")));
                drop(slot);
                warn!("[orchestrator] {} gave up waiting for {:?}", id, unmet);
                return;
            }
            slot.state.status = ServiceStatus::Pending;
            slot.epoch
        };
        debug!("[orchestrator] {} waiting for {:?} (check {})", id, unmet, attempt + 1);
        let this = self.clone();
        self.scheduler.schedule_after(
            self.recheck_interval,
            Box::pin(async move {
                let waiting = this.slots.get(&id).is_some_and(|slot| {
                    slot.epoch == epoch
                        && slot.state.status == ServiceStatus::Pending
                        && this.is_enabled(slot.descriptor.category)
                });
                if !waiting {
                    return;
                }
                if this.unmet_dependencies(&id).is_empty() {
                    this.activate(vec![id]).await;
                } else {
                    this.defer(id, attempt + 1);
                }
            }),
        );
    }

    /// Tears `id` down whatever its state. Necessary services are never disabled.
    fn disable(&self, id: &str) {
        {
            let Some(mut slot) = self.slots.get_mut(id) else {
                return;
            };
            if slot.descriptor.category == ConsentCategory::Necessary {
                return;
            }
            slot.epoch += 1;
            slot.state.status = ServiceStatus::Disabled;
            slot.state.load_time_ms = None;
            slot.state.retry_count = 0;
            slot.state.health = HealthCheck::NotRun;
            slot.retry_pending = false;
        }
        if let Some(integration) = self.integrations.get(id) {
            integration.cleanup();
        }
        info!("[orchestrator] {} disabled", id);
    }
}

impl Service<OrchestratorRequest> for OrchestratorService {
    type Response = OrchestratorResponse;
    type Error = ConsentError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: OrchestratorRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            match request {
                OrchestratorRequest::Boot => this.boot().await,
                OrchestratorRequest::ApplyConsent(flags) => this.apply_consent(flags, None).await,
                OrchestratorRequest::ApplyConsentRevision { flags, revision } => {
                    this.apply_consent(flags, Some(revision)).await
                }
                OrchestratorRequest::ReinitializeAll => this.reinitialize_all().await,
                OrchestratorRequest::GetServiceStatus => {
                    return Ok(OrchestratorResponse::ServiceStatus(this.service_status()));
                }
            }
            Ok(OrchestratorResponse::Ack)
        })
    }
}
