//! Per-service load, cleanup and health strategies.
//!
//! The orchestrator never touches a third party directly: each registered
//! service id maps to an [`Integration`] that knows how to bring it up, how to
//! erase everything it left behind, and how to tell whether it is alive.
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::future::BoxFuture;

pub trait Integration: Send + Sync {
    /// Brings the service up. Raced against the descriptor's load timeout.
    fn load(&self) -> BoxFuture<'static, Result<(), String>>;

    /// Removes every cookie and storage entry in the service's namespace.
    /// Must be idempotent.
    fn cleanup(&self);

    /// Best-effort health check run some time after a successful load.
    fn health_check(&self) -> bool {
        true
    }
}

/// Integrations keyed by service id.
pub type IntegrationSet = HashMap<String, Arc<dyn Integration>>;

/// Shared cookie/storage area, partitioned by `<namespace>:<name>` keys.
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    entries: Arc<DashMap<String, String>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, namespace: &str, name: &str, value: &str) {
        self.entries.insert(format!("{namespace}:{name}"), value.to_string());
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<String> {
        self.entries.get(&format!("{namespace}:{name}")).map(|value| value.clone())
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.entries.contains_key(&format!("{namespace}:{name}"))
    }

    /// Number of entries in `namespace`.
    pub fn count(&self, namespace: &str) -> usize {
        let prefix = format!("{namespace}:");
        self.entries.iter().filter(|entry| entry.key().starts_with(&prefix)).count()
    }

    /// Drops every entry in `namespace`, returning how many were removed.
    pub fn clear_namespace(&self, namespace: &str) -> usize {
        let prefix = format!("{namespace}:");
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(&prefix));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Async loader for a [`NamespacedIntegration`].
pub type Loader = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Integration whose footprint lives under one namespace of a [`CookieJar`].
///
/// A successful load plants a `hook` entry (the service's global hook); the
/// health check looks for it and cleanup erases the whole namespace.
#[derive(Clone)]
pub struct NamespacedIntegration {
    namespace: String,
    jar: CookieJar,
    loader: Loader,
}

impl NamespacedIntegration {
    pub fn new(namespace: &str, jar: CookieJar, loader: Loader) -> Self {
        Self { namespace: namespace.to_string(), jar, loader }
    }

    /// Loader that takes `latency` and fails its first `failures` attempts.
    pub fn simulated(namespace: &str, jar: CookieJar, latency: Duration, failures: u32) -> Self {
        let attempts = Arc::new(AtomicU32::new(0));
        let loader: Loader = Arc::new(move || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(latency).await;
                if attempt < failures {
                    Err(format!("script request failed (attempt {})", attempt + 1))
                } else {
                    Ok(())
                }
            })
        });
        Self::new(namespace, jar, loader)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl Integration for NamespacedIntegration {
    fn load(&self) -> BoxFuture<'static, Result<(), String>> {
        let load = (self.loader)();
        let jar = self.jar.clone();
        let namespace = self.namespace.clone();
        Box::pin(async move {
            load.await?;
            jar.set(&namespace, "hook", "ready");
            jar.set(&namespace, "id", "1");
            Ok(())
        })
    }

    fn cleanup(&self) {
        self.jar.clear_namespace(&self.namespace);
    }

    fn health_check(&self) -> bool {
        self.jar.contains(&self.namespace, "hook")
    }
}
