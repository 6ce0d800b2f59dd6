use thiserror::Error;

/// Errors surfaced by the consent gate services.
///
/// None of these are fatal to the host except [`ConsentError::Registry`], which
/// is only produced while building the service registry at startup.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConsentError {
    #[error("Consent error, invalid consent record ({} issue(s))", .0.len())]
    Validation(Vec<ValidationError>),

    #[error("Consent error, store failure ({0})")]
    Store(#[from] StoreError),

    #[error("Consent error, rate limit exceeded (identity: {identity}, limit: {limit} per {window_secs}s)")]
    RateLimitExceeded { identity: String, limit: u32, window_secs: u64 },

    #[error("Consent error, service load failed (service: {0}, reason: {1})")]
    ServiceLoad(String, String),

    #[error("Consent error, service load timed out (service: {0}, timeout: {1}ms)")]
    ServiceLoadTimeout(String, u64),

    #[error("Consent error, unknown service (id: {0})")]
    UnknownService(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Consent error, internal consent gate error")]
    InternalConsentGateError,
}

/// A single reason a consent candidate was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("expected a JSON object")]
    NotAnObject,

    #[error("field `{0}` must be a boolean")]
    NotBoolean(&'static str),

    #[error("field `{0}` is not a parseable timestamp")]
    InvalidTimestamp(&'static str),

    #[error("field `version` must be a string")]
    InvalidVersion,
}

/// Persistence failures reported by a storage backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("quota exceeded (key: {key}, needed: {needed} bytes, available: {available} bytes)")]
    QuotaExceeded { key: String, needed: usize, available: usize },

    #[error("io failure: {0}")]
    Io(String),

    #[error("serialization failure: {0}")]
    Serialization(String),
}

/// Configuration bugs detected while building the service registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registry error, dependency cycle detected ({})", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Registry error, unknown dependency (service: {service}, dependency: {dependency})")]
    UnknownDependency { service: String, dependency: String },

    #[error("Registry error, duplicate service (id: {0})")]
    DuplicateService(String),

    #[error("Registry error, priority out of range 1..=10 (service: {service}, priority: {priority})")]
    InvalidPriority { service: String, priority: u8 },
}
