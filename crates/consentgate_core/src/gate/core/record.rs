//! Consent record model.
//!
//! A [`ConsentRecord`] is an immutable value: every transition (grant, toggle,
//! withdrawal) produces a new record, so the audit trail and the orchestrator
//! can hold before/after snapshots without coordinating with writers.
//!
//! ## Invariants
//!
//! - `necessary` is always `true` and cannot be switched off.
//! - A record without `granted_at` is equivalent to "no consent": every
//!   optional category reads as `false`.
//! - A record is expired once `now > expires_at`, where `expires_at`
//!   defaults to `granted_at + 24 months`.
use std::{fmt, str::FromStr};

use chrono::{DateTime, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::gate::error::ValidationError;

/// Default validity of a consent decision.
pub const DEFAULT_LIFETIME_MONTHS: u32 = 24;

/// Unit of granularity at which a user grants or withholds permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentCategory {
    /// Always on, not subject to consent.
    Necessary,
    Analytics,
    Marketing,
    Preferences,
}

impl ConsentCategory {
    pub const ALL: [ConsentCategory; 4] = [
        ConsentCategory::Necessary,
        ConsentCategory::Analytics,
        ConsentCategory::Marketing,
        ConsentCategory::Preferences,
    ];

    /// Categories the user can toggle.
    pub const OPTIONAL: [ConsentCategory; 3] =
        [ConsentCategory::Analytics, ConsentCategory::Marketing, ConsentCategory::Preferences];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentCategory::Necessary => "necessary",
            ConsentCategory::Analytics => "analytics",
            ConsentCategory::Marketing => "marketing",
            ConsentCategory::Preferences => "preferences",
        }
    }
}

impl fmt::Display for ConsentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsentCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConsentCategory::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown consent category: {s}"))
    }
}

/// The four category flags of a consent decision.
///
/// `necessary` is private and pinned to `true`; deserializing a snapshot that
/// says otherwise still yields `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "FlagsRepr")]
pub struct ConsentFlags {
    necessary: bool,
    pub analytics: bool,
    pub marketing: bool,
    pub preferences: bool,
}

#[derive(Deserialize)]
struct FlagsRepr {
    #[serde(default)]
    analytics: bool,
    #[serde(default)]
    marketing: bool,
    #[serde(default)]
    preferences: bool,
}

impl From<FlagsRepr> for ConsentFlags {
    fn from(repr: FlagsRepr) -> Self {
        ConsentFlags::new(repr.analytics, repr.marketing, repr.preferences)
    }
}

impl Default for ConsentFlags {
    fn default() -> Self {
        Self::necessary_only()
    }
}

impl ConsentFlags {
    pub fn new(analytics: bool, marketing: bool, preferences: bool) -> Self {
        Self { necessary: true, analytics, marketing, preferences }
    }

    /// Only the always-on category is enabled.
    pub fn necessary_only() -> Self {
        Self::new(false, false, false)
    }

    pub fn all() -> Self {
        Self::new(true, true, true)
    }

    pub fn necessary(&self) -> bool {
        self.necessary
    }

    /// Returns whether services of `category` may run under these flags.
    pub fn allows(&self, category: ConsentCategory) -> bool {
        match category {
            ConsentCategory::Necessary => self.necessary,
            ConsentCategory::Analytics => self.analytics,
            ConsentCategory::Marketing => self.marketing,
            ConsentCategory::Preferences => self.preferences,
        }
    }

    /// Returns a copy with `category` set to `value`. `Necessary` is ignored.
    pub fn with(mut self, category: ConsentCategory, value: bool) -> Self {
        match category {
            ConsentCategory::Necessary => {}
            ConsentCategory::Analytics => self.analytics = value,
            ConsentCategory::Marketing => self.marketing = value,
            ConsentCategory::Preferences => self.preferences = value,
        }
        self
    }

    /// Per-category transitions from `self` to `next`.
    pub fn diff(&self, next: &ConsentFlags) -> FlagsDiff {
        let mut diff = FlagsDiff::default();
        for category in ConsentCategory::OPTIONAL {
            match (self.allows(category), next.allows(category)) {
                (false, true) => diff.enabled.push(category),
                (true, false) => diff.disabled.push(category),
                _ => {}
            }
        }
        diff
    }

    pub fn declines_everything(&self) -> bool {
        ConsentCategory::OPTIONAL.iter().all(|category| !self.allows(*category))
    }
}

/// Categories that transitioned between two sets of flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagsDiff {
    /// false -> true
    pub enabled: Vec<ConsentCategory>,
    /// true -> false
    pub disabled: Vec<ConsentCategory>,
}

impl FlagsDiff {
    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty() && self.disabled.is_empty()
    }
}

/// A user decision, before it is stamped into a [`ConsentRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsentChoice(ConsentFlags);

impl ConsentChoice {
    pub fn accept_all() -> Self {
        Self(ConsentFlags::all())
    }

    pub fn decline_all() -> Self {
        Self(ConsentFlags::necessary_only())
    }

    pub fn custom(analytics: bool, marketing: bool, preferences: bool) -> Self {
        Self(ConsentFlags::new(analytics, marketing, preferences))
    }

    pub fn flags(&self) -> ConsentFlags {
        self.0
    }
}

impl From<ConsentFlags> for ConsentChoice {
    fn from(flags: ConsentFlags) -> Self {
        Self(flags)
    }
}

/// Where a consent change originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentSource {
    Banner,
    Settings,
    Api,
    /// Emitted by the gate itself when a stored record lapses.
    Expiry,
}

impl fmt::Display for ConsentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self {
            ConsentSource::Banner => "banner",
            ConsentSource::Settings => "settings",
            ConsentSource::Api => "api",
            ConsentSource::Expiry => "expiry",
        };
        f.write_str(source)
    }
}

/// Versioned, expiring record of a user's consent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentRecord {
    flags: ConsentFlags,
    granted_at: Option<DateTime<Utc>>,
    version: String,
    expires_at: Option<DateTime<Utc>>,
}

impl ConsentRecord {
    /// A record for a user who has not decided yet.
    pub fn undecided(policy_version: &str) -> Self {
        Self {
            flags: ConsentFlags::necessary_only(),
            granted_at: None,
            version: policy_version.to_string(),
            expires_at: None,
        }
    }

    /// Stamps `choice` at `now` under the given policy version.
    pub fn grant(
        choice: ConsentChoice,
        now: DateTime<Utc>,
        policy_version: &str,
        lifetime_months: u32,
    ) -> Self {
        Self {
            flags: choice.flags(),
            granted_at: Some(now),
            version: stamp_version(policy_version, now),
            expires_at: now.checked_add_months(Months::new(lifetime_months)),
        }
    }

    /// Overrides the expiry timestamp.
    pub fn with_expires_at(self, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { expires_at, ..self }
    }

    /// Effective flags: all optional categories read `false` until a decision exists.
    pub fn flags(&self) -> ConsentFlags {
        if self.granted_at.is_some() { self.flags } else { ConsentFlags::necessary_only() }
    }

    pub fn allows(&self, category: ConsentCategory) -> bool {
        self.flags().allows(category)
    }

    pub fn granted_at(&self) -> Option<DateTime<Utc>> {
        self.granted_at
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Revision part of the version (`<policy>@<revision>`), if any.
    pub fn revision(&self) -> Option<i64> {
        revision_of(&self.version)
    }

    /// Bumps the revision past `previous`'s, so versions strictly increase
    /// even when two decisions share a timestamp.
    pub fn succeeding(self, previous: Option<&ConsentRecord>) -> Self {
        let Some(floor) = previous.and_then(ConsentRecord::revision).map(|revision| revision.saturating_add(1))
        else {
            return self;
        };
        let revision = self.revision().map_or(floor, |revision| revision.max(floor));
        let version = format!("{}@{}", policy_of(&self.version), revision);
        Self { version, ..self }
    }

    /// Explicit expiry if set, otherwise `granted_at + 24 months`.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at.or_else(|| {
            self.granted_at
                .and_then(|granted_at| granted_at.checked_add_months(Months::new(DEFAULT_LIFETIME_MONTHS)))
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.granted_at, self.expires_at()) {
            (None, _) => true,
            (Some(_), Some(expires_at)) => now > expires_at,
            // granted_at + 24 months overflowed chrono's range
            (Some(_), None) => false,
        }
    }

    /// New record with every optional category off, stamped at `now`.
    pub fn withdraw(&self, now: DateTime<Utc>) -> Self {
        let lifetime = self
            .granted_at
            .zip(self.expires_at)
            .and_then(|(granted, expires)| months_between(granted, expires))
            .unwrap_or(DEFAULT_LIFETIME_MONTHS);
        Self {
            flags: ConsentFlags::necessary_only(),
            granted_at: Some(now),
            version: stamp_version(policy_of(&self.version), now),
            expires_at: now.checked_add_months(Months::new(lifetime)),
        }
        .succeeding(Some(self))
    }

    /// Persisted `{consent, timestamp, version, expiresAt}` shape.
    pub fn to_envelope(&self) -> ConsentEnvelope {
        ConsentEnvelope {
            consent: self.flags,
            timestamp: self.granted_at.map(|at| at.to_rfc3339()),
            version: self.version.clone(),
            expires_at: self.expires_at.map(|at| at.to_rfc3339()),
        }
    }
}

/// Wire form of a [`ConsentRecord`] in the persistent slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentEnvelope {
    pub consent: ConsentFlags,
    pub timestamp: Option<String>,
    pub version: String,
    pub expires_at: Option<String>,
}

/// Validates an untyped candidate (envelope or bare flags object).
///
/// Every issue is collected; the candidate is rejected if any flag is not a
/// boolean, a present timestamp does not parse, or a present version is not a
/// string. `necessary` is forced to `true` whatever the candidate says.
pub fn validate(candidate: &Value) -> Result<ConsentRecord, Vec<ValidationError>> {
    let Some(object) = candidate.as_object() else {
        return Err(vec![ValidationError::NotAnObject]);
    };
    let flags_object = match object.get("consent") {
        None => object,
        Some(Value::Object(flags)) => flags,
        Some(_) => return Err(vec![ValidationError::NotAnObject]),
    };

    let mut errors = Vec::new();
    if let Some(necessary) = flags_object.get("necessary")
        && !necessary.is_boolean()
    {
        errors.push(ValidationError::NotBoolean("necessary"));
    }
    let analytics = read_flag(flags_object, "analytics", &mut errors);
    let marketing = read_flag(flags_object, "marketing", &mut errors);
    let preferences = read_flag(flags_object, "preferences", &mut errors);

    let granted_at = match object.get("timestamp").or_else(|| object.get("grantedAt")) {
        None | Some(Value::Null) => None,
        Some(value) => parse_timestamp(value).or_else(|| {
            errors.push(ValidationError::InvalidTimestamp("timestamp"));
            None
        }),
    };
    let expires_at = match object.get("expiresAt") {
        None | Some(Value::Null) => None,
        Some(value) => parse_timestamp(value).or_else(|| {
            errors.push(ValidationError::InvalidTimestamp("expiresAt"));
            None
        }),
    };
    let version = match object.get("version") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(version)) => version.clone(),
        Some(_) => {
            errors.push(ValidationError::InvalidVersion);
            String::new()
        }
    };

    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(ConsentRecord {
        flags: ConsentFlags::new(analytics, marketing, preferences),
        granted_at,
        version,
        expires_at,
    })
}

/// Free-function form of [`ConsentRecord::is_expired`].
pub fn is_expired(record: &ConsentRecord, now: DateTime<Utc>) -> bool {
    record.is_expired(now)
}

/// Free-function form of [`ConsentRecord::withdraw`]. The input is left untouched.
pub fn withdraw(record: &ConsentRecord, now: DateTime<Utc>) -> ConsentRecord {
    record.withdraw(now)
}

fn read_flag(
    object: &Map<String, Value>,
    field: &'static str,
    errors: &mut Vec<ValidationError>,
) -> bool {
    match object.get(field) {
        Some(Value::Bool(value)) => *value,
        _ => {
            errors.push(ValidationError::NotBoolean(field));
            false
        }
    }
}

/// Accepts RFC 3339 strings and integer unix milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => {
            DateTime::parse_from_rfc3339(text).ok().map(|at| at.with_timezone(&Utc))
        }
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|millis| millis as i64))
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

fn stamp_version(policy_version: &str, now: DateTime<Utc>) -> String {
    format!("{}@{}", policy_version, now.timestamp_millis())
}

fn revision_of(version: &str) -> Option<i64> {
    version.split_once('@').and_then(|(_, revision)| revision.parse().ok())
}

fn policy_of(version: &str) -> &str {
    version.split_once('@').map_or(version, |(policy, _)| policy)
}

fn months_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Option<u32> {
    (1..=1200u32).find(|months| from.checked_add_months(Months::new(*months)) == Some(to))
}
