//! Re-prompt throttling for the consent banner.
//!
//! The fatigue level grows with how often the banner was shown and how often
//! it was rejected: `min(show_count * 0.5 + rejections * 2, 10)`. Before the
//! banner may reappear, at least `base_delay * 2^min(level, 5)` (capped at
//! `max_delay`) must have elapsed since it was last shown.
//!
//! The backoff is monotonic but bounded, so the banner is never suppressed
//! for good and consent always stays revisitable.
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gate::core::record::ConsentRecord;

const MAX_FATIGUE_LEVEL: f64 = 10.0;
const MAX_BACKOFF_EXPONENT: f64 = 5.0;

/// How often the banner has been shown and turned down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptHistory {
    pub show_count: u32,
    pub rejections: u32,
    pub last_shown: Option<DateTime<Utc>>,
}

impl PromptHistory {
    pub fn record_shown(&mut self, now: DateTime<Utc>) {
        self.show_count = self.show_count.saturating_add(1);
        self.last_shown = Some(now);
    }

    pub fn record_rejection(&mut self) {
        self.rejections = self.rejections.saturating_add(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatiguePolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for FatiguePolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60), Duration::from_secs(30 * 24 * 60 * 60))
    }
}

impl FatiguePolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self { base_delay, max_delay }
    }

    /// Derived 0-10 score.
    pub fn fatigue_level(&self, history: &PromptHistory) -> f64 {
        (f64::from(history.show_count) * 0.5 + f64::from(history.rejections) * 2.0)
            .min(MAX_FATIGUE_LEVEL)
    }

    /// Minimum quiet period before the banner may be shown again.
    pub fn required_delay(&self, history: &PromptHistory) -> Duration {
        let exponent = self.fatigue_level(history).min(MAX_BACKOFF_EXPONENT);
        // Saturates at max_delay instead of overflowing Duration.
        Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * 2f64.powf(exponent))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    pub fn should_prompt(
        &self,
        history: &PromptHistory,
        consent: Option<&ConsentRecord>,
        now: DateTime<Utc>,
    ) -> bool {
        if consent.is_some_and(|record| !record.is_expired(now)) {
            return false;
        }
        let Some(last_shown) = history.last_shown else {
            return true;
        };
        // A last_shown in the future (clock skew) counts as zero elapsed time.
        let elapsed = (now - last_shown).to_std().unwrap_or(Duration::ZERO);
        elapsed > self.required_delay(history)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::gate::core::record::ConsentChoice;

    const HOUR: Duration = Duration::from_secs(3600);

    fn policy() -> FatiguePolicy {
        FatiguePolicy::new(HOUR, 24 * HOUR)
    }

    #[test]
    fn unit_fatigue_fresh_history_prompts() {
        assert!(policy().should_prompt(&PromptHistory::default(), None, Utc::now()));
    }

    #[test]
    fn unit_fatigue_valid_consent_suppresses_prompt() {
        let now = Utc::now();
        let record = ConsentRecord::grant(ConsentChoice::decline_all(), now, "1.0", 24);
        assert!(!policy().should_prompt(&PromptHistory::default(), Some(&record), now));

        let expired = record.with_expires_at(Some(now - TimeDelta::days(1)));
        assert!(policy().should_prompt(&PromptHistory::default(), Some(&expired), now));
    }

    #[test]
    fn unit_fatigue_backoff_grows_with_shows() {
        let now = Utc::now();
        let mut history = PromptHistory::default();
        history.record_shown(now);
        assert_eq!(policy().fatigue_level(&history), 0.5);
        // 1h * 2^0.5 ~ 1h25m
        assert!(!policy().should_prompt(&history, None, now + TimeDelta::hours(1)));
        assert!(policy().should_prompt(&history, None, now + TimeDelta::hours(2)));
    }

    #[test]
    fn unit_fatigue_backoff_is_capped_never_permanent() {
        let now = Utc::now();
        let history = PromptHistory { show_count: 4, rejections: 3, last_shown: Some(now) };
        assert_eq!(policy().fatigue_level(&history), 8.0);
        assert_eq!(policy().required_delay(&history), 24 * HOUR);
        assert!(!policy().should_prompt(&history, None, now + TimeDelta::hours(23)));
        assert!(policy().should_prompt(&history, None, now + TimeDelta::hours(25)));

        let exhausted = PromptHistory { show_count: 1000, rejections: 1000, last_shown: Some(now) };
        assert_eq!(policy().fatigue_level(&exhausted), 10.0);
        assert!(policy().should_prompt(&exhausted, None, now + TimeDelta::days(2)));
    }

    #[test]
    fn unit_fatigue_huge_base_delay_saturates_at_max() {
        let now = Utc::now();
        let max_delay = Duration::from_secs(30 * 24 * 3600);
        let policy = FatiguePolicy::new(Duration::MAX, max_delay);
        let history = PromptHistory { show_count: 10, rejections: 2, last_shown: Some(now) };
        assert_eq!(policy.required_delay(&history), max_delay);
        assert!(!policy.should_prompt(&history, None, now + TimeDelta::days(29)));
        assert!(policy.should_prompt(&history, None, now + TimeDelta::days(31)));
    }

    #[test]
    fn unit_fatigue_future_last_shown_waits() {
        let now = Utc::now();
        let history = PromptHistory { show_count: 0, rejections: 0, last_shown: Some(now + TimeDelta::minutes(5)) };
        assert!(!policy().should_prompt(&history, None, now));
    }
}
