//! Notification deduplication for pending updates.
//!
//! History comes only from the previous, already persisted snapshot, so a run never sees
//! its own deliveries.

use crate::error::{EngineError, Result};
use crate::notifier::{Notification, Notifier};
use crate::state::{NotificationRecord, UpdateCandidate};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::fmt;
use tracing::{info, warn};

/// Minimum time between two notifications for the same workload, written as `<n>h`,
/// `<n>d` or `<n>w`.
#[derive(Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct ReminderInterval {
    magnitude: u32,
    unit: char,
}

impl ReminderInterval {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = |reason: &str| {
            EngineError::Config(format!("invalid reminder interval '{}': {}", s, reason))
        };

        let unit = s.chars().last().ok_or_else(|| invalid("empty value"))?;
        if !matches!(unit, 'h' | 'd' | 'w') {
            return Err(invalid("unit must be one of h, d, w"));
        }
        let digits = &s[..s.len() - unit.len_utf8()];
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("magnitude must be a non-negative integer"));
        }
        let magnitude = digits
            .parse::<u32>()
            .map_err(|_| invalid("magnitude must be a non-negative integer"))?;

        Ok(Self { magnitude, unit })
    }

    pub fn as_duration(&self) -> Duration {
        let magnitude = i64::from(self.magnitude);
        match self.unit {
            'h' => Duration::hours(magnitude),
            'd' => Duration::days(magnitude),
            _ => Duration::weeks(magnitude),
        }
    }
}

impl TryFrom<String> for ReminderInterval {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        ReminderInterval::parse(&value)
    }
}

impl fmt::Display for ReminderInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.magnitude, self.unit)
    }
}

impl fmt::Debug for ReminderInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReminderInterval({})", self)
    }
}

/// Most recent delivery recorded for the candidate's workload identity. The tag is
/// irrelevant: a workload stuck with a pending update is tracked once.
pub fn last_sent(
    candidate: &UpdateCandidate,
    history: &[NotificationRecord],
) -> Option<DateTime<Utc>> {
    history
        .iter()
        .filter(|record| &record.workload_key == candidate.key())
        .map(|record| record.last_sent_time)
        .max()
}

pub fn should_notify(
    candidate: &UpdateCandidate,
    history: &[NotificationRecord],
    reminder: &ReminderInterval,
    now: DateTime<Utc>,
) -> bool {
    match last_sent(candidate, history) {
        None => true,
        Some(last) => now - last >= reminder.as_duration(),
    }
}

/// Outcome of passing one candidate through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Sent,
    Suppressed,
    DispatchFailed,
}

/// Gates, dispatches and stamps `sent_time`.
///
/// A delivered notification stamps the dispatch time. A suppressed candidate carries the
/// previous delivery time forward so the reminder window keeps counting from it. A failed
/// dispatch leaves `sent_time` empty and the next run retries.
pub async fn process(
    candidate: &mut UpdateCandidate,
    history: &[NotificationRecord],
    reminder: &ReminderInterval,
    notifier: &dyn Notifier,
    priority: u8,
    now: DateTime<Utc>,
) -> GateOutcome {
    if !should_notify(candidate, history, reminder, now) {
        info!(
            "Skipping notification for {}: reminder interval {} not reached",
            candidate.key(),
            reminder
        );
        candidate.sent_time = last_sent(candidate, history);
        return GateOutcome::Suppressed;
    }

    let notification = Notification::update_available(candidate, priority);
    match notifier.send(&notification).await {
        Ok(dispatched_at) => {
            info!(
                "Sent update notification for {} ({} -> {})",
                candidate.key(),
                candidate.current_tag,
                candidate.new_tag
            );
            candidate.sent_time = Some(dispatched_at);
            GateOutcome::Sent
        }
        Err(e) => {
            warn!(
                "Failed to send notification for {}, will retry next run: {}",
                candidate.key(),
                e
            );
            candidate.sent_time = None;
            GateOutcome::DispatchFailed
        }
    }
}
