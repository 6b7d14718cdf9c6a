//! Block-state evaluation.
//!
//! Everything here is pure: the caller supplies `now`. A deadline equal to
//! `now` has already passed, so ties resolve to "unblocked".

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::{Domain, SiteRecord, SiteState, SiteStatus};

/// `enabled || disabled_until > now`.
pub fn is_blocked(record: &SiteRecord, now: DateTime<Utc>) -> bool {
    record.enabled || in_grace(record, now)
}

/// State-machine label for `record` at `now`.
pub fn state_of(record: &SiteRecord, now: DateTime<Utc>) -> SiteState {
    if record.enabled {
        SiteState::Blocked
    } else if in_grace(record, now) {
        SiteState::Grace
    } else {
        SiteState::Free
    }
}

/// Time remaining in the grace period; zero unless the record is in [`SiteState::Grace`].
pub fn time_left(record: &SiteRecord, now: DateTime<Utc>) -> Duration {
    if record.enabled {
        return Duration::ZERO;
    }
    record
        .disabled_until
        .and_then(|until| (until - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

/// Whole seconds, rounded up. 30.2s left reads as 31.
pub fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

pub fn status_of(record: &SiteRecord, now: DateTime<Utc>) -> SiteStatus {
    let is_in_delay = in_grace(record, now);
    SiteStatus {
        enabled: record.enabled,
        is_in_delay,
        time_left: if is_in_delay {
            ceil_secs(time_left(record, now))
        } else {
            0
        },
    }
}

/// Domains of every record that currently evaluates to blocked, in store order.
pub fn blocked_domains(records: &[SiteRecord], now: DateTime<Utc>) -> Vec<Domain> {
    records
        .iter()
        .filter(|record| is_blocked(record, now))
        .map(|record| record.domain.clone())
        .collect()
}

fn in_grace(record: &SiteRecord, now: DateTime<Utc>) -> bool {
    !record.enabled && record.disabled_until.is_some_and(|until| until > now)
}
