//! Domain types for the SiteGate site store.
//!
//! Storage field names are camelCase (`disabledUntil`) so the document stays
//! readable by the browser-side collaborator that shares the key layout.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A normalized host name: lowercase, no scheme, no path, no leading `www.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(pub String);

impl Domain {
    /// Normalize and validate user input such as `https://www.Example.com/path`.
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let normalized = normalize(input);
        validate(&normalized).map_err(|reason| DomainError::Invalid {
            input: input.to_owned(),
            reason,
        })?;
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `host` is this domain or one of its subdomains.
    ///
    /// Matching is on label boundaries: `notexample.com` does not match `example.com`.
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
        host == self.0
            || host
                .strip_suffix(self.0.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'))
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Domain {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<&str> for Domain {
    /// Wraps an already-normalized string without validation.
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

fn normalize(input: &str) -> String {
    let trimmed = input.trim();
    let lower = trimmed.to_ascii_lowercase();
    let without_scheme = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let without_www = without_scheme.strip_prefix("www.").unwrap_or(without_scheme);
    let host = without_www.split('/').next().unwrap_or_default();
    host.trim().to_owned()
}

fn validate(domain: &str) -> Result<(), &'static str> {
    if domain.len() <= 3 {
        return Err("too short");
    }
    if !domain.contains('.') {
        return Err("missing a dot");
    }
    if domain.chars().any(char::is_whitespace) {
        return Err("contains whitespace");
    }
    if domain.contains('/') {
        return Err("contains a path separator");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Persisted block state for one watched domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteRecord {
    pub domain: Domain,
    /// "User wants this blocked."
    pub enabled: bool,
    /// Still blocked until this instant, then free. Set when the user disables the domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<DateTime<Utc>>,
}

impl SiteRecord {
    /// New records start blocked.
    pub fn new(domain: Domain, added: DateTime<Utc>) -> Self {
        Self {
            domain,
            enabled: true,
            disabled_until: None,
            added: Some(added),
        }
    }
}

/// Label of a record in the toggle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteState {
    /// `enabled == true`.
    Blocked,
    /// Disabled, but the grace deadline is still in the future.
    Grace,
    /// Disabled and no live deadline.
    Free,
}

impl SiteState {
    pub fn is_blocked(self) -> bool {
        !matches!(self, SiteState::Free)
    }
}

impl fmt::Display for SiteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SiteState::Blocked => write!(f, "blocked"),
            SiteState::Grace => write!(f, "grace"),
            SiteState::Free => write!(f, "free"),
        }
    }
}

/// Status answer for a single domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteStatus {
    pub enabled: bool,
    pub is_in_delay: bool,
    /// Whole seconds left in the grace period, rounded up; 0 outside it.
    pub time_left: u64,
}

/// On-disk payload stored under the `sites` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSites {
    pub version: u32,
    #[serde(default)]
    pub sites: Vec<SiteRecord>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalizes_scheme_www_and_path() {
        let domain = Domain::parse("  https://www.YouTube.com/watch?v=1 ").expect("parse");
        assert_eq!(domain.as_str(), "youtube.com");
    }

    #[test]
    fn parse_rejects_bare_words_and_short_input() {
        assert!(Domain::parse("localhost").is_err());
        assert!(Domain::parse("a.b").is_err());
        assert!(Domain::parse("bad domain.com").is_err());
    }

    #[test]
    fn matches_host_on_label_boundary() {
        let domain = Domain::from("example.com");
        assert!(domain.matches_host("example.com"));
        assert!(domain.matches_host("www.example.com"));
        assert!(domain.matches_host("A.B.Example.COM"));
        assert!(!domain.matches_host("notexample.com"));
        assert!(!domain.matches_host("example.com.evil.net"));
    }

    #[test]
    fn record_uses_camel_case_keys() {
        let record = SiteRecord {
            domain: Domain::from("example.com"),
            enabled: false,
            disabled_until: Some(Utc::now()),
            added: None,
        };
        let json = serde_json::to_value(&record).expect("serialize");
        assert!(json.get("disabledUntil").is_some());
        assert!(json.get("added").is_none());
    }

    #[test]
    fn site_state_display() {
        assert_eq!(SiteState::Grace.to_string(), "grace");
        assert!(SiteState::Grace.is_blocked());
        assert!(!SiteState::Free.is_blocked());
    }
}
