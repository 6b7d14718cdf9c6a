//! Block-state propagation to observers.
//!
//! Observers subscribe with the host they display (a browser tab, a status bar
//! widget, a CLI `watch`). They only see notifications for domains that match
//! that host. Publishing never fails the caller: a send with nobody listening is
//! logged and dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};

use sitegate_core::Domain;

pub const DEFAULT_CAPACITY: usize = 256;

/// Outbound message. Serialized with an `action` tag, e.g.
/// `{"action":"updateCountdown","domain":"example.com","timeLeft":42}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Notification {
    #[serde(rename_all = "camelCase")]
    UpdateCountdown { domain: Domain, time_left: u64 },
    SiteBlocked { domain: Domain },
    SiteUnblocked { domain: Domain },
}

impl Notification {
    pub fn domain(&self) -> &Domain {
        match self {
            Notification::UpdateCountdown { domain, .. }
            | Notification::SiteBlocked { domain }
            | Notification::SiteUnblocked { domain } => domain,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcast to current subscribers; returns how many received it.
    pub fn publish(&self, notification: Notification) -> usize {
        match self.tx.send(notification) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(dropped)) => {
                tracing::debug!(
                    domain = %dropped.domain(),
                    "no observers subscribed; notification dropped",
                );
                0
            }
        }
    }

    /// Subscribe to notifications whose domain matches `host`; `None` receives all.
    pub fn subscribe(&self, host: Option<String>) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            host: host.map(|h| h.trim().to_ascii_lowercase()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Notification>,
    host: Option<String>,
}

impl Subscription {
    /// Next matching notification, or `None` once the notifier is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(notification) if self.accepts(&notification) => return Some(notification),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, host = ?self.host, "notification subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching notification that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.try_recv() {
                Ok(notification) if self.accepts(&notification) => return Some(notification),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, host = ?self.host, "notification subscriber lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    fn accepts(&self, notification: &Notification) -> bool {
        self.host
            .as_deref()
            .map_or(true, |host| notification.domain().matches_host(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn countdown(domain: &str, time_left: u64) -> Notification {
        Notification::UpdateCountdown {
            domain: Domain::from(domain),
            time_left,
        }
    }

    #[test]
    fn publish_without_subscribers_is_swallowed() {
        let notifier = Notifier::new(8);
        assert_eq!(notifier.publish(countdown("example.com", 60)), 0);
    }

    #[tokio::test]
    async fn subscription_filters_by_host() {
        let notifier = Notifier::new(8);
        let mut tab = notifier.subscribe(Some("www.Example.com".to_owned()));

        notifier.publish(countdown("other.org", 10));
        notifier.publish(Notification::SiteUnblocked {
            domain: Domain::from("example.com"),
        });

        assert_eq!(
            tab.recv().await,
            Some(Notification::SiteUnblocked {
                domain: Domain::from("example.com")
            })
        );
    }

    #[tokio::test]
    async fn unfiltered_subscription_sees_everything() {
        let notifier = Notifier::new(8);
        let mut all = notifier.subscribe(None);
        notifier.publish(countdown("a-site.com", 3));
        notifier.publish(countdown("b-site.com", 2));
        assert_eq!(all.recv().await, Some(countdown("a-site.com", 3)));
        assert_eq!(all.recv().await, Some(countdown("b-site.com", 2)));
    }

    #[tokio::test]
    async fn lagged_subscriber_keeps_receiving() {
        let notifier = Notifier::new(2);
        let mut slow = notifier.subscribe(None);
        for left in (1..=5).rev() {
            notifier.publish(countdown("example.com", left));
        }
        assert_eq!(slow.recv().await, Some(countdown("example.com", 2)));
        assert_eq!(slow.recv().await, Some(countdown("example.com", 1)));
    }

    #[test]
    fn notification_wire_format() {
        let json = serde_json::to_value(countdown("example.com", 42)).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({"action": "updateCountdown", "domain": "example.com", "timeLeft": 42})
        );
        let blocked = serde_json::to_value(Notification::SiteBlocked {
            domain: Domain::from("example.com"),
        })
        .expect("serialize");
        assert_eq!(blocked["action"], "siteBlocked");
    }
}
