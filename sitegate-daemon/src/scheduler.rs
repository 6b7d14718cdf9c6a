//! Per-domain delay timers.
//!
//! At most one timer is live per domain. Each arm gets a fresh generation
//! number; events from an older generation are stale and must be dropped by
//! the consumer (`is_current` / `complete`). The scheduler never reads or
//! writes the site store: it only reports ticks and expiries over a channel.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use sitegate_core::evaluator::ceil_secs;
use sitegate_core::Domain;

/// Upper bound for a single timer, well inside what `Instant` can represent.
const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayEvent {
    /// Periodic progress while the delay is running.
    Tick {
        domain: Domain,
        generation: u64,
        time_left: u64,
    },
    /// The delay ran out. Sent once per arm.
    Expired { domain: Domain, generation: u64 },
}

impl DelayEvent {
    pub fn domain(&self) -> &Domain {
        match self {
            DelayEvent::Tick { domain, .. } | DelayEvent::Expired { domain, .. } => domain,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            DelayEvent::Tick { generation, .. } | DelayEvent::Expired { generation, .. } => {
                *generation
            }
        }
    }
}

#[derive(Debug)]
struct DelayTimer {
    generation: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct DelayScheduler {
    timers: HashMap<Domain, DelayTimer>,
    events: mpsc::UnboundedSender<DelayEvent>,
    tick_interval: Duration,
    next_generation: u64,
}

impl DelayScheduler {
    pub fn new(tick_interval: Duration) -> (Self, mpsc::UnboundedReceiver<DelayEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            timers: HashMap::new(),
            events,
            tick_interval,
            next_generation: 0,
        };
        (scheduler, rx)
    }

    /// Start a countdown of `duration` for `domain`, replacing any running one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(&mut self, domain: Domain, duration: Duration) -> u64 {
        if self.cancel(&domain) {
            tracing::debug!(domain = %domain, "replacing running delay timer");
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let now = Instant::now();
        let deadline = now.checked_add(duration).unwrap_or_else(|| {
            tracing::warn!(domain = %domain, "delay too long for the timer; clamping");
            now + MAX_DELAY
        });
        let handle = tokio::spawn(run_delay(
            domain.clone(),
            generation,
            deadline,
            self.tick_interval,
            self.events.clone(),
        ));

        tracing::debug!(
            domain = %domain,
            generation,
            time_left = ceil_secs(duration),
            "delay timer armed",
        );
        self.timers.insert(
            domain,
            DelayTimer {
                generation,
                deadline,
                handle,
            },
        );
        generation
    }

    /// Stop and forget the timer for `domain`. Returns `false` if none was running.
    pub fn cancel(&mut self, domain: &Domain) -> bool {
        match self.timers.remove(domain) {
            Some(timer) => {
                timer.handle.abort();
                tracing::debug!(domain = %domain, generation = timer.generation, "delay timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }

    pub fn is_armed(&self, domain: &Domain) -> bool {
        self.timers.contains_key(domain)
    }

    /// True if `generation` is the live timer for `domain`.
    pub fn is_current(&self, domain: &Domain, generation: u64) -> bool {
        self.timers
            .get(domain)
            .is_some_and(|timer| timer.generation == generation)
    }

    /// Retire the live timer after its expiry event. Returns `false` for stale
    /// generations, so each arm is finalized at most once.
    pub fn complete(&mut self, domain: &Domain, generation: u64) -> bool {
        if !self.is_current(domain, generation) {
            return false;
        }
        self.timers.remove(domain);
        true
    }

    pub fn remaining(&self, domain: &Domain) -> Option<Duration> {
        self.timers
            .get(domain)
            .map(|timer| timer.deadline.saturating_duration_since(Instant::now()))
    }

    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    pub fn armed_domains(&self) -> Vec<Domain> {
        let mut domains: Vec<Domain> = self.timers.keys().cloned().collect();
        domains.sort();
        domains
    }
}

impl Drop for DelayScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn run_delay(
    domain: Domain,
    generation: u64,
    deadline: Instant,
    tick_interval: Duration,
    events: mpsc::UnboundedSender<DelayEvent>,
) {
    let expiry = tokio::time::sleep_until(deadline);
    tokio::pin!(expiry);

    let mut ticker = tokio::time::interval_at(Instant::now() + tick_interval, tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // Expiry wins a tie with the last tick.
            biased;
            () = &mut expiry => break,
            _ = ticker.tick() => {
                let time_left = ceil_secs(deadline.saturating_duration_since(Instant::now()));
                if time_left == 0 {
                    continue;
                }
                let tick = DelayEvent::Tick {
                    domain: domain.clone(),
                    generation,
                    time_left,
                };
                if events.send(tick).is_err() {
                    return;
                }
            }
        }
    }

    let _ = events.send(DelayEvent::Expired { domain, generation });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn example() -> Domain {
        Domain::from("example.com")
    }

    async fn next_expired(rx: &mut mpsc::UnboundedReceiver<DelayEvent>) -> DelayEvent {
        loop {
            let event = rx.recv().await.expect("scheduler channel open");
            if matches!(event, DelayEvent::Expired { .. }) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_fires_once_after_duration() {
        let (mut scheduler, mut rx) = DelayScheduler::new(Duration::from_secs(1));
        let started = Instant::now();
        let generation = scheduler.arm(example(), Duration::from_secs(5));

        let event = next_expired(&mut rx).await;
        assert_eq!(
            event,
            DelayEvent::Expired {
                domain: example(),
                generation
            }
        );
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert!(scheduler.complete(&example(), generation));
        assert!(!scheduler.complete(&example(), generation), "second completion is stale");
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_delay_is_clamped_instead_of_overflowing() {
        let (mut scheduler, _rx) = DelayScheduler::new(Duration::from_secs(1));
        scheduler.arm(example(), Duration::MAX);
        assert!(scheduler.is_armed(&example()));
        assert_eq!(scheduler.remaining(&example()), Some(MAX_DELAY));
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_count_down_each_second() {
        let (mut scheduler, mut rx) = DelayScheduler::new(Duration::from_secs(1));
        scheduler.arm(example(), Duration::from_secs(4));

        let mut seen = Vec::new();
        loop {
            match rx.recv().await.expect("event") {
                DelayEvent::Tick { time_left, .. } => seen.push(time_left),
                DelayEvent::Expired { .. } => break,
            }
        }
        assert_eq!(seen, vec![3, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_keeps_exactly_one_pending_expiry_with_later_duration() {
        let (mut scheduler, mut rx) = DelayScheduler::new(Duration::from_secs(1));
        let started = Instant::now();
        let first = scheduler.arm(example(), Duration::from_secs(60));
        let second = scheduler.arm(example(), Duration::from_secs(10));

        assert_ne!(first, second);
        assert_eq!(scheduler.pending(), 1);
        assert!(!scheduler.is_current(&example(), first));
        assert!(scheduler.is_current(&example(), second));

        let event = next_expired(&mut rx).await;
        assert_eq!(event.generation(), second);
        assert_eq!(started.elapsed(), Duration::from_secs(10));

        assert!(scheduler.complete(&example(), second));
        advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, DelayEvent::Expired { .. }),
                "the first arm must never expire: {event:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_without_timer_is_noop() {
        let (mut scheduler, mut rx) = DelayScheduler::new(Duration::from_secs(1));
        assert!(!scheduler.cancel(&example()));
        assert_eq!(scheduler.pending(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_expires() {
        let (mut scheduler, mut rx) = DelayScheduler::new(Duration::from_secs(1));
        scheduler.arm(example(), Duration::from_secs(3));
        assert!(scheduler.cancel(&example()));

        advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "aborted timer must stay silent");
        assert!(!scheduler.is_armed(&example()));
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_reports_time_to_deadline() {
        let (mut scheduler, _rx) = DelayScheduler::new(Duration::from_secs(1));
        scheduler.arm(example(), Duration::from_secs(10));
        advance(Duration::from_secs(4)).await;
        assert_eq!(scheduler.remaining(&example()), Some(Duration::from_secs(6)));
        assert_eq!(scheduler.remaining(&Domain::from("other.com")), None);
    }
}
