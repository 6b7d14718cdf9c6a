//! The gate controller: toggle state machine, delay finalization and recovery.
//!
//! ```text
//!   Blocked --disable--> Grace --expiry--> Free
//!      ^                   |                 |
//!      +------enable-------+-------enable----+
//! ```
//!
//! The store is the single source of truth. Every mutation saves first and
//! only then touches the scheduler and the notifier, so a failed write leaves
//! no timer or notification behind. Timer events are re-validated against the
//! store before acting on them.
//!
//! [`spawn`] runs a [`SiteGate`] on its own task and hands out [`GateHandle`]s.
//! All requests funnel through one queue, so mutations never interleave.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use sitegate_core::config::MAX_GRACE_PERIOD_SECS;
use sitegate_core::evaluator::{self, ceil_secs, state_of, status_of, time_left};
use sitegate_core::{Domain, GateConfig, SiteRecord, SiteState, SiteStatus};

use crate::clock::Clock;
use crate::error::GateError;
use crate::notifier::{Notification, Notifier};
use crate::repository::SiteRepository;
use crate::scheduler::{DelayEvent, DelayScheduler};

const COMMAND_QUEUE: usize = 64;

/// Delay before retrying an expiry whose store update failed.
const FINALIZE_RETRY_DELAY: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToggleOutcome {
    pub success: bool,
    pub sites: Vec<SiteRecord>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForceUnblockOutcome {
    pub success: bool,
    pub sites: Vec<SiteRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub blocked: bool,
}

/// What a recovery or reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Grace records given a timer for their remaining time.
    pub rearmed: Vec<Domain>,
    /// Records whose deadline had already passed, now free.
    pub finalized: Vec<Domain>,
    /// Timers dropped because their record left the grace period.
    pub cancelled: Vec<Domain>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.rearmed.is_empty() && self.finalized.is_empty() && self.cancelled.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateInfo {
    pub pending_delays: Vec<Domain>,
    pub observers: usize,
    pub grace_period_secs: u64,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct SiteGate {
    repo: Arc<dyn SiteRepository>,
    clock: Arc<dyn Clock>,
    scheduler: DelayScheduler,
    notifier: Notifier,
    grace_period: Duration,
}

impl SiteGate {
    /// Build a gate; the returned receiver carries the scheduler's timer events
    /// and must be fed back through [`SiteGate::handle_delay_event`].
    pub fn new(
        repo: Arc<dyn SiteRepository>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        config: &GateConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DelayEvent>) {
        let (scheduler, events) = DelayScheduler::new(config.tick_interval());
        let gate = Self {
            repo,
            clock,
            scheduler,
            notifier,
            grace_period: config
                .grace_period()
                .min(Duration::from_secs(MAX_GRACE_PERIOD_SECS)),
        };
        (gate, events)
    }

    pub fn scheduler(&self) -> &DelayScheduler {
        &self.scheduler
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn info(&self) -> GateInfo {
        GateInfo {
            pending_delays: self.scheduler.armed_domains(),
            observers: self.notifier.subscriber_count(),
            grace_period_secs: self.grace_period.as_secs(),
        }
    }

    pub async fn get_sites(&self) -> Result<Vec<SiteRecord>, GateError> {
        Ok(self.repo.load().await?)
    }

    /// `enabled = true` blocks at once; `enabled = false` starts the grace period.
    pub async fn toggle_site(
        &mut self,
        domain: &Domain,
        enabled: bool,
    ) -> Result<ToggleOutcome, GateError> {
        if enabled {
            self.enable(domain).await
        } else {
            self.disable(domain).await
        }
    }

    pub async fn get_site_status(&self, domain: &Domain) -> Result<SiteStatus, GateError> {
        let sites = self.repo.load().await?;
        let record = find(&sites, domain)?;
        Ok(status_of(record, self.clock.now()))
    }

    pub async fn get_blocked_sites(&self) -> Result<Vec<Domain>, GateError> {
        let sites = self.repo.load().await?;
        Ok(evaluator::blocked_domains(&sites, self.clock.now()))
    }

    /// True if `host` is a blocked domain or a subdomain of one.
    pub async fn check_site_blocked(&self, host: &str) -> Result<bool, GateError> {
        let sites = self.repo.load().await?;
        let now = self.clock.now();
        let host = Domain::parse(host)
            .map(|domain| domain.0)
            .unwrap_or_else(|_| host.trim().to_ascii_lowercase());
        Ok(sites
            .iter()
            .any(|record| evaluator::is_blocked(record, now) && record.domain.matches_host(&host)))
    }

    /// Administrative override: free the domain now, whatever its state.
    pub async fn force_unblock_site(
        &mut self,
        domain: &Domain,
    ) -> Result<ForceUnblockOutcome, GateError> {
        let mut sites = self.repo.load().await?;
        let record = find_mut(&mut sites, domain)?;
        record.enabled = false;
        record.disabled_until = None;
        self.repo.save(&sites).await?;

        self.scheduler.cancel(domain);
        self.notifier.publish(Notification::SiteUnblocked {
            domain: domain.clone(),
        });
        tracing::info!(domain = %domain, "site force-unblocked");
        Ok(ForceUnblockOutcome {
            success: true,
            sites,
        })
    }

    /// Start watching a new domain. New sites are blocked.
    pub async fn add_site(&mut self, domain: &Domain) -> Result<Vec<SiteRecord>, GateError> {
        let mut sites = self.repo.load().await?;
        if sites.iter().any(|record| &record.domain == domain) {
            return Err(GateError::AlreadyExists(domain.clone()));
        }
        sites.push(SiteRecord::new(domain.clone(), self.clock.now()));
        self.repo.save(&sites).await?;

        self.notifier.publish(Notification::SiteBlocked {
            domain: domain.clone(),
        });
        tracing::info!(domain = %domain, "site added");
        Ok(sites)
    }

    pub async fn remove_site(&mut self, domain: &Domain) -> Result<Vec<SiteRecord>, GateError> {
        let mut sites = self.repo.load().await?;
        let index = sites
            .iter()
            .position(|record| &record.domain == domain)
            .ok_or_else(|| GateError::NotFound(domain.clone()))?;
        let removed = sites.remove(index);
        self.repo.save(&sites).await?;

        self.scheduler.cancel(domain);
        if evaluator::is_blocked(&removed, self.clock.now()) {
            self.notifier.publish(Notification::SiteUnblocked {
                domain: domain.clone(),
            });
        }
        tracing::info!(domain = %domain, "site removed");
        Ok(sites)
    }

    async fn enable(&mut self, domain: &Domain) -> Result<ToggleOutcome, GateError> {
        let mut sites = self.repo.load().await?;
        let record = find_mut(&mut sites, domain)?;
        record.enabled = true;
        record.disabled_until = None;
        self.repo.save(&sites).await?;

        if self.scheduler.cancel(domain) {
            tracing::debug!(domain = %domain, "grace period abandoned");
        }
        self.notifier.publish(Notification::SiteBlocked {
            domain: domain.clone(),
        });
        tracing::info!(domain = %domain, "site is now blocked");
        Ok(ToggleOutcome {
            success: true,
            sites,
            message: "Site is now blocked".to_owned(),
        })
    }

    async fn disable(&mut self, domain: &Domain) -> Result<ToggleOutcome, GateError> {
        let now = self.clock.now();
        let mut sites = self.repo.load().await?;
        let record = find_mut(&mut sites, domain)?;

        match state_of(record, now) {
            SiteState::Free => {
                return Ok(ToggleOutcome {
                    success: true,
                    sites,
                    message: "Site is already unblocked".to_owned(),
                });
            }
            SiteState::Grace => {
                // The running deadline stands; only make sure a timer backs it.
                let remaining = time_left(record, now);
                if !self.scheduler.is_armed(domain) {
                    self.scheduler.arm(domain.clone(), remaining);
                }
                return Ok(ToggleOutcome {
                    success: true,
                    sites,
                    message: unblock_message(ceil_secs(remaining)),
                });
            }
            SiteState::Blocked => {}
        }

        record.enabled = false;
        record.disabled_until = Some(now + wall_duration(self.grace_period));
        self.repo.save(&sites).await?;

        self.scheduler.arm(domain.clone(), self.grace_period);
        let secs = ceil_secs(self.grace_period);
        self.notifier.publish(Notification::UpdateCountdown {
            domain: domain.clone(),
            time_left: secs,
        });
        tracing::info!(domain = %domain, time_left = secs, "grace period started");
        Ok(ToggleOutcome {
            success: true,
            sites,
            message: unblock_message(secs),
        })
    }

    // -----------------------------------------------------------------------
    // Timer events
    // -----------------------------------------------------------------------

    /// React to a scheduler event. Stale events (older generation, record
    /// removed or re-enabled) are dropped without error.
    pub async fn handle_delay_event(&mut self, event: DelayEvent) -> Result<(), GateError> {
        match event {
            DelayEvent::Tick {
                domain, generation, ..
            } => {
                if !self.scheduler.is_current(&domain, generation) {
                    tracing::trace!(domain = %domain, generation, "stale tick dropped");
                    return Ok(());
                }
                self.on_tick(&domain).await
            }
            DelayEvent::Expired { domain, generation } => {
                if !self.scheduler.is_current(&domain, generation) {
                    tracing::trace!(domain = %domain, generation, "stale expiry dropped");
                    return Ok(());
                }
                tracing::debug!(domain = %domain, "grace period expired");
                let result = self.finalize_expired(&domain, generation).await;
                if let Err(err) = &result {
                    tracing::warn!(
                        domain = %domain,
                        error = %err,
                        retry_in_secs = FINALIZE_RETRY_DELAY.as_secs(),
                        "failed to finalize expired delay; retrying",
                    );
                    self.scheduler.arm(domain, FINALIZE_RETRY_DELAY);
                }
                result
            }
        }
    }

    async fn on_tick(&mut self, domain: &Domain) -> Result<(), GateError> {
        let now = self.clock.now();
        let sites = self.repo.load().await?;
        let Some(record) = sites.iter().find(|record| &record.domain == domain) else {
            tracing::debug!(domain = %domain, "site removed during grace period");
            self.scheduler.cancel(domain);
            return Ok(());
        };

        match state_of(record, now) {
            SiteState::Grace => {
                self.notifier.publish(Notification::UpdateCountdown {
                    domain: domain.clone(),
                    time_left: ceil_secs(time_left(record, now)),
                });
            }
            // Deadline passed; the expiry event finalizes.
            SiteState::Free if record.disabled_until.is_some() => {}
            _ => {
                tracing::debug!(domain = %domain, "site left grace period; dropping timer");
                self.scheduler.cancel(domain);
            }
        }
        Ok(())
    }

    /// The timer stays registered until the store reflects the expiry, so a
    /// failed load or save can be retried.
    async fn finalize_expired(&mut self, domain: &Domain, generation: u64) -> Result<(), GateError> {
        let now = self.clock.now();
        let mut sites = self.repo.load().await?;
        let Some(record) = sites.iter_mut().find(|record| &record.domain == domain) else {
            tracing::debug!(domain = %domain, "expired site no longer exists; nothing to do");
            self.scheduler.complete(domain, generation);
            return Ok(());
        };
        if record.enabled {
            tracing::debug!(domain = %domain, "expired site was re-enabled; nothing to do");
            self.scheduler.complete(domain, generation);
            return Ok(());
        }
        let Some(until) = record.disabled_until else {
            tracing::debug!(domain = %domain, "expired site already free");
            self.scheduler.complete(domain, generation);
            return Ok(());
        };
        if until > now {
            let remaining = remaining_until(until, now);
            tracing::debug!(
                domain = %domain,
                time_left = ceil_secs(remaining),
                "deadline is later than the timer; re-arming",
            );
            self.scheduler.arm(domain.clone(), remaining);
            return Ok(());
        }

        record.disabled_until = None;
        self.repo.save(&sites).await?;
        self.scheduler.complete(domain, generation);
        self.notifier.publish(Notification::SiteUnblocked {
            domain: domain.clone(),
        });
        tracing::info!(domain = %domain, "site is now fully unblocked");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Rebuild timers from the store.
    ///
    /// Grace records get a timer for their *remaining* time; records whose
    /// deadline passed while nobody was watching are finalized at once; timers
    /// whose record is no longer in grace are dropped. Safe to run repeatedly.
    pub async fn recover(&mut self) -> Result<RecoveryReport, GateError> {
        let now = self.clock.now();
        let mut sites = self.repo.load().await?;
        let mut report = RecoveryReport::default();
        let mut rearm = Vec::new();

        for record in &sites {
            match state_of(record, now) {
                SiteState::Grace => {
                    let remaining = time_left(record, now);
                    if self.needs_rearm(&record.domain, remaining) {
                        rearm.push((record.domain.clone(), remaining));
                    }
                }
                SiteState::Free if record.disabled_until.is_some() => {
                    report.finalized.push(record.domain.clone());
                }
                _ => {}
            }
        }

        // Persist first: a failed save must leave timers and observers untouched.
        if !report.finalized.is_empty() {
            for record in sites.iter_mut() {
                if report.finalized.contains(&record.domain) {
                    record.disabled_until = None;
                }
            }
            self.repo.save(&sites).await?;
        }

        for (domain, remaining) in rearm {
            tracing::info!(
                domain = %domain,
                time_left = ceil_secs(remaining),
                "restoring delay timer",
            );
            self.scheduler.arm(domain.clone(), remaining);
            self.notifier.publish(Notification::UpdateCountdown {
                domain: domain.clone(),
                time_left: ceil_secs(remaining),
            });
            report.rearmed.push(domain);
        }

        for domain in self.scheduler.armed_domains() {
            let in_grace = sites
                .iter()
                .any(|record| record.domain == domain && state_of(record, now) == SiteState::Grace);
            if !in_grace && !report.finalized.contains(&domain) {
                self.scheduler.cancel(&domain);
                report.cancelled.push(domain);
            }
        }

        for domain in &report.finalized {
            tracing::info!(domain = %domain, "cleaning up delay that expired while stopped");
            self.scheduler.cancel(domain);
            self.notifier.publish(Notification::SiteUnblocked {
                domain: domain.clone(),
            });
        }

        Ok(report)
    }

    fn needs_rearm(&self, domain: &Domain, remaining: Duration) -> bool {
        match self.scheduler.remaining(domain) {
            None => true,
            Some(scheduled) => {
                let drift = if scheduled > remaining {
                    scheduled - remaining
                } else {
                    remaining - scheduled
                };
                drift > Duration::from_secs(1)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Request dispatch
    // -----------------------------------------------------------------------

    pub async fn execute(&mut self, request: GateRequest) -> Result<GateReply, GateError> {
        match request {
            GateRequest::GetSites => self.get_sites().await.map(GateReply::Sites),
            GateRequest::ToggleSite { domain, enabled } => self
                .toggle_site(&domain, enabled)
                .await
                .map(GateReply::Toggled),
            GateRequest::GetSiteStatus { domain } => {
                self.get_site_status(&domain).await.map(GateReply::Status)
            }
            GateRequest::GetBlockedSites => {
                self.get_blocked_sites().await.map(GateReply::Blocked)
            }
            GateRequest::CheckSiteBlocked { host } => self
                .check_site_blocked(&host)
                .await
                .map(|blocked| GateReply::Check(CheckOutcome { blocked })),
            GateRequest::ForceUnblockSite { domain } => self
                .force_unblock_site(&domain)
                .await
                .map(GateReply::ForceUnblocked),
            GateRequest::AddSite { domain } => self.add_site(&domain).await.map(GateReply::Sites),
            GateRequest::RemoveSite { domain } => {
                self.remove_site(&domain).await.map(GateReply::Sites)
            }
            GateRequest::Reconcile => self.recover().await.map(GateReply::Recovered),
            GateRequest::Info => Ok(GateReply::Info(self.info())),
        }
    }
}

fn find<'a>(sites: &'a [SiteRecord], domain: &Domain) -> Result<&'a SiteRecord, GateError> {
    sites
        .iter()
        .find(|record| &record.domain == domain)
        .ok_or_else(|| GateError::NotFound(domain.clone()))
}

fn find_mut<'a>(
    sites: &'a mut [SiteRecord],
    domain: &Domain,
) -> Result<&'a mut SiteRecord, GateError> {
    sites
        .iter_mut()
        .find(|record| &record.domain == domain)
        .ok_or_else(|| GateError::NotFound(domain.clone()))
}

fn unblock_message(secs: u64) -> String {
    format!("Site will be unblocked in {secs} seconds")
}

fn wall_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::seconds(MAX_GRACE_PERIOD_SECS as i64))
}

fn remaining_until(until: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (until - now).to_std().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Single-writer task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRequest {
    GetSites,
    ToggleSite { domain: Domain, enabled: bool },
    GetSiteStatus { domain: Domain },
    GetBlockedSites,
    CheckSiteBlocked { host: String },
    ForceUnblockSite { domain: Domain },
    AddSite { domain: Domain },
    RemoveSite { domain: Domain },
    Reconcile,
    Info,
}

/// Reply payloads; serialized untagged so the socket sends the inner value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum GateReply {
    Sites(Vec<SiteRecord>),
    Toggled(ToggleOutcome),
    Status(SiteStatus),
    Blocked(Vec<Domain>),
    Check(CheckOutcome),
    ForceUnblocked(ForceUnblockOutcome),
    Recovered(RecoveryReport),
    Info(GateInfo),
}

impl GateReply {
    fn kind(&self) -> &'static str {
        match self {
            GateReply::Sites(_) => "sites",
            GateReply::Toggled(_) => "toggled",
            GateReply::Status(_) => "status",
            GateReply::Blocked(_) => "blocked",
            GateReply::Check(_) => "check",
            GateReply::ForceUnblocked(_) => "force_unblocked",
            GateReply::Recovered(_) => "recovered",
            GateReply::Info(_) => "info",
        }
    }
}

struct GateCommand {
    request: GateRequest,
    respond_to: oneshot::Sender<Result<GateReply, GateError>>,
}

/// Cloneable front door to a running gate task.
#[derive(Debug, Clone)]
pub struct GateHandle {
    tx: mpsc::Sender<GateCommand>,
}

impl std::fmt::Debug for GateCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateCommand")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

macro_rules! expect_reply {
    ($reply:expr, $variant:path) => {
        match $reply {
            $variant(value) => Ok(value),
            other => Err(GateError::UnexpectedReply(other.kind())),
        }
    };
}

impl GateHandle {
    pub async fn request(&self, request: GateRequest) -> Result<GateReply, GateError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(GateCommand {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|_| GateError::ChannelClosed("gate queue"))?;
        rx.await
            .map_err(|_| GateError::ChannelClosed("gate response"))?
    }

    pub async fn get_sites(&self) -> Result<Vec<SiteRecord>, GateError> {
        expect_reply!(self.request(GateRequest::GetSites).await?, GateReply::Sites)
    }

    pub async fn toggle_site(&self, domain: Domain, enabled: bool) -> Result<ToggleOutcome, GateError> {
        expect_reply!(
            self.request(GateRequest::ToggleSite { domain, enabled }).await?,
            GateReply::Toggled
        )
    }

    pub async fn get_site_status(&self, domain: Domain) -> Result<SiteStatus, GateError> {
        expect_reply!(
            self.request(GateRequest::GetSiteStatus { domain }).await?,
            GateReply::Status
        )
    }

    pub async fn get_blocked_sites(&self) -> Result<Vec<Domain>, GateError> {
        expect_reply!(
            self.request(GateRequest::GetBlockedSites).await?,
            GateReply::Blocked
        )
    }

    pub async fn check_site_blocked(&self, host: impl Into<String>) -> Result<bool, GateError> {
        let outcome = expect_reply!(
            self.request(GateRequest::CheckSiteBlocked { host: host.into() })
                .await?,
            GateReply::Check
        )?;
        Ok(outcome.blocked)
    }

    pub async fn force_unblock_site(&self, domain: Domain) -> Result<ForceUnblockOutcome, GateError> {
        expect_reply!(
            self.request(GateRequest::ForceUnblockSite { domain }).await?,
            GateReply::ForceUnblocked
        )
    }

    pub async fn add_site(&self, domain: Domain) -> Result<Vec<SiteRecord>, GateError> {
        expect_reply!(
            self.request(GateRequest::AddSite { domain }).await?,
            GateReply::Sites
        )
    }

    pub async fn remove_site(&self, domain: Domain) -> Result<Vec<SiteRecord>, GateError> {
        expect_reply!(
            self.request(GateRequest::RemoveSite { domain }).await?,
            GateReply::Sites
        )
    }

    pub async fn reconcile(&self) -> Result<RecoveryReport, GateError> {
        expect_reply!(
            self.request(GateRequest::Reconcile).await?,
            GateReply::Recovered
        )
    }

    pub async fn info(&self) -> Result<GateInfo, GateError> {
        expect_reply!(self.request(GateRequest::Info).await?, GateReply::Info)
    }
}

/// Run `gate` on its own task until `shutdown` resolves or every handle is dropped.
pub fn spawn<F>(
    gate: SiteGate,
    events: mpsc::UnboundedReceiver<DelayEvent>,
    shutdown: F,
) -> (GateHandle, JoinHandle<()>)
where
    F: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let task = tokio::spawn(run_loop(gate, rx, events, shutdown));
    (GateHandle { tx }, task)
}

async fn run_loop<F>(
    mut gate: SiteGate,
    mut commands: mpsc::Receiver<GateCommand>,
    mut events: mpsc::UnboundedReceiver<DelayEvent>,
    shutdown: F,
) where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            Some(event) = events.recv() => {
                let domain = event.domain().clone();
                if let Err(err) = gate.handle_delay_event(event).await {
                    tracing::error!(domain = %domain, error = %err, "delay event handling failed");
                }
            }
            command = commands.recv() => {
                let Some(command) = command else { break };
                let reply = gate.execute(command.request).await;
                if let Err(err) = &reply {
                    tracing::warn!(error = %err, "gate request failed");
                }
                let _ = command.respond_to.send(reply);
            }
        }
    }
    gate.scheduler.cancel_all();
    tracing::debug!("gate task stopped");
}
