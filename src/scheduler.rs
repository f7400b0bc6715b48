use crate::clock::Clock;
use crate::config::SchedulerSettings;
use crate::store::{StoreError, TokenRecord, TokenStats, TokenStore};
use crate::tokens::TokenRefresher;
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::Serialize;
use serde_with::skip_serializing_none;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub refreshed_count: usize,
    pub failed_count: usize,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub enabled: bool,
    pub interval_secs: u64,
    pub threshold_secs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_refreshed: usize,
    pub last_failed: usize,
    #[serde(flatten)]
    pub tokens: TokenStats,
}

#[derive(Default)]
struct LastSweep {
    at: Option<DateTime<Utc>>,
    summary: RefreshSummary,
}

/// Periodic sweep that refreshes tokens before requests find them stale.
pub struct RefreshScheduler {
    refresher: Arc<TokenRefresher>,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    running: AtomicBool,
    last: Mutex<LastSweep>,
}

/// Owned by `main`; stopping it ends the sweep loop and waits for it.
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            warn!(target = "ledger.scheduler", error = %err, "scheduler_join_failed");
        }
    }
}

impl RefreshScheduler {
    pub fn new(
        refresher: Arc<TokenRefresher>,
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            refresher,
            store,
            clock,
            settings,
            running: AtomicBool::new(false),
            last: Mutex::new(LastSweep::default()),
        }
    }

    fn threshold(&self) -> TimeDelta {
        TimeDelta::from_std(self.settings.threshold).unwrap_or(TimeDelta::minutes(20))
    }

    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (stop, mut stopped) = watch::channel(false);
        let scheduler = self;
        scheduler.running.store(true, Ordering::SeqCst);
        let task = tokio::spawn(async move {
            info!(
                target = "ledger.scheduler",
                interval_secs = scheduler.settings.interval.as_secs(),
                threshold_secs = scheduler.settings.threshold.as_secs(),
                "refresh_scheduler_started"
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(jittered(scheduler.settings.interval)) => {
                        scheduler.run_due().await;
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            scheduler.running.store(false, Ordering::SeqCst);
            info!(target = "ledger.scheduler", "refresh_scheduler_stopped");
        });
        SchedulerHandle { stop, task }
    }

    /// One periodic pass: tokens expiring within the threshold.
    pub async fn run_due(&self) -> RefreshSummary {
        let cutoff = self.clock.now() + self.threshold();
        self.sweep(Some(cutoff)).await
    }

    /// Refreshes every record that holds a refresh token.
    pub async fn force_refresh_all(&self) -> RefreshSummary {
        info!(target = "ledger.scheduler", "forced_refresh_requested");
        self.sweep(None).await
    }

    async fn sweep(&self, expiring_before: Option<DateTime<Utc>>) -> RefreshSummary {
        let started = Instant::now();
        let candidates = match self.store.refreshable(expiring_before).await {
            Ok(records) => records,
            Err(err) => {
                warn!(target = "ledger.scheduler", error = %err, "sweep_listing_failed");
                return RefreshSummary::default();
            }
        };

        let mut summary = RefreshSummary::default();
        for record in candidates {
            match self.refresh_one(&record, expiring_before.is_some()).await {
                Ok(()) => summary.refreshed_count += 1,
                Err(err) => {
                    summary.failed_count += 1;
                    warn!(target = "ledger.scheduler", user_id = %record.user_id, error = %err, "sweep_refresh_failed");
                }
            }
        }

        crate::metrics::sweep_finished(
            summary.refreshed_count,
            summary.failed_count,
            started.elapsed().as_millis(),
        );
        if summary != RefreshSummary::default() {
            info!(
                target = "ledger.scheduler",
                refreshed = summary.refreshed_count,
                failed = summary.failed_count,
                "sweep_finished"
            );
        }
        let mut last = self.last.lock().await;
        last.at = Some(self.clock.now());
        last.summary = summary;
        summary
    }

    async fn refresh_one(&self, record: &TokenRecord, only_if_due: bool) -> Result<(), crate::tokens::RefreshError> {
        if only_if_due {
            self.refresher
                .refresh_if_expiring(&record.user_id, self.threshold())
                .await?;
        } else {
            let refresh_token = record.refresh_token.as_deref().unwrap_or_default();
            self.refresher.refresh(&record.user_id, refresh_token).await?;
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<SchedulerStatus, StoreError> {
        let tokens = self.store.stats(self.clock.now() + self.threshold()).await?;
        let last = self.last.lock().await;
        Ok(SchedulerStatus {
            running: self.running.load(Ordering::SeqCst),
            enabled: self.settings.enabled,
            interval_secs: self.settings.interval.as_secs(),
            threshold_secs: self.settings.threshold.as_secs(),
            last_run_at: last.at,
            last_refreshed: last.summary.refreshed_count,
            last_failed: last.summary.failed_count,
            tokens,
        })
    }
}

/// `interval` plus up to 10% random jitter.
fn jittered(interval: Duration) -> Duration {
    let max_jitter = (interval.as_millis() / 10) as u64;
    if max_jitter == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::rng().random_range(0..=max_jitter))
}
