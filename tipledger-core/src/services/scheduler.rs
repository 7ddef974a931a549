//! Background jobs - escrow expiry and fee swaps on fixed intervals
//!
//! Both jobs check the shutdown signal between items, and both are safe to
//! overlap with request handling: they only act on records still in the
//! state they expect (`pending` escrow, `pending` fees).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::domain::result::Result;
use crate::ports::{Clock, TransactionSigner};
use crate::services::escrow::SweepReport;
use crate::services::fees::FeeRunReport;
use crate::services::tipping::TippingService;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub sweep_every: Duration,
    pub fees_every: Duration,
    /// Fee records stuck in processing longer than this are failed, and
    /// escrow claim leases this old are released
    pub stale_processing: chrono::Duration,
    /// How long finished airdrops stay queryable
    pub airdrop_retention: chrono::Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sweep_every: Duration::from_secs(config.escrow.sweep_interval_secs.max(1)),
            fees_every: Duration::from_secs(config.fees.process_interval_secs.max(1)),
            stale_processing: chrono::Duration::minutes(config.fees.stale_processing_minutes),
            airdrop_retention: chrono::Duration::hours(1),
        }
    }
}

pub struct Scheduler {
    tipping: Arc<TippingService>,
    /// Platform wallet that pays for fee swaps. Fee processing is off without one.
    fee_signer: Option<Arc<dyn TransactionSigner>>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(
        tipping: Arc<TippingService>,
        fee_signer: Option<Arc<dyn TransactionSigner>>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            tipping,
            fee_signer,
            clock,
            settings,
        }
    }

    /// Run until `shutdown` turns true or its sender is dropped
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(self.settings.sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut fees = tokio::time::interval(self.settings.fees_every);
        fees.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            sweep_secs = self.settings.sweep_every.as_secs(),
            fee_secs = self.settings.fees_every.as_secs(),
            fee_processing = self.fee_signer.is_some(),
            "scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep_once(&shutdown) {
                        error!(error = %e, "escrow sweep failed");
                    }
                }
                _ = fees.tick() => {
                    if let Err(e) = self.process_fees_once(&shutdown).await {
                        error!(error = %e, "fee processing failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    /// Expire due escrow items and close finished airdrops
    pub fn sweep_once(&self, shutdown: &watch::Receiver<bool>) -> Result<SweepReport> {
        let now = self.clock.now();
        self.tipping
            .release_stale_claims(now - self.settings.stale_processing)?;
        let report = self.tipping.process_expired_escrow(now, shutdown)?;

        let closed = self
            .tipping
            .components()
            .airdrops
            .close_finished(self.settings.airdrop_retention)?;
        debug!(
            expired = report.expired.len(),
            skipped = report.skipped,
            airdrops_closed = closed.len(),
            "sweep pass done"
        );
        Ok(report)
    }

    /// Fail stuck batches, then swap every token over its threshold
    pub async fn process_fees_once(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Option<FeeRunReport>> {
        let Some(signer) = &self.fee_signer else {
            return Ok(None);
        };
        let fees = &self.tipping.components().fees;
        fees.fail_stale_processing(self.clock.now() - self.settings.stale_processing)?;

        let report = fees.process_all(signer.as_ref(), shutdown).await?;
        if !report.failures.is_empty() {
            error!(failed = report.failures.len(), "some fee swaps failed");
        }
        Ok(Some(report))
    }
}
