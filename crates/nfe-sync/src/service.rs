use std::sync::Arc;

use anyhow::{Context, Result};
use nfe_core::{Clock, SystemClock};
use nfe_gateway::{NotificationChannel, PortalGateway};
use nfe_storage::DedupStore;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::MonitorConfig;
use crate::dispatcher::{Dispatcher, DrainSummary};
use crate::scheduler::{PollScheduler, TickSummary};

#[derive(Debug, Clone, Default, Serialize)]
pub struct PumpSummary {
    pub tick: TickSummary,
    pub drain: DrainSummary,
}

/// The long-running worker: poll tick then notification drain on every
/// interval, plus the daily digest on its cron schedule.
#[derive(Clone)]
pub struct Monitor {
    config: MonitorConfig,
    store: DedupStore,
    scheduler: PollScheduler,
    dispatcher: Dispatcher,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        store: DedupStore,
        gateway: Arc<dyn PortalGateway>,
        channel: Arc<dyn NotificationChannel>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let scheduler = PollScheduler::new(
            store.clone(),
            gateway,
            Arc::clone(&clock),
            config.poll.clone(),
            config.worker_id.clone(),
        );
        let dispatcher = Dispatcher::new(
            store.clone(),
            channel,
            clock,
            config.notify.clone(),
            config.worker_id.clone(),
        );
        Self {
            config,
            store,
            scheduler,
            dispatcher,
        }
    }

    /// Opens the store and picks gateway and channel from `config`.
    pub async fn from_config(config: MonitorConfig) -> Result<Self> {
        let store = DedupStore::open(&config.database_url)
            .await
            .with_context(|| format!("opening store at {}", config.database_url))?;
        let gateway = config.build_gateway()?;
        let channel = config.build_channel()?;
        Ok(Self::new(config, store, gateway, channel, Arc::new(SystemClock)))
    }

    pub fn store(&self) -> &DedupStore {
        &self.store
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// One poll tick followed by one drain.
    pub async fn pump_once(&self) -> Result<PumpSummary> {
        let tick = self.scheduler.tick().await?;
        let drain = self.dispatcher.drain().await?;
        Ok(PumpSummary { tick, drain })
    }

    pub async fn maybe_build_digest_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.digest_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let dispatcher = self.dispatcher.clone();
        let cron = self.config.digest_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let dispatcher = dispatcher.clone();
            Box::pin(async move {
                match dispatcher.send_daily_digest().await {
                    Ok(summary) => {
                        info!(sent = summary.sent, failed = summary.failed, "daily digest run")
                    }
                    Err(err) => warn!(error = format!("{err:#}"), "daily digest run failed"),
                }
            })
        })
        .with_context(|| format!("creating digest job for cron {cron}"))?;
        sched.add(job).await.context("adding digest job")?;
        Ok(Some(sched))
    }

    /// Runs until `shutdown` flips to `true`. Work in flight when the signal
    /// arrives (one company's cycle, one document's delivery) completes first.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let scheduler = self.scheduler.clone().with_shutdown(shutdown.clone());
        let dispatcher = self.dispatcher.clone().with_shutdown(shutdown.clone());

        let mut digest = self.maybe_build_digest_scheduler().await?;
        if let Some(sched) = &digest {
            sched.start().await.context("starting digest scheduler")?;
            info!(cron = %self.config.digest_cron, "daily digest scheduled");
        }

        info!(
            worker = %self.config.worker_id,
            tick_secs = self.config.tick_interval.as_secs(),
            concurrency = self.config.poll.worker_concurrency,
            "monitor running"
        );

        let mut shutdown = shutdown;
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // A failing store must not kill the worker; the next tick retries.
                    if let Err(err) = scheduler.tick().await {
                        error!(error = format!("{err:#}"), "poll tick failed");
                    }
                    if let Err(err) = dispatcher.drain().await {
                        error!(error = format!("{err:#}"), "notification drain failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(sched) = digest.as_mut() {
            if let Err(err) = sched.shutdown().await {
                warn!(error = %err, "digest scheduler did not shut down cleanly");
            }
        }
        info!("monitor stopped");
        Ok(())
    }
}

/// A shutdown channel that flips to `true` on Ctrl-C.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(err) => error!(error = %err, "could not listen for ctrl-c; shutting down"),
        }
        let _ = tx.send(true);
    });
    rx
}
