//! Per-company poll cycles.
//!
//! Every decision that matters across workers (is this company due, who is
//! polling it, how long to back off) lives in the store. The scheduler only
//! sequences one cycle: lease, fetch, record, advance, release.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nfe_core::{Clock, PollRunStatus, TaxId};
use nfe_gateway::{GatewayError, PortalBatch, PortalGateway};
use nfe_storage::{DedupStore, PollResult, PollRunReport, StoreError};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PollSettings;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    /// Another worker holds the lease, or the company is not due or not active.
    Skipped,
    Polled {
        found: usize,
        new_documents: usize,
    },
    BackingOff {
        kind: &'static str,
        consecutive_failures: u32,
        next_eligible_poll_at: DateTime<Utc>,
    },
    Disabled {
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub due: usize,
    pub polled: usize,
    pub new_documents: usize,
    pub backing_off: usize,
    pub disabled: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl TickSummary {
    fn absorb(&mut self, outcome: &PollOutcome) {
        match outcome {
            PollOutcome::Skipped => self.skipped += 1,
            PollOutcome::Polled { new_documents, .. } => {
                self.polled += 1;
                self.new_documents += new_documents;
            }
            PollOutcome::BackingOff { .. } => self.backing_off += 1,
            PollOutcome::Disabled { .. } => self.disabled += 1,
        }
    }
}

#[derive(Clone)]
pub struct PollScheduler {
    store: DedupStore,
    gateway: Arc<dyn PortalGateway>,
    clock: Arc<dyn Clock>,
    settings: PollSettings,
    worker_id: String,
    workers: Arc<Semaphore>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl PollScheduler {
    pub fn new(
        store: DedupStore,
        gateway: Arc<dyn PortalGateway>,
        clock: Arc<dyn Clock>,
        settings: PollSettings,
        worker_id: impl Into<String>,
    ) -> Self {
        let settings = settings.with_lease_covering_timeout();
        let workers = Arc::new(Semaphore::new(settings.worker_concurrency.max(1)));
        Self {
            store,
            gateway,
            clock,
            settings,
            worker_id: worker_id.into(),
            workers,
            shutdown: None,
        }
    }

    /// Stops [`tick`](Self::tick) from starting new cycles once `true` is sent.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Runs one cycle for every due company, at most `worker_concurrency` at a time.
    pub async fn tick(&self) -> Result<TickSummary> {
        let due = self
            .store
            .list_eligible_companies(self.clock.now())
            .await
            .context("listing due companies")?;
        let mut summary = TickSummary {
            due: due.len(),
            ..TickSummary::default()
        };

        let mut cycles = JoinSet::new();
        for company in due {
            if self.shutting_down() {
                info!("shutdown requested; not starting further poll cycles");
                break;
            }
            let permit = Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .context("poll worker pool closed")?;
            let this = self.clone();
            cycles.spawn(async move {
                let _permit = permit;
                let result = this.poll_company(&company.tax_id).await;
                (company.tax_id, result)
            });
        }

        while let Some(joined) = cycles.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => summary.absorb(&outcome),
                Ok((tax_id, Err(err))) => {
                    summary.errors += 1;
                    warn!(%tax_id, error = format!("{err:#}"), "poll cycle aborted");
                }
                Err(join_err) => {
                    summary.errors += 1;
                    error!(error = %join_err, "poll cycle task failed");
                }
            }
        }

        if summary.due > 0 {
            info!(
                due = summary.due,
                polled = summary.polled,
                new_documents = summary.new_documents,
                backing_off = summary.backing_off,
                disabled = summary.disabled,
                errors = summary.errors,
                "poll tick complete"
            );
        }
        Ok(summary)
    }

    /// One poll cycle for `tax_id`. Safe to call concurrently: only the caller
    /// that wins the store lease talks to the portal.
    pub async fn poll_company(&self, tax_id: &TaxId) -> Result<PollOutcome> {
        let lease_owner = format!("{}/{}", self.worker_id, Uuid::new_v4().simple());
        let span = info_span!("poll_cycle", %tax_id, worker = %self.worker_id);
        async {
            let acquired = self
                .store
                .try_acquire_poll_lease(
                    tax_id,
                    &lease_owner,
                    self.clock.now(),
                    self.settings.lease_ttl,
                )
                .await
                .context("acquiring poll lease")?;
            if !acquired {
                debug!("company not due or already being polled");
                return Ok(PollOutcome::Skipped);
            }

            let result = self.run_cycle(tax_id, &lease_owner).await;
            if result.is_err() {
                // Best effort: the lease expires on its own if this fails too.
                if let Err(err) = self.store.release_poll_lease(tax_id, &lease_owner).await {
                    warn!(error = %err, "could not release poll lease after failed cycle");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_cycle(&self, tax_id: &TaxId, lease_owner: &str) -> Result<PollOutcome> {
        let company = self
            .store
            .get_company(tax_id)
            .await?
            .ok_or_else(|| StoreError::CompanyNotFound(tax_id.to_string()))?;
        let run_id = self
            .store
            .start_poll_run(tax_id, self.clock.now())
            .await
            .context("starting poll run")?;

        let timeout = self.settings.gateway_timeout;
        let fetched = match tokio::time::timeout(
            timeout,
            self.gateway
                .fetch(tax_id, company.last_checkpoint.as_ref(), timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Transient(format!(
                "portal call timed out after {}s",
                timeout.as_secs()
            ))),
        };

        match fetched {
            Ok(batch) => self.record_success(tax_id, lease_owner, run_id, batch).await,
            Err(err) if err.is_retryable() => {
                self.record_retryable(tax_id, lease_owner, run_id, err).await
            }
            Err(err) => self.record_permanent(tax_id, run_id, err).await,
        }
    }

    async fn record_success(
        &self,
        tax_id: &TaxId,
        lease_owner: &str,
        run_id: i64,
        batch: PortalBatch,
    ) -> Result<PollOutcome> {
        let found = batch.candidates.len();
        let outcome = async {
            let now = self.clock.now();
            // Candidates are idempotent, so recording them is safe even if the lease
            // lapsed; the cursor and the gate below only move for the lease holder.
            let inserted = self
                .store
                .record_candidates(tax_id, &batch.candidates, now)
                .await?;
            if let Some(checkpoint) = &batch.checkpoint {
                self.store
                    .update_checkpoint(tax_id, lease_owner, checkpoint, now)
                    .await?;
            }
            self.store
                .record_poll_outcome(
                    tax_id,
                    lease_owner,
                    PollResult::Success,
                    now,
                    &self.settings.backoff,
                )
                .await?;
            Ok::<_, StoreError>(inserted.len())
        }
        .await;

        let new_documents = match outcome {
            Ok(new_documents) => new_documents,
            Err(err) if err.is_superseded() => {
                return Ok(self.superseded(run_id, found, &err).await);
            }
            Err(err) => {
                let report = failed_report(found, storage_kind(&err), &err.to_string());
                self.finish_run(run_id, report).await;
                return Err(err).context("recording poll results");
            }
        };

        self.finish_run(
            run_id,
            PollRunReport {
                status: PollRunStatus::Success,
                documents_found: count(found),
                new_documents: count(new_documents),
                error_kind: None,
                error_message: None,
            },
        )
        .await;
        if new_documents > 0 {
            info!(found, new_documents, "new documents ingested");
        } else {
            debug!(found, "no new documents");
        }
        Ok(PollOutcome::Polled {
            found,
            new_documents,
        })
    }

    async fn record_retryable(
        &self,
        tax_id: &TaxId,
        lease_owner: &str,
        run_id: i64,
        err: GatewayError,
    ) -> Result<PollOutcome> {
        let recorded = self
            .store
            .record_poll_outcome(
                tax_id,
                lease_owner,
                PollResult::Failure,
                self.clock.now(),
                &self.settings.backoff,
            )
            .await;
        let company = match recorded {
            Ok(company) => company,
            Err(store_err) if store_err.is_superseded() => {
                return Ok(self.superseded(run_id, 0, &store_err).await);
            }
            Err(store_err) => {
                self.finish_run(
                    run_id,
                    failed_report(0, storage_kind(&store_err), &store_err.to_string()),
                )
                .await;
                return Err(store_err).context("recording poll failure");
            }
        };
        self.finish_run(run_id, failed_report(0, err.kind(), err.detail()))
            .await;
        warn!(
            kind = err.kind(),
            error = %err,
            attempt = company.consecutive_failure_count,
            next_eligible_poll_at = %company.next_eligible_poll_at,
            "portal fetch failed; backing off"
        );
        Ok(PollOutcome::BackingOff {
            kind: err.kind(),
            consecutive_failures: company.consecutive_failure_count,
            next_eligible_poll_at: company.next_eligible_poll_at,
        })
    }

    async fn record_permanent(
        &self,
        tax_id: &TaxId,
        run_id: i64,
        err: GatewayError,
    ) -> Result<PollOutcome> {
        let reason = err.to_string();
        self.store
            .disable_company(tax_id, &reason, self.clock.now())
            .await
            .context("disabling company")?;
        self.finish_run(run_id, failed_report(0, err.kind(), err.detail()))
            .await;
        error!(kind = err.kind(), error = %err, "permanent portal failure; company disabled");
        Ok(PollOutcome::Disabled { reason })
    }

    /// Another worker took the company over while this cycle was running; its
    /// results other than the (idempotent) candidates are dropped.
    async fn superseded(&self, run_id: i64, found: usize, err: &StoreError) -> PollOutcome {
        warn!(error = %err, "poll lease lost mid-cycle; discarding cycle results");
        self.finish_run(run_id, failed_report(found, "lease_lost", &err.to_string()))
            .await;
        PollOutcome::Skipped
    }

    async fn finish_run(&self, run_id: i64, report: PollRunReport) {
        if let Err(err) = self
            .store
            .finish_poll_run(run_id, &report, self.clock.now())
            .await
        {
            warn!(run_id, error = %err, "could not close poll run");
        }
    }
}

fn failed_report(found: usize, kind: &str, message: &str) -> PollRunReport {
    PollRunReport {
        status: PollRunStatus::Failed,
        documents_found: count(found),
        new_documents: 0,
        error_kind: Some(kind.to_string()),
        error_message: Some(message.to_string()),
    }
}

fn storage_kind(err: &StoreError) -> &'static str {
    if err.is_unavailable() {
        "storage"
    } else {
        "store"
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use async_trait::async_trait;
    use nfe_core::{BackoffPolicy, Checkpoint, CompanyStatus, DocumentState, ManualClock};
    use nfe_storage::DocumentQuery;

    use crate::testing::*;

    fn settings() -> PollSettings {
        PollSettings {
            worker_concurrency: 4,
            gateway_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(3600)),
            lease_ttl: Duration::from_secs(300),
        }
    }

    fn scheduler(
        store: &DedupStore,
        gateway: Arc<ScriptedGateway>,
        clock: Arc<ManualClock>,
    ) -> PollScheduler {
        PollScheduler::new(store.clone(), gateway, clock, settings(), "test-worker")
    }

    #[tokio::test]
    async fn repeated_candidate_is_ingested_once() {
        let store = store_with_acme(300).await;
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok(batch(&["A1"], "2024-06-09")),
            Ok(batch(&["A1"], "2024-06-09")),
        ]));
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = scheduler(&store, gateway.clone(), clock.clone());

        let first = scheduler.poll_company(&acme()).await.unwrap();
        assert_eq!(first, PollOutcome::Polled { found: 1, new_documents: 1 });

        // Not due again until the interval passes.
        assert_eq!(scheduler.poll_company(&acme()).await.unwrap(), PollOutcome::Skipped);
        clock.advance(chrono::Duration::seconds(300));

        let second = scheduler.poll_company(&acme()).await.unwrap();
        assert_eq!(second, PollOutcome::Polled { found: 1, new_documents: 0 });

        let docs = store.query_documents(&DocumentQuery::default()).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].state, DocumentState::PendingNotification);
        assert_eq!(docs[0].first_seen_at, t0());
        assert_eq!(gateway.calls(), 2);
        assert_eq!(
            gateway.seen_checkpoints.lock().unwrap().clone(),
            vec![None, Some(Checkpoint::new("2024-06-09"))]
        );
    }

    #[tokio::test]
    async fn concurrent_triggers_make_one_portal_call() {
        let store = store_with_acme(300).await;
        let gateway = Arc::new(
            ScriptedGateway::new(vec![Ok(batch(&["A1"], "2024-06-09"))])
                .with_delay(Duration::from_millis(50)),
        );
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = scheduler(&store, gateway.clone(), clock);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move { s.poll_company(&acme()).await.unwrap() }));
        }
        let mut polled = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), PollOutcome::Polled { .. }) {
                polled += 1;
            }
        }

        assert_eq!(polled, 1);
        assert_eq!(gateway.calls(), 1);
        assert_eq!(gateway.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_back_off_and_success_resets() {
        let store = store_with_acme(300).await;
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Err(GatewayError::Transient("503".into())),
            Err(GatewayError::RateLimited("429".into())),
            Ok(batch(&["A1"], "2024-06-09")),
        ]));
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = scheduler(&store, gateway.clone(), clock.clone());

        let PollOutcome::BackingOff {
            consecutive_failures: 1,
            next_eligible_poll_at: first_gate,
            ..
        } = scheduler.poll_company(&acme()).await.unwrap()
        else {
            panic!("expected backoff");
        };
        assert_eq!(first_gate, t0() + chrono::Duration::seconds(120));
        assert!(store.list_eligible_companies(t0()).await.unwrap().is_empty());

        clock.set(first_gate);
        let PollOutcome::BackingOff {
            kind,
            consecutive_failures: 2,
            next_eligible_poll_at: second_gate,
        } = scheduler.poll_company(&acme()).await.unwrap()
        else {
            panic!("expected backoff");
        };
        assert_eq!(kind, "rate_limited");
        assert_eq!(second_gate - first_gate, chrono::Duration::seconds(240));

        clock.set(second_gate);
        assert!(matches!(
            scheduler.poll_company(&acme()).await.unwrap(),
            PollOutcome::Polled { new_documents: 1, .. }
        ));
        let company = store.get_company(&acme()).await.unwrap().unwrap();
        assert_eq!(company.consecutive_failure_count, 0);
        assert_eq!(company.last_checkpoint, Some(Checkpoint::new("2024-06-09")));

        let runs = store.list_poll_runs(&acme(), 10).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].status, PollRunStatus::Success);
        assert_eq!(runs[2].error_kind.as_deref(), Some("transient"));
    }

    #[tokio::test]
    async fn permanent_failure_disables_the_company() {
        let store = store_with_acme(300).await;
        let gateway = Arc::new(ScriptedGateway::new(vec![Err(GatewayError::Permanent(
            "http status 404 Not Found".into(),
        ))]));
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = scheduler(&store, gateway.clone(), clock.clone());

        assert!(matches!(
            scheduler.poll_company(&acme()).await.unwrap(),
            PollOutcome::Disabled { .. }
        ));
        let company = store.get_company(&acme()).await.unwrap().unwrap();
        assert_eq!(company.status, CompanyStatus::Disabled);
        assert!(company.disabled_reason.unwrap().contains("404"));

        clock.advance(chrono::Duration::days(1));
        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.due, 0);
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test]
    async fn slow_portal_counts_as_transient() {
        let store = store_with_acme(300).await;
        let gateway = Arc::new(ScriptedGateway::default().with_delay(Duration::from_millis(200)));
        let clock = Arc::new(ManualClock::new(t0()));
        let mut settings = settings();
        settings.gateway_timeout = Duration::from_millis(20);
        let scheduler =
            PollScheduler::new(store.clone(), gateway, clock, settings, "test-worker");

        let outcome = scheduler.poll_company(&acme()).await.unwrap();
        assert!(matches!(
            outcome,
            PollOutcome::BackingOff { kind: "transient", consecutive_failures: 1, .. }
        ));
        let company = store.get_company(&acme()).await.unwrap().unwrap();
        assert_eq!(company.poll_lease_owner, None);
    }

    #[tokio::test]
    async fn unrecorded_checkpoint_is_refetched_after_a_crash() {
        // A worker that died after recording but before advancing the cursor
        // leaves the old checkpoint; the next cycle fetches the same range.
        let store = store_with_acme(300).await;
        store
            .record_candidates(&acme(), &[candidate("A1")], t0())
            .await
            .unwrap();
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(batch(&["A1", "A2"], "2024-06-09"))]));
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = scheduler(&store, gateway.clone(), clock);

        let outcome = scheduler.poll_company(&acme()).await.unwrap();
        assert_eq!(outcome, PollOutcome::Polled { found: 2, new_documents: 1 });
        assert_eq!(gateway.seen_checkpoints.lock().unwrap()[0], None);
        let docs = store.query_documents(&DocumentQuery::default()).await.unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[tokio::test]
    async fn tick_polls_every_due_company_and_respects_shutdown() {
        let store = store_with_acme(300).await;
        let gateway = Arc::new(ScriptedGateway::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let (tx, rx) = watch::channel(false);
        let scheduler = scheduler(&store, gateway.clone(), clock.clone()).with_shutdown(rx);

        let summary = scheduler.tick().await.unwrap();
        assert_eq!((summary.due, summary.polled), (1, 1));

        clock.advance(chrono::Duration::seconds(300));
        tx.send(true).unwrap();
        let summary = scheduler.tick().await.unwrap();
        assert_eq!((summary.due, summary.polled), (1, 0));
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test]
    async fn slow_portal_call_keeps_other_workers_out() {
        let store = store_with_acme(300).await;
        let gateway = Arc::new(
            ScriptedGateway::new(vec![Ok(batch(&["A1"], "2024-06-09"))])
                .with_delay(Duration::from_millis(100)),
        );
        let clock = Arc::new(ManualClock::new(t0()));
        let mut settings = settings();
        settings.gateway_timeout = Duration::from_secs(600);
        settings.lease_ttl = Duration::from_secs(300);
        let first = PollScheduler::new(
            store.clone(),
            gateway.clone(),
            clock.clone(),
            settings.clone(),
            "a",
        );
        let second =
            PollScheduler::new(store.clone(), gateway.clone(), clock.clone(), settings, "b");

        let running = tokio::spawn(async move { first.poll_company(&acme()).await.unwrap() });
        while gateway.calls() == 0 {
            tokio::task::yield_now().await;
        }
        // Past the configured lease, still inside the gateway timeout.
        clock.advance(chrono::Duration::seconds(301));
        assert_eq!(second.poll_company(&acme()).await.unwrap(), PollOutcome::Skipped);

        assert!(matches!(
            running.await.unwrap(),
            PollOutcome::Polled { new_documents: 1, .. }
        ));
        assert_eq!(gateway.calls(), 1);
        assert_eq!(gateway.max_in_flight.load(Ordering::SeqCst), 1);
        let company = store.get_company(&acme()).await.unwrap().unwrap();
        assert_eq!(company.last_checkpoint, Some(Checkpoint::new("2024-06-09")));
    }

    /// Answers with a batch after shutting the store down underneath the cycle.
    struct StoreClosingGateway {
        store: DedupStore,
    }

    #[async_trait]
    impl PortalGateway for StoreClosingGateway {
        fn name(&self) -> &'static str {
            "store-closing"
        }

        async fn fetch(
            &self,
            _tax_id: &TaxId,
            _checkpoint: Option<&Checkpoint>,
            _timeout: Duration,
        ) -> Result<PortalBatch, GatewayError> {
            self.store.close().await;
            Ok(batch(&["A1"], "2024-06-09"))
        }
    }

    #[tokio::test]
    async fn storage_failure_mid_cycle_leaves_progress_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("nfe.db").display());
        let store = DedupStore::open(&url).await.unwrap();
        store
            .upsert_company(&acme_registration(300), 900, t0())
            .await
            .unwrap();

        let clock = Arc::new(ManualClock::new(t0()));
        let gateway = Arc::new(StoreClosingGateway {
            store: store.clone(),
        });
        let scheduler = PollScheduler::new(store.clone(), gateway, clock, settings(), "w");

        let err = scheduler.poll_company(&acme()).await.unwrap_err();
        let store_err = err.downcast_ref::<StoreError>().unwrap();
        assert!(store_err.is_unavailable(), "{err:#}");

        let reopened = DedupStore::open(&url).await.unwrap();
        let company = reopened.get_company(&acme()).await.unwrap().unwrap();
        assert_eq!(company.last_checkpoint, None);
        assert_eq!(company.consecutive_failure_count, 0);
        assert_eq!(company.next_eligible_poll_at, t0());
        assert!(reopened
            .query_documents(&DocumentQuery::default())
            .await
            .unwrap()
            .is_empty());

        // Nothing could be released either; once the lease lapses the company is due again.
        let lapsed = t0() + chrono::Duration::seconds(301);
        assert_eq!(reopened.list_eligible_companies(lapsed).await.unwrap().len(), 1);
        let runs = reopened.list_poll_runs(&acme(), 10).await.unwrap();
        assert_eq!(runs[0].status, PollRunStatus::Running);
    }
}
