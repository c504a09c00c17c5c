//! Delivers pending documents through the notification channel.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nfe_core::{to_chrono, AttemptOutcome, Clock, CompanyStatus, FiscalDocument};
use nfe_gateway::{DailyDigest, NotificationChannel, NotifyError, Recipient};
use nfe_storage::{AttemptResolution, DedupStore, DocumentQuery};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::NotifySettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    Retried,
    DeadLettered,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainSummary {
    pub sent: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
}

impl DrainSummary {
    pub fn is_empty(&self) -> bool {
        self.sent + self.retried + self.dead_lettered + self.skipped == 0
    }

    fn absorb(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Sent => self.sent += 1,
            Delivery::Retried => self.retried += 1,
            Delivery::DeadLettered => self.dead_lettered += 1,
            Delivery::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DigestSummary {
    pub companies: usize,
    pub sent: usize,
    pub empty: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: DedupStore,
    channel: Arc<dyn NotificationChannel>,
    clock: Arc<dyn Clock>,
    settings: NotifySettings,
    worker_id: String,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Dispatcher {
    pub fn new(
        store: DedupStore,
        channel: Arc<dyn NotificationChannel>,
        clock: Arc<dyn Clock>,
        settings: NotifySettings,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            channel,
            clock,
            settings,
            worker_id: worker_id.into(),
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Delivers leased batches until none are deliverable or shutdown is requested.
    /// A storage failure aborts the drain; leases on the unfinished batch lapse
    /// and the documents come back on a later drain.
    pub async fn drain(&self) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        'drain: loop {
            if self.shutting_down() {
                break;
            }
            let batch = self
                .store
                .fetch_pending(
                    self.settings.batch_size,
                    &self.worker_id,
                    self.settings.lease_ttl,
                    self.clock.now(),
                )
                .await
                .context("fetching pending documents")?;
            if batch.is_empty() {
                break;
            }

            for document in batch {
                if self.shutting_down() {
                    info!("shutdown requested; leaving remaining documents for later");
                    break 'drain;
                }
                let delivery = self.deliver(&document).await?;
                summary.absorb(delivery);
            }
        }

        if !summary.is_empty() {
            info!(
                sent = summary.sent,
                retried = summary.retried,
                dead_lettered = summary.dead_lettered,
                "notification drain complete"
            );
        }
        Ok(summary)
    }

    async fn deliver(&self, document: &FiscalDocument) -> Result<Delivery> {
        let span = info_span!(
            "deliver",
            document_key = %document.key,
            tax_id = %document.monitored_tax_id,
        );
        async {
            // The batch lease was taken when the batch was fetched; each send gets a
            // fresh one so slow earlier sends cannot expose later documents.
            let renewed = self
                .store
                .renew_document_lease(
                    &document.key,
                    &self.worker_id,
                    self.settings.lease_ttl,
                    self.clock.now(),
                )
                .await
                .context("renewing document lease")?;
            if !renewed {
                debug!("document claimed elsewhere or already terminal");
                return Ok(Delivery::Skipped);
            }

            let company = self
                .store
                .get_company(&document.monitored_tax_id)
                .await
                .context("resolving recipient")?;
            let recipient = match company {
                Some(company) if !company.notify_email.trim().is_empty() => Recipient {
                    email: company.notify_email.clone(),
                    company_name: company.label().to_string(),
                    tax_id: company.tax_id.clone(),
                },
                Some(_) => {
                    return self
                        .dead_letter(document, "company has no notify_email")
                        .await
                }
                None => {
                    return self
                        .dead_letter(document, "company is no longer monitored")
                        .await
                }
            };

            let lease_ttl = self.settings.lease_ttl;
            let result = match tokio::time::timeout(
                lease_ttl,
                self.channel.send(&recipient, document),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(NotifyError::Transient(format!(
                    "delivery did not finish within the {}s lease",
                    lease_ttl.as_secs()
                ))),
            };
            let now = self.clock.now();
            match result {
                Ok(sent) => {
                    let recorded = self
                        .record(
                            document,
                            AttemptOutcome::Success,
                            sent.message_id.as_deref(),
                            AttemptResolution::Notified,
                            now,
                        )
                        .await?;
                    let Some(attempt) = recorded else {
                        return Ok(Delivery::Skipped);
                    };
                    info!(attempt, to = %recipient.email, "document notified");
                    Ok(Delivery::Sent)
                }
                Err(NotifyError::Transient(detail)) => {
                    let attempt_number = document.attempt_count + 1;
                    if attempt_number >= self.settings.max_attempts {
                        let reason = format!("gave up after {attempt_number} attempts: {detail}");
                        let recorded = self
                            .record(
                                document,
                                AttemptOutcome::TransientFailure,
                                Some(&detail),
                                AttemptResolution::DeadLetter(&reason),
                                now,
                            )
                            .await?;
                        let Some(attempt) = recorded else {
                            return Ok(Delivery::Skipped);
                        };
                        error!(
                            attempt,
                            kind = "transient",
                            error = %detail,
                            "delivery attempts exhausted; document dead-lettered"
                        );
                        return Ok(Delivery::DeadLettered);
                    }

                    let delay = self
                        .settings
                        .backoff
                        .jittered_delay_for_attempt(attempt_number - 1);
                    let retry_at = now + to_chrono(delay);
                    let recorded = self
                        .record(
                            document,
                            AttemptOutcome::TransientFailure,
                            Some(&detail),
                            AttemptResolution::RetryAt(retry_at),
                            now,
                        )
                        .await?;
                    let Some(attempt) = recorded else {
                        return Ok(Delivery::Skipped);
                    };
                    warn!(
                        attempt,
                        kind = "transient",
                        error = %detail,
                        retry_at = %retry_at,
                        "delivery failed; will retry"
                    );
                    Ok(Delivery::Retried)
                }
                Err(NotifyError::Permanent(detail)) => {
                    let recorded = self
                        .record(
                            document,
                            AttemptOutcome::PermanentFailure,
                            Some(&detail),
                            AttemptResolution::DeadLetter(&detail),
                            now,
                        )
                        .await?;
                    let Some(attempt) = recorded else {
                        return Ok(Delivery::Skipped);
                    };
                    error!(attempt, kind = "permanent", error = %detail, "delivery rejected");
                    Ok(Delivery::DeadLettered)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Logs one attempt and applies its resolution. `None` when another worker
    /// took the document over in the meantime.
    async fn record(
        &self,
        document: &FiscalDocument,
        outcome: AttemptOutcome,
        detail: Option<&str>,
        resolution: AttemptResolution<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        match self
            .store
            .record_attempt(
                &document.key,
                &self.worker_id,
                outcome,
                detail,
                resolution,
                now,
            )
            .await
        {
            Ok(attempt) => Ok(Some(attempt)),
            Err(err) if err.is_superseded() => {
                warn!(error = %err, "delivery outcome discarded; document taken over");
                Ok(None)
            }
            Err(err) => Err(err).context("recording delivery attempt"),
        }
    }

    async fn dead_letter(&self, document: &FiscalDocument, reason: &str) -> Result<Delivery> {
        let moved = match self
            .store
            .mark_dead_letter(&document.key, &self.worker_id, reason, self.clock.now())
            .await
        {
            Ok(moved) => moved,
            Err(err) if err.is_superseded() => false,
            Err(err) => return Err(err).context("moving document to dead letter"),
        };
        if moved {
            warn!(reason, "document dead-lettered");
            Ok(Delivery::DeadLettered)
        } else {
            debug!("document already terminal or claimed elsewhere");
            Ok(Delivery::Skipped)
        }
    }

    /// Sends each active company a summary of the documents first seen in the
    /// last 24 hours. Best effort: failures are logged and not retried.
    pub async fn send_daily_digest(&self) -> Result<DigestSummary> {
        let until = self.clock.now();
        let since = until - chrono::Duration::hours(24);
        let companies = self.store.list_companies().await.context("listing companies")?;

        let mut summary = DigestSummary::default();
        for company in companies {
            if company.status != CompanyStatus::Active || company.notify_email.trim().is_empty() {
                continue;
            }
            summary.companies += 1;

            let documents = self
                .store
                .query_documents(&DocumentQuery {
                    monitored_tax_id: Some(company.tax_id.clone()),
                    first_seen_from: Some(since),
                    first_seen_to: Some(until),
                    ..DocumentQuery::default()
                })
                .await
                .context("loading digest documents")?;
            if documents.is_empty() {
                summary.empty += 1;
                continue;
            }

            let recipient = Recipient {
                email: company.notify_email.clone(),
                company_name: company.label().to_string(),
                tax_id: company.tax_id.clone(),
            };
            let digest = DailyDigest {
                since,
                until,
                documents,
            };
            match self.channel.send_digest(&recipient, &digest).await {
                Ok(_) => {
                    summary.sent += 1;
                    info!(
                        tax_id = %company.tax_id,
                        documents = digest.document_count(),
                        "daily digest sent"
                    );
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        tax_id = %company.tax_id,
                        kind = err.kind(),
                        error = %err,
                        "daily digest not sent"
                    );
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use nfe_core::{BackoffPolicy, DocumentState, ManualClock, NaturalKey};
    use nfe_gateway::Sent;

    use crate::testing::*;

    fn settings(max_attempts: u32) -> NotifySettings {
        NotifySettings {
            max_attempts,
            backoff: BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(1800)),
            batch_size: 10,
            lease_ttl: Duration::from_secs(120),
        }
    }

    async fn setup(
        script: Vec<Result<Sent, NotifyError>>,
        max_attempts: u32,
    ) -> (DedupStore, Arc<ScriptedChannel>, Arc<ManualClock>, Dispatcher, NaturalKey) {
        let store = store_with_acme(300).await;
        let doc = store
            .record_candidates(&acme(), &[candidate("A1")], t0())
            .await
            .unwrap()
            .remove(0);
        let channel = Arc::new(ScriptedChannel::new(script));
        let clock = Arc::new(ManualClock::new(t0()));
        let dispatcher = Dispatcher::new(
            store.clone(),
            channel.clone(),
            clock.clone(),
            settings(max_attempts),
            "dispatch-test",
        );
        (store, channel, clock, dispatcher, doc.key)
    }

    #[tokio::test]
    async fn retries_until_sent() {
        let (store, channel, clock, dispatcher, key) = setup(
            vec![
                Err(NotifyError::Transient("relay 503".into())),
                Err(NotifyError::Transient("relay timeout".into())),
                Ok(Sent { message_id: Some("m-1".into()) }),
            ],
            3,
        )
        .await;

        let first = dispatcher.drain().await.unwrap();
        assert_eq!(first.retried, 1);
        // Gate is closed until the backoff passes.
        assert!(dispatcher.drain().await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(dispatcher.drain().await.unwrap().retried, 1);
        clock.advance(chrono::Duration::seconds(120));
        assert_eq!(dispatcher.drain().await.unwrap().sent, 1);

        let doc = store.get_document(&key).await.unwrap().unwrap();
        assert_eq!(doc.state, DocumentState::Notified);
        let attempts = store.list_attempts(&key).await.unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[2].outcome, AttemptOutcome::Success);
        assert_eq!(attempts[2].detail.as_deref(), Some("m-1"));
        assert_eq!(channel.send_count(), 3);
    }

    #[tokio::test]
    async fn always_transient_dead_letters_after_max_attempts() {
        let script = (0..10)
            .map(|_| Err(NotifyError::Transient("relay down".into())))
            .collect();
        let (store, channel, clock, dispatcher, key) = setup(script, 3).await;

        for _ in 0..10 {
            dispatcher.drain().await.unwrap();
            clock.advance(chrono::Duration::hours(1));
        }

        let doc = store.get_document(&key).await.unwrap().unwrap();
        assert_eq!(doc.state, DocumentState::DeadLetter);
        assert_eq!(doc.attempt_count, 3);
        assert!(doc.dead_letter_reason.unwrap().contains("3 attempts"));
        assert_eq!(channel.send_count(), 3);
    }

    #[tokio::test]
    async fn permanent_rejection_dead_letters_immediately() {
        let (store, _channel, _clock, dispatcher, key) =
            setup(vec![Err(NotifyError::Permanent("mailbox does not exist".into()))], 3).await;

        let summary = dispatcher.drain().await.unwrap();
        assert_eq!(summary.dead_lettered, 1);
        let doc = store.get_document(&key).await.unwrap().unwrap();
        assert_eq!(doc.state, DocumentState::DeadLetter);
        assert_eq!(doc.dead_letter_reason.as_deref(), Some("mailbox does not exist"));
        assert_eq!(store.list_attempts(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drain_stops_on_shutdown() {
        let (store, channel, _clock, dispatcher, key) = setup(vec![], 3).await;
        let (tx, rx) = watch::channel(true);
        let summary = dispatcher.clone().with_shutdown(rx).drain().await.unwrap();
        assert!(summary.is_empty());
        assert_eq!(channel.send_count(), 0);
        drop(tx);

        assert_eq!(dispatcher.drain().await.unwrap().sent, 1);
        assert_eq!(
            store.get_document(&key).await.unwrap().unwrap().state,
            DocumentState::Notified
        );
    }

    #[tokio::test]
    async fn digest_covers_last_day_and_tolerates_failures() {
        let (store, channel, clock, dispatcher, _key) = setup(vec![], 3).await;
        store
            .record_candidates(&acme(), &[candidate("A2")], t0() + chrono::Duration::hours(2))
            .await
            .unwrap();

        clock.set(t0() + chrono::Duration::hours(20));
        let summary = dispatcher.send_daily_digest().await.unwrap();
        assert_eq!((summary.companies, summary.sent), (1, 1));
        assert_eq!(
            channel.digests.lock().unwrap().clone(),
            vec![("fiscal@acme.example".to_string(), 2)]
        );

        clock.set(t0() + chrono::Duration::hours(25));
        let summary = dispatcher.send_daily_digest().await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(channel.digests.lock().unwrap().last().unwrap().1, 1);

        let failing = Dispatcher::new(
            store.clone(),
            Arc::new(ScriptedChannel {
                fail_digests: true,
                ..ScriptedChannel::default()
            }),
            clock.clone(),
            settings(3),
            "digest-test",
        );
        let summary = failing.send_daily_digest().await.unwrap();
        assert_eq!((summary.sent, summary.failed), (0, 1));
    }

    /// Each send takes `step` of clock time. During send number `rival_at`, a
    /// second dispatcher drains the same store.
    struct SlowChannel {
        clock: Arc<ManualClock>,
        step: chrono::Duration,
        rival_at: usize,
        rival: Mutex<Option<Dispatcher>>,
        rival_summary: Mutex<Option<DrainSummary>>,
        sends: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationChannel for SlowChannel {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn send(
            &self,
            _recipient: &Recipient,
            document: &FiscalDocument,
        ) -> Result<Sent, NotifyError> {
            self.clock.advance(self.step);
            let count = {
                let mut sends = self.sends.lock().unwrap();
                sends.push(document.key.access_key.clone());
                sends.len()
            };
            if count == self.rival_at {
                let rival = self.rival.lock().unwrap().take();
                if let Some(rival) = rival {
                    let summary = rival.drain().await.unwrap();
                    *self.rival_summary.lock().unwrap() = Some(summary);
                }
            }
            Ok(Sent::default())
        }

        async fn send_digest(
            &self,
            _recipient: &Recipient,
            _digest: &DailyDigest,
        ) -> Result<Sent, NotifyError> {
            Ok(Sent::default())
        }
    }

    #[tokio::test]
    async fn slow_batch_is_never_delivered_twice_by_a_second_dispatcher() {
        let store = store_with_acme(300).await;
        store
            .record_candidates(&acme(), &[candidate("A1"), candidate("A2")], t0())
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        // Two sends outlast one 120s lease; a single send does not.
        let channel = Arc::new(SlowChannel {
            clock: clock.clone(),
            step: chrono::Duration::seconds(100),
            rival_at: 2,
            rival: Mutex::new(None),
            rival_summary: Mutex::new(None),
            sends: Mutex::new(Vec::new()),
        });
        let first = Dispatcher::new(
            store.clone(),
            channel.clone(),
            clock.clone(),
            settings(3),
            "a",
        );
        let second = Dispatcher::new(
            store.clone(),
            channel.clone(),
            clock.clone(),
            settings(3),
            "b",
        );
        *channel.rival.lock().unwrap() = Some(second);

        let summary = first.drain().await.unwrap();
        assert_eq!(summary.sent, 2);
        let rival = channel.rival_summary.lock().unwrap().clone().unwrap();
        assert!(rival.is_empty(), "{rival:?}");
        assert_eq!(channel.sends.lock().unwrap().clone(), vec!["A1", "A2"]);

        let notified = store
            .query_documents(&DocumentQuery {
                state: Some(DocumentState::Notified),
                ..DocumentQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(notified.len(), 2);
        for doc in notified {
            assert_eq!(store.list_attempts(&doc.key).await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn missing_recipient_dead_letters_without_sending() {
        let (store, channel, _clock, dispatcher, key) = setup(vec![], 3).await;
        let mut reg = acme_registration(300);
        reg.notify_email = "   ".into();
        store.upsert_company(&reg, 900, t0()).await.unwrap();

        let summary = dispatcher.drain().await.unwrap();
        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(channel.send_count(), 0);
        let doc = store.get_document(&key).await.unwrap().unwrap();
        assert_eq!(doc.state, DocumentState::DeadLetter);
        assert_eq!(doc.dead_letter_reason.as_deref(), Some("company has no notify_email"));
    }
}
