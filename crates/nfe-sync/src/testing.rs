//! Scripted fakes for the portal and the notification channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use nfe_core::{
    Checkpoint, CompanyRegistration, FiscalDocument, NaturalKey, RawDocumentDescriptor, TaxId,
};
use nfe_gateway::{
    DailyDigest, GatewayError, NotificationChannel, NotifyError, PortalBatch, PortalGateway,
    Recipient, Sent,
};
use nfe_storage::DedupStore;

pub(crate) const ACME: &str = "12345678000190";

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).single().unwrap()
}

pub(crate) fn acme() -> TaxId {
    TaxId::parse(ACME).unwrap()
}

pub(crate) fn candidate(access_key: &str) -> RawDocumentDescriptor {
    RawDocumentDescriptor {
        access_key: access_key.to_string(),
        issue_date: NaiveDate::from_ymd_opt(2024, 6, 9).unwrap(),
        total_value: 150.0,
        issuer_name: "Fornecedor Exemplo".into(),
        issuer_tax_id: None,
        nfe_number: Some("77".into()),
        series: Some("1".into()),
    }
}

pub(crate) fn batch(keys: &[&str], checkpoint: &str) -> PortalBatch {
    PortalBatch {
        candidates: keys.iter().map(|k| candidate(k)).collect(),
        checkpoint: Some(Checkpoint::new(checkpoint)),
    }
}

pub(crate) fn acme_registration(interval_secs: u64) -> CompanyRegistration {
    CompanyRegistration {
        tax_id: acme(),
        display_name: "Acme Comercio".into(),
        state_code: "SP".into(),
        notify_email: "fiscal@acme.example".into(),
        poll_interval_seconds: Some(interval_secs),
        enabled: true,
    }
}

pub(crate) async fn store_with_acme(interval_secs: u64) -> DedupStore {
    let store = DedupStore::open_in_memory().await.unwrap();
    store
        .upsert_company(&acme_registration(interval_secs), 900, t0())
        .await
        .unwrap();
    store
}

/// Replays queued results; an empty script answers with an empty batch.
#[derive(Default)]
pub(crate) struct ScriptedGateway {
    script: Mutex<VecDeque<Result<PortalBatch, GatewayError>>>,
    pub(crate) delay: Option<Duration>,
    pub(crate) calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub(crate) max_in_flight: AtomicUsize,
    pub(crate) seen_checkpoints: Mutex<Vec<Option<Checkpoint>>>,
}

impl ScriptedGateway {
    pub(crate) fn new(script: Vec<Result<PortalBatch, GatewayError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortalGateway for ScriptedGateway {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn fetch(
        &self,
        _tax_id: &TaxId,
        checkpoint: Option<&Checkpoint>,
        _timeout: Duration,
    ) -> Result<PortalBatch, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        self.seen_checkpoints.lock().unwrap().push(checkpoint.cloned());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(PortalBatch::default()));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        next
    }
}

#[derive(Default)]
pub(crate) struct ScriptedChannel {
    pub(crate) script: Mutex<VecDeque<Result<Sent, NotifyError>>>,
    pub(crate) sends: Mutex<Vec<(String, NaturalKey)>>,
    pub(crate) digests: Mutex<Vec<(String, usize)>>,
    pub(crate) fail_digests: bool,
}

impl ScriptedChannel {
    pub(crate) fn new(script: Vec<Result<Sent, NotifyError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub(crate) fn send_count(&self) -> usize {
        self.sends.lock().unwrap().len()
    }
}

#[async_trait]
impl NotificationChannel for ScriptedChannel {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn send(
        &self,
        recipient: &Recipient,
        document: &FiscalDocument,
    ) -> Result<Sent, NotifyError> {
        self.sends
            .lock()
            .unwrap()
            .push((recipient.email.clone(), document.key.clone()));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Sent::default()))
    }

    async fn send_digest(
        &self,
        recipient: &Recipient,
        digest: &DailyDigest,
    ) -> Result<Sent, NotifyError> {
        if self.fail_digests {
            return Err(NotifyError::Transient("relay down".into()));
        }
        self.digests
            .lock()
            .unwrap()
            .push((recipient.email.clone(), digest.document_count()));
        Ok(Sent::default())
    }
}
