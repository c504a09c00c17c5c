use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nfe_core::{FiscalDocument, TaxId};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::email::{EmailMessage, EmailRenderer};
use crate::NotifyError;

/// Who receives alerts for a monitored company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub email: String,
    pub company_name: String,
    pub tax_id: TaxId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sent {
    pub message_id: Option<String>,
}

/// Documents first seen in `[since, until)` for one company.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyDigest {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub documents: Vec<FiscalDocument>,
}

impl DailyDigest {
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn total_value(&self) -> f64 {
        self.documents.iter().map(|d| d.total_value).sum()
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(
        &self,
        recipient: &Recipient,
        document: &FiscalDocument,
    ) -> Result<Sent, NotifyError>;

    async fn send_digest(
        &self,
        recipient: &Recipient,
        digest: &DailyDigest,
    ) -> Result<Sent, NotifyError>;
}

/// Logs the rendered email instead of delivering it.
#[derive(Debug, Clone, Default)]
pub struct LogChannel {
    renderer: EmailRenderer,
}

impl LogChannel {
    pub fn new(renderer: EmailRenderer) -> Self {
        Self { renderer }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(
        &self,
        recipient: &Recipient,
        document: &FiscalDocument,
    ) -> Result<Sent, NotifyError> {
        let email = self.renderer.document_email(recipient, document);
        info!(
            to = %recipient.email,
            subject = %email.subject,
            document_key = %document.key,
            "email delivery mocked"
        );
        Ok(Sent::default())
    }

    async fn send_digest(
        &self,
        recipient: &Recipient,
        digest: &DailyDigest,
    ) -> Result<Sent, NotifyError> {
        let email = self.renderer.digest_email(recipient, digest);
        info!(
            to = %recipient.email,
            subject = %email.subject,
            documents = digest.document_count(),
            "digest delivery mocked"
        );
        Ok(Sent::default())
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub url: String,
    pub timeout: Duration,
    pub renderer: EmailRenderer,
}

#[derive(Debug, Serialize)]
struct RelayRequest<'a> {
    from_name: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct RelayResponse {
    #[serde(default)]
    id: Option<String>,
}

/// Posts rendered emails to an HTTP mail relay.
#[derive(Debug)]
pub struct HttpRelayChannel {
    client: reqwest::Client,
    url: String,
    renderer: EmailRenderer,
}

impl HttpRelayChannel {
    pub fn new(config: RelayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building email relay http client")?;
        Ok(Self {
            client,
            url: config.url,
            renderer: config.renderer,
        })
    }

    async fn deliver(&self, to: &str, email: &EmailMessage) -> Result<Sent, NotifyError> {
        let request = RelayRequest {
            from_name: &self.renderer.from_name,
            to,
            subject: &email.subject,
            html: &email.html,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|err| classify_relay_error(&err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_relay_status(status, body.trim()));
        }
        // Relays that answer without a body still accepted the message.
        let body = response.json::<RelayResponse>().await.unwrap_or_default();
        debug!(to, message_id = ?body.id, "relay accepted email");
        Ok(Sent { message_id: body.id })
    }
}

fn classify_relay_status(status: StatusCode, body: &str) -> NotifyError {
    let detail = if body.is_empty() {
        format!("relay status {status}")
    } else {
        format!("relay status {status}: {body}")
    };
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        NotifyError::Transient(detail)
    } else {
        NotifyError::Permanent(detail)
    }
}

fn classify_relay_error(err: &reqwest::Error) -> NotifyError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        NotifyError::Transient(err.to_string())
    } else {
        NotifyError::Permanent(err.to_string())
    }
}

#[async_trait]
impl NotificationChannel for HttpRelayChannel {
    fn name(&self) -> &'static str {
        "email-relay"
    }

    async fn send(
        &self,
        recipient: &Recipient,
        document: &FiscalDocument,
    ) -> Result<Sent, NotifyError> {
        let email = self.renderer.document_email(recipient, document);
        self.deliver(&recipient.email, &email).await
    }

    async fn send_digest(
        &self,
        recipient: &Recipient,
        digest: &DailyDigest,
    ) -> Result<Sent, NotifyError> {
        let email = self.renderer.digest_email(recipient, digest);
        self.deliver(&recipient.email, &email).await
    }
}
