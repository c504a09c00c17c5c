//! Consumed edges of the pipeline: the fiscal portal and the notification channel.
//!
//! Both are capability traits with a typed failure taxonomy. The crate ships an
//! HTTP portal client (a sidecar that fronts the SEFAZ portal), a fixture-backed
//! portal for offline runs and tests, an email relay channel and a logging
//! channel that stands in for delivery when no relay is configured.

mod channel;
mod email;
mod error;
mod fixture;
mod http;

use std::time::Duration;

use async_trait::async_trait;
use nfe_core::{Checkpoint, RawDocumentDescriptor, TaxId};

pub use channel::{
    DailyDigest, HttpRelayChannel, LogChannel, NotificationChannel, Recipient, RelayConfig, Sent,
};
pub use email::{escape_html, format_brl, format_date_br, EmailMessage, EmailRenderer};
pub use error::{GatewayError, NotifyError};
pub use fixture::{load_portal_fixture, FixtureFailure, FixturePortalGateway, PortalFixture};
pub use http::{
    classify_reqwest_error, classify_status, HttpClientConfig, HttpPortalGateway,
    SimpleTokenBucket, TokenBucketConfig,
};

pub const CRATE_NAME: &str = "nfe-gateway";

/// Result of one successful portal fetch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PortalBatch {
    pub candidates: Vec<RawDocumentDescriptor>,
    /// Cursor to persist once the candidates are recorded. `None` keeps the
    /// previous checkpoint.
    pub checkpoint: Option<Checkpoint>,
}

#[async_trait]
pub trait PortalGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lists documents issued against `tax_id` since `checkpoint`. Results may
    /// overlap earlier fetches; deduplication is the store's job.
    async fn fetch(
        &self,
        tax_id: &TaxId,
        checkpoint: Option<&Checkpoint>,
        timeout: Duration,
    ) -> Result<PortalBatch, GatewayError>;
}

/// Cursor covering every candidate in `candidates`: the latest issue date seen,
/// never earlier than `previous`. Overlap is deliberate; the portal only
/// filters by day.
pub fn advance_checkpoint(
    previous: Option<&Checkpoint>,
    candidates: &[RawDocumentDescriptor],
) -> Option<Checkpoint> {
    let latest = candidates.iter().map(|c| c.issue_date).max()?;
    let previous_date = previous.and_then(checkpoint_date);
    match previous_date {
        Some(prev) if prev >= latest => previous.cloned(),
        _ => Some(Checkpoint::new(latest.format("%Y-%m-%d").to_string())),
    }
}

/// Cursor to keep after a fetch. A cursor reported by the portal is taken as
/// long as it does not move backwards; without one, the cursor is derived from
/// the candidates. Cursors that are not ISO dates cannot be compared and are
/// taken as reported.
pub fn resolve_checkpoint(
    previous: Option<&Checkpoint>,
    reported: Option<Checkpoint>,
    candidates: &[RawDocumentDescriptor],
) -> Option<Checkpoint> {
    let Some(reported) = reported else {
        return advance_checkpoint(previous, candidates);
    };
    match previous {
        Some(prev) => match (checkpoint_date(prev), checkpoint_date(&reported)) {
            (Some(prev_date), Some(reported_date)) if reported_date < prev_date => {
                Some(prev.clone())
            }
            _ => Some(reported),
        },
        None => Some(reported),
    }
}

/// Checkpoints issued by this crate are ISO dates.
pub fn checkpoint_date(checkpoint: &Checkpoint) -> Option<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(checkpoint.as_str(), "%Y-%m-%d").ok()
}
