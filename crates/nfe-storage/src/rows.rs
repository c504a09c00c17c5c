//! Raw table rows and their conversion into domain types.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;

use nfe_core::{
    Checkpoint, FiscalDocument, MonitoredCompany, NaturalKey, NotificationAttempt, PollRun, TaxId,
};

use crate::error::{StoreError, StoreResult};

pub(crate) const COMPANY_COLUMNS: &str = "tax_id, display_name, state_code, notify_email, \
     poll_interval_seconds, status, disabled_reason, last_checkpoint, last_poll_at, \
     consecutive_failure_count, next_eligible_poll_at, poll_lease_owner, poll_lease_expires_at";

pub(crate) const DOCUMENT_COLUMNS: &str = "id, issuer_tax_id, access_key, monitored_tax_id, \
     nfe_number, series, issuer_name, issue_date, total_value, first_seen_at, state, \
     attempt_count, next_attempt_at, terminal_at, dead_letter_reason";

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {millis}")))
}

fn opt_from_millis(millis: Option<i64>) -> StoreResult<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}

fn to_u32(value: i64, column: &str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

#[derive(Debug, FromRow)]
pub(crate) struct CompanyRow {
    tax_id: String,
    display_name: String,
    state_code: String,
    notify_email: String,
    poll_interval_seconds: i64,
    status: String,
    disabled_reason: Option<String>,
    last_checkpoint: Option<String>,
    last_poll_at: Option<i64>,
    consecutive_failure_count: i64,
    next_eligible_poll_at: i64,
    poll_lease_owner: Option<String>,
    poll_lease_expires_at: Option<i64>,
}

impl TryFrom<CompanyRow> for MonitoredCompany {
    type Error = StoreError;

    fn try_from(row: CompanyRow) -> StoreResult<Self> {
        Ok(MonitoredCompany {
            tax_id: TaxId::parse(&row.tax_id)?,
            display_name: row.display_name,
            state_code: row.state_code,
            notify_email: row.notify_email,
            poll_interval_seconds: u64::try_from(row.poll_interval_seconds).map_err(|_| {
                StoreError::Corrupt(format!(
                    "poll_interval_seconds out of range: {}",
                    row.poll_interval_seconds
                ))
            })?,
            status: row.status.parse()?,
            disabled_reason: row.disabled_reason,
            last_checkpoint: row.last_checkpoint.map(Checkpoint),
            last_poll_at: opt_from_millis(row.last_poll_at)?,
            consecutive_failure_count: to_u32(
                row.consecutive_failure_count,
                "consecutive_failure_count",
            )?,
            next_eligible_poll_at: from_millis(row.next_eligible_poll_at)?,
            poll_lease_owner: row.poll_lease_owner,
            poll_lease_expires_at: opt_from_millis(row.poll_lease_expires_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct DocumentRow {
    pub(crate) id: i64,
    issuer_tax_id: String,
    access_key: String,
    monitored_tax_id: String,
    nfe_number: Option<String>,
    series: Option<String>,
    issuer_name: String,
    issue_date: String,
    total_value: f64,
    pub(crate) first_seen_at: i64,
    state: String,
    attempt_count: i64,
    next_attempt_at: i64,
    terminal_at: Option<i64>,
    dead_letter_reason: Option<String>,
}

impl TryFrom<DocumentRow> for FiscalDocument {
    type Error = StoreError;

    fn try_from(row: DocumentRow) -> StoreResult<Self> {
        let issue_date = NaiveDate::parse_from_str(&row.issue_date, "%Y-%m-%d")
            .map_err(|e| {
                StoreError::Corrupt(format!("invalid issue_date {:?}: {e}", row.issue_date))
            })?;
        Ok(FiscalDocument {
            key: NaturalKey::new(row.issuer_tax_id, row.access_key),
            monitored_tax_id: TaxId::parse(&row.monitored_tax_id)?,
            nfe_number: row.nfe_number,
            series: row.series,
            issuer_name: row.issuer_name,
            issue_date,
            total_value: row.total_value,
            first_seen_at: from_millis(row.first_seen_at)?,
            state: row.state.parse()?,
            attempt_count: to_u32(row.attempt_count, "attempt_count")?,
            next_attempt_at: from_millis(row.next_attempt_at)?,
            terminal_at: opt_from_millis(row.terminal_at)?,
            dead_letter_reason: row.dead_letter_reason,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct AttemptRow {
    issuer_tax_id: String,
    access_key: String,
    attempt_number: i64,
    outcome: String,
    detail: Option<String>,
    attempted_at: i64,
}

impl TryFrom<AttemptRow> for NotificationAttempt {
    type Error = StoreError;

    fn try_from(row: AttemptRow) -> StoreResult<Self> {
        Ok(NotificationAttempt {
            document_key: NaturalKey::new(row.issuer_tax_id, row.access_key),
            attempt_number: to_u32(row.attempt_number, "attempt_number")?,
            outcome: row.outcome.parse()?,
            detail: row.detail,
            attempted_at: from_millis(row.attempted_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct PollRunRow {
    id: i64,
    tax_id: String,
    started_at: i64,
    finished_at: Option<i64>,
    status: String,
    documents_found: i64,
    new_documents: i64,
    error_kind: Option<String>,
    error_message: Option<String>,
}

impl TryFrom<PollRunRow> for PollRun {
    type Error = StoreError;

    fn try_from(row: PollRunRow) -> StoreResult<Self> {
        Ok(PollRun {
            id: row.id,
            tax_id: TaxId::parse(&row.tax_id)?,
            started_at: from_millis(row.started_at)?,
            finished_at: opt_from_millis(row.finished_at)?,
            status: row.status.parse()?,
            documents_found: to_u32(row.documents_found, "documents_found")?,
            new_documents: to_u32(row.new_documents, "new_documents")?,
            error_kind: row.error_kind,
            error_message: row.error_message,
        })
    }
}
