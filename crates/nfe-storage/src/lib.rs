//! Durable deduplication store for the NFe monitor.
//!
//! The store is the single source of truth shared by every worker: document
//! identity and delivery state, per-company checkpoints and backoff gates, the
//! poll lease that gives single-flight per company, and the notification lease
//! that keeps two dispatchers off the same document. Every cross-worker
//! decision is a transaction or a conditional `UPDATE` here, never in-process
//! state.

mod error;
mod rows;

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::{debug, info, warn};

use nfe_core::{
    classify, to_chrono, AttemptOutcome, BackoffPolicy, Checkpoint, Classification,
    CompanyRegistration, CompanyStatus, DocumentState, FiscalDocument, MonitoredCompany,
    NaturalKey, NotificationAttempt, PollRun, PollRunStatus, RawDocumentDescriptor, TaxId,
};

pub use error::{StoreError, StoreResult};

use rows::{
    to_millis, AttemptRow, CompanyRow, DocumentRow, PollRunRow, COMPANY_COLUMNS,
    DOCUMENT_COLUMNS,
};

pub const CRATE_NAME: &str = "nfe-storage";

/// `disabled_reason` written when the company registry switches a company off.
/// Only companies disabled this way are switched back on by the registry.
pub const REGISTRY_DISABLED_REASON: &str = "disabled in registry";

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// SQLite caps bound parameters per statement; keep `IN (...)` lists well below it.
const IN_LIST_CHUNK: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    Success,
    Failure,
}

/// Read-only document filter for the query surface.
#[derive(Debug, Clone, Default)]
pub struct DocumentQuery {
    pub monitored_tax_id: Option<TaxId>,
    pub state: Option<DocumentState>,
    pub issued_from: Option<NaiveDate>,
    pub issued_to: Option<NaiveDate>,
    pub first_seen_from: Option<DateTime<Utc>>,
    pub first_seen_to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// What a delivery attempt does to its document besides being logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResolution<'a> {
    /// Stay pending; deliverable again from the given instant.
    RetryAt(DateTime<Utc>),
    Notified,
    DeadLetter(&'a str),
}

/// Final accounting for a poll run row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRunReport {
    pub status: PollRunStatus,
    pub documents_found: u32,
    pub new_documents: u32,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DedupStore {
    pool: SqlitePool,
}

impl DedupStore {
    /// Opens (creating if needed) the database at `database_url` and applies migrations.
    pub async fn open(database_url: &str) -> StoreResult<Self> {
        let in_memory = database_url.contains(":memory:");
        let mut opts = SqliteConnectOptions::from_str(database_url)?
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            opts = opts
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);
        }

        // One connection: SQLite serializes writers anyway, and an in-memory
        // database lives exactly as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(database_url, "deduplication store ready");
        Ok(store)
    }

    pub async fn open_in_memory() -> StoreResult<Self> {
        Self::open("sqlite::memory:").await
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Creates the company or refreshes its descriptive fields. Checkpoint and
    /// backoff state are never touched; a company disabled by a permanent portal
    /// failure stays disabled until an operator enables it.
    pub async fn upsert_company(
        &self,
        registration: &CompanyRegistration,
        default_poll_interval_seconds: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<MonitoredCompany> {
        let interval = registration
            .poll_interval_seconds
            .unwrap_or(default_poll_interval_seconds)
            .max(1);
        let (status, reason) = if registration.enabled {
            (CompanyStatus::Active, None)
        } else {
            (CompanyStatus::Disabled, Some(REGISTRY_DISABLED_REASON))
        };

        sqlx::query(
            r#"
            INSERT INTO monitored_companies (
                tax_id, display_name, state_code, notify_email, poll_interval_seconds,
                status, disabled_reason, next_eligible_poll_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?8)
            ON CONFLICT (tax_id) DO UPDATE SET
                display_name = excluded.display_name,
                state_code = excluded.state_code,
                notify_email = excluded.notify_email,
                poll_interval_seconds = excluded.poll_interval_seconds,
                status = CASE
                    WHEN excluded.status = 'disabled' THEN 'disabled'
                    WHEN monitored_companies.disabled_reason = ?9 THEN 'active'
                    ELSE monitored_companies.status
                END,
                disabled_reason = CASE
                    WHEN excluded.status = 'disabled' THEN excluded.disabled_reason
                    WHEN monitored_companies.disabled_reason = ?9 THEN NULL
                    ELSE monitored_companies.disabled_reason
                END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(registration.tax_id.as_str())
        .bind(registration.display_name.trim())
        .bind(registration.state_code.trim().to_ascii_uppercase())
        .bind(registration.notify_email.trim())
        .bind(interval as i64)
        .bind(status.as_str())
        .bind(reason)
        .bind(to_millis(now))
        .bind(REGISTRY_DISABLED_REASON)
        .execute(&self.pool)
        .await?;

        self.require_company(&registration.tax_id).await
    }

    pub async fn get_company(&self, tax_id: &TaxId) -> StoreResult<Option<MonitoredCompany>> {
        let sql = format!("SELECT {COMPANY_COLUMNS} FROM monitored_companies WHERE tax_id = ?");
        let row = sqlx::query_as::<_, CompanyRow>(&sql)
            .bind(tax_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(MonitoredCompany::try_from).transpose()
    }

    async fn require_company(&self, tax_id: &TaxId) -> StoreResult<MonitoredCompany> {
        self.get_company(tax_id)
            .await?
            .ok_or_else(|| StoreError::CompanyNotFound(tax_id.to_string()))
    }

    pub async fn list_companies(&self) -> StoreResult<Vec<MonitoredCompany>> {
        let sql = format!("SELECT {COMPANY_COLUMNS} FROM monitored_companies ORDER BY tax_id");
        let rows = sqlx::query_as::<_, CompanyRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(MonitoredCompany::try_from).collect()
    }

    /// Active companies whose backoff gate has passed and that nobody is polling.
    pub async fn list_eligible_companies(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<MonitoredCompany>> {
        let sql = format!(
            "SELECT {COMPANY_COLUMNS} FROM monitored_companies
              WHERE status = 'active'
                AND next_eligible_poll_at <= ?1
                AND (poll_lease_owner IS NULL OR poll_lease_expires_at IS NULL
                     OR poll_lease_expires_at <= ?1)
              ORDER BY next_eligible_poll_at, tax_id"
        );
        let rows = sqlx::query_as::<_, CompanyRow>(&sql)
            .bind(to_millis(now))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(MonitoredCompany::try_from).collect()
    }

    /// Claims the single-flight poll lease. `false` means the company is not due,
    /// not active, or another worker holds a live lease.
    pub async fn try_acquire_poll_lease(
        &self,
        tax_id: &TaxId,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE monitored_companies
               SET poll_lease_owner = ?1,
                   poll_lease_expires_at = ?2,
                   updated_at = ?3
             WHERE tax_id = ?4
               AND status = 'active'
               AND next_eligible_poll_at <= ?3
               AND (poll_lease_owner IS NULL OR poll_lease_expires_at IS NULL
                    OR poll_lease_expires_at <= ?3)
            "#,
        )
        .bind(owner)
        .bind(to_millis(now + to_chrono(ttl)))
        .bind(to_millis(now))
        .bind(tax_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release_poll_lease(&self, tax_id: &TaxId, owner: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE monitored_companies
               SET poll_lease_owner = NULL, poll_lease_expires_at = NULL
             WHERE tax_id = ? AND poll_lease_owner = ?
            "#,
        )
        .bind(tax_id.as_str())
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Advances the portal cursor. Callers only do this after the candidates of
    /// the same cycle were recorded, and only while they hold the poll lease.
    pub async fn update_checkpoint(
        &self,
        tax_id: &TaxId,
        lease_owner: &str,
        checkpoint: &Checkpoint,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE monitored_companies
               SET last_checkpoint = ?, updated_at = ?
             WHERE tax_id = ? AND poll_lease_owner = ?
            "#,
        )
        .bind(checkpoint.as_str())
        .bind(to_millis(now))
        .bind(tax_id.as_str())
        .bind(lease_owner)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.poll_lease_error(tax_id).await);
        }
        Ok(())
    }

    /// Closes a poll cycle: success resets the failure count and schedules the next
    /// regular poll; failure increments the count and sets the backoff gate to
    /// `now + backoff(consecutive_failure_count)`. Both release the poll lease, and
    /// both are rejected with [`StoreError::LeaseLost`] once another worker owns it.
    pub async fn record_poll_outcome(
        &self,
        tax_id: &TaxId,
        lease_owner: &str,
        result: PollResult,
        now: DateTime<Utc>,
        backoff: &BackoffPolicy,
    ) -> StoreResult<MonitoredCompany> {
        let now_ms = to_millis(now);
        match result {
            PollResult::Success => {
                let updated = sqlx::query(
                    r#"
                    UPDATE monitored_companies
                       SET consecutive_failure_count = 0,
                           last_poll_at = ?1,
                           next_eligible_poll_at = ?1 + poll_interval_seconds * 1000,
                           poll_lease_owner = NULL,
                           poll_lease_expires_at = NULL,
                           updated_at = ?1
                     WHERE tax_id = ?2 AND poll_lease_owner = ?3
                    "#,
                )
                .bind(now_ms)
                .bind(tax_id.as_str())
                .bind(lease_owner)
                .execute(&self.pool)
                .await?;
                if updated.rows_affected() == 0 {
                    return Err(self.poll_lease_error(tax_id).await);
                }
            }
            PollResult::Failure => {
                let mut tx = self.pool.begin().await?;
                let failures: Option<i64> = sqlx::query_scalar(
                    r#"
                    UPDATE monitored_companies
                       SET consecutive_failure_count = consecutive_failure_count + 1,
                           last_poll_at = ?1,
                           poll_lease_owner = NULL,
                           poll_lease_expires_at = NULL,
                           updated_at = ?1
                     WHERE tax_id = ?2 AND poll_lease_owner = ?3
                    RETURNING consecutive_failure_count
                    "#,
                )
                .bind(now_ms)
                .bind(tax_id.as_str())
                .bind(lease_owner)
                .fetch_optional(&mut *tx)
                .await?;
                let Some(failures) = failures else {
                    tx.rollback().await?;
                    return Err(self.poll_lease_error(tax_id).await);
                };

                let exponent = u32::try_from(failures).unwrap_or(u32::MAX);
                let delay = backoff.jittered_delay_for_attempt(exponent);
                let next_eligible = now + to_chrono(delay);
                sqlx::query(
                    "UPDATE monitored_companies SET next_eligible_poll_at = ? WHERE tax_id = ?",
                )
                .bind(to_millis(next_eligible))
                .bind(tax_id.as_str())
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;

                debug!(%tax_id, failures, delay_secs = delay.as_secs(), "poll backoff scheduled");
            }
        }
        self.require_company(tax_id).await
    }

    /// Why an owner-checked company write matched nothing.
    async fn poll_lease_error(&self, tax_id: &TaxId) -> StoreError {
        match self.get_company(tax_id).await {
            Ok(Some(_)) => StoreError::LeaseLost(tax_id.to_string()),
            Ok(None) => StoreError::CompanyNotFound(tax_id.to_string()),
            Err(err) => err,
        }
    }

    /// Takes a company out of rotation after a permanent portal failure.
    pub async fn disable_company(
        &self,
        tax_id: &TaxId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE monitored_companies
               SET status = 'disabled',
                   disabled_reason = ?1,
                   last_poll_at = ?2,
                   poll_lease_owner = NULL,
                   poll_lease_expires_at = NULL,
                   updated_at = ?2
             WHERE tax_id = ?3
            "#,
        )
        .bind(reason)
        .bind(to_millis(now))
        .bind(tax_id.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::CompanyNotFound(tax_id.to_string()));
        }
        Ok(())
    }

    /// Operator re-enable: clears failures and makes the company due immediately.
    pub async fn enable_company(&self, tax_id: &TaxId, now: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE monitored_companies
               SET status = 'active',
                   disabled_reason = NULL,
                   consecutive_failure_count = 0,
                   next_eligible_poll_at = ?1,
                   updated_at = ?1
             WHERE tax_id = ?2
            "#,
        )
        .bind(to_millis(now))
        .bind(tax_id.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::CompanyNotFound(tax_id.to_string()));
        }
        Ok(())
    }

    /// Inserts every candidate whose natural key is not stored yet, in one
    /// transaction, and returns exactly the documents this call inserted.
    /// Repeated keys (across calls or within `candidates`) are no-ops.
    pub async fn record_candidates(
        &self,
        tax_id: &TaxId,
        candidates: &[RawDocumentDescriptor],
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<FiscalDocument>> {
        let mut tx = self.pool.begin().await?;

        // Writing first takes the write lock up front and proves the company exists.
        let touched = sqlx::query("UPDATE monitored_companies SET updated_at = ? WHERE tax_id = ?")
            .bind(to_millis(now))
            .bind(tax_id.as_str())
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(StoreError::CompanyNotFound(tax_id.to_string()));
        }

        let access_keys: Vec<String> = candidates
            .iter()
            .map(|c| c.access_key.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        let mut known = load_known_keys(&mut *tx, &access_keys).await?;

        let mut inserted = Vec::new();
        for candidate in candidates {
            let key = match classify(candidate, &known) {
                Ok(Classification::New(key)) => key,
                Ok(Classification::Known(key)) => {
                    debug!(%tax_id, document_key = %key, "candidate already ingested");
                    continue;
                }
                Err(err) => {
                    warn!(
                        %tax_id,
                        error = %err,
                        issuer = %candidate.issuer_name,
                        "skipping malformed candidate"
                    );
                    continue;
                }
            };

            let document =
                FiscalDocument::discovered(tax_id, key.clone(), candidate, now).into_pending();
            let result = sqlx::query(
                r#"
                INSERT INTO fiscal_documents (
                    issuer_tax_id, access_key, monitored_tax_id, nfe_number, series,
                    issuer_name, issue_date, total_value, first_seen_at, state,
                    attempt_count, next_attempt_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
                ON CONFLICT (issuer_tax_id, access_key) DO NOTHING
                "#,
            )
            .bind(&document.key.issuer_tax_id)
            .bind(&document.key.access_key)
            .bind(tax_id.as_str())
            .bind(document.nfe_number.as_deref())
            .bind(document.series.as_deref())
            .bind(&document.issuer_name)
            .bind(document.issue_date.format("%Y-%m-%d").to_string())
            .bind(document.total_value)
            .bind(to_millis(document.first_seen_at))
            .bind(document.state.as_str())
            .bind(to_millis(document.next_attempt_at))
            .execute(&mut *tx)
            .await?;

            known.insert(key);
            if result.rows_affected() == 1 {
                inserted.push(document);
            }
        }

        tx.commit().await?;
        debug!(
            %tax_id,
            candidates = candidates.len(),
            inserted = inserted.len(),
            "candidates recorded"
        );
        Ok(inserted)
    }

    /// Leases up to `limit` deliverable documents to `lease_owner`, oldest first.
    /// The claim is a single statement, so two callers never receive the same row
    /// while its lease is live.
    pub async fn fetch_pending(
        &self,
        limit: u32,
        lease_owner: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<FiscalDocument>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "UPDATE fiscal_documents
                SET lease_owner = ?1, lease_expires_at = ?2
              WHERE id IN (
                    SELECT id FROM fiscal_documents
                     WHERE state = 'pending_notification'
                       AND next_attempt_at <= ?3
                       AND (lease_owner IS NULL OR lease_expires_at IS NULL
                            OR lease_expires_at <= ?3)
                     ORDER BY first_seen_at ASC, id ASC
                     LIMIT ?4)
            RETURNING {DOCUMENT_COLUMNS}"
        );
        let mut rows = sqlx::query_as::<_, DocumentRow>(&sql)
            .bind(lease_owner)
            .bind(to_millis(now + to_chrono(lease_ttl)))
            .bind(to_millis(now))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.sort_by_key(|row| (row.first_seen_at, row.id));
        rows.into_iter().map(FiscalDocument::try_from).collect()
    }

    /// Extends `lease_owner`'s claim on a pending document. `false` means the
    /// document is terminal or another worker claimed it after the lease lapsed.
    pub async fn renew_document_lease(
        &self,
        key: &NaturalKey,
        lease_owner: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE fiscal_documents
               SET lease_expires_at = ?1
             WHERE issuer_tax_id = ?2 AND access_key = ?3
               AND state = 'pending_notification'
               AND lease_owner = ?4
            "#,
        )
        .bind(to_millis(now + to_chrono(lease_ttl)))
        .bind(&key.issuer_tax_id)
        .bind(&key.access_key)
        .bind(lease_owner)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Appends a delivery attempt, bumps the document's attempt count, releases
    /// its lease and applies `resolution`, all in one transaction. Returns the
    /// 1-based attempt number.
    ///
    /// Only the lease holder (or anyone, for a document nobody has claimed) may
    /// record; a document claimed by someone else yields [`StoreError::LeaseLost`].
    pub async fn record_attempt(
        &self,
        key: &NaturalKey,
        lease_owner: &str,
        outcome: AttemptOutcome,
        detail: Option<&str>,
        resolution: AttemptResolution<'_>,
        now: DateTime<Utc>,
    ) -> StoreResult<u32> {
        let (state, next_attempt_at, terminal_at, reason) = match resolution {
            AttemptResolution::RetryAt(at) => {
                (DocumentState::PendingNotification, Some(to_millis(at)), None, None)
            }
            AttemptResolution::Notified => {
                (DocumentState::Notified, None, Some(to_millis(now)), None)
            }
            AttemptResolution::DeadLetter(reason) => {
                (DocumentState::DeadLetter, None, Some(to_millis(now)), Some(reason))
            }
        };

        let mut tx = self.pool.begin().await?;
        let attempt: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE fiscal_documents
               SET attempt_count = attempt_count + 1,
                   state = ?1,
                   next_attempt_at = COALESCE(?2, next_attempt_at),
                   terminal_at = ?3,
                   dead_letter_reason = ?4,
                   lease_owner = NULL,
                   lease_expires_at = NULL
             WHERE issuer_tax_id = ?5 AND access_key = ?6
               AND state = 'pending_notification'
               AND (lease_owner IS NULL OR lease_owner = ?7)
            RETURNING attempt_count
            "#,
        )
        .bind(state.as_str())
        .bind(next_attempt_at)
        .bind(terminal_at)
        .bind(reason)
        .bind(&key.issuer_tax_id)
        .bind(&key.access_key)
        .bind(lease_owner)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(attempt) = attempt else {
            tx.rollback().await?;
            return Err(match self.document_state(key).await? {
                Some(state) if state.is_terminal() => StoreError::NotPending(key.document_key()),
                Some(_) => StoreError::LeaseLost(key.document_key()),
                None => StoreError::DocumentNotFound(key.document_key()),
            });
        };

        sqlx::query(
            r#"
            INSERT INTO notification_attempts (
                issuer_tax_id, access_key, attempt_number, outcome, detail, attempted_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&key.issuer_tax_id)
        .bind(&key.access_key)
        .bind(attempt)
        .bind(outcome.as_str())
        .bind(detail)
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(u32::try_from(attempt).unwrap_or(u32::MAX))
    }

    /// `true` if this call moved the document to `notified`; `false` if it was
    /// already terminal.
    pub async fn mark_notified(
        &self,
        key: &NaturalKey,
        lease_owner: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.mark_terminal(key, lease_owner, DocumentState::Notified, None, now)
            .await
    }

    /// `true` if this call moved the document to `dead_letter`; `false` if it was
    /// already terminal.
    pub async fn mark_dead_letter(
        &self,
        key: &NaturalKey,
        lease_owner: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.mark_terminal(key, lease_owner, DocumentState::DeadLetter, Some(reason), now)
            .await
    }

    async fn mark_terminal(
        &self,
        key: &NaturalKey,
        lease_owner: &str,
        state: DocumentState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE fiscal_documents
               SET state = ?1,
                   terminal_at = ?2,
                   dead_letter_reason = ?3,
                   lease_owner = NULL,
                   lease_expires_at = NULL
             WHERE issuer_tax_id = ?4 AND access_key = ?5
               AND state = 'pending_notification'
               AND (lease_owner IS NULL OR lease_owner = ?6)
            "#,
        )
        .bind(state.as_str())
        .bind(to_millis(now))
        .bind(reason)
        .bind(&key.issuer_tax_id)
        .bind(&key.access_key)
        .bind(lease_owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.document_state(key).await? {
            Some(current) if current.is_terminal() => Ok(false),
            Some(_) => Err(StoreError::LeaseLost(key.document_key())),
            None => Err(StoreError::DocumentNotFound(key.document_key())),
        }
    }

    async fn document_state(&self, key: &NaturalKey) -> StoreResult<Option<DocumentState>> {
        let state: Option<String> = sqlx::query_scalar(
            "SELECT state FROM fiscal_documents WHERE issuer_tax_id = ? AND access_key = ?",
        )
        .bind(&key.issuer_tax_id)
        .bind(&key.access_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state.map(|s| s.parse::<DocumentState>()).transpose()?)
    }

    pub async fn get_document(&self, key: &NaturalKey) -> StoreResult<Option<FiscalDocument>> {
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM fiscal_documents
             WHERE issuer_tax_id = ? AND access_key = ?"
        );
        let row = sqlx::query_as::<_, DocumentRow>(&sql)
            .bind(&key.issuer_tax_id)
            .bind(&key.access_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(FiscalDocument::try_from).transpose()
    }

    /// Documents matching `filter`, oldest first.
    pub async fn query_documents(
        &self,
        filter: &DocumentQuery,
    ) -> StoreResult<Vec<FiscalDocument>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {DOCUMENT_COLUMNS} FROM fiscal_documents WHERE 1 = 1"
        ));
        if let Some(tax_id) = &filter.monitored_tax_id {
            qb.push(" AND monitored_tax_id = ").push_bind(tax_id.as_str().to_string());
        }
        if let Some(state) = filter.state {
            qb.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(from) = filter.issued_from {
            qb.push(" AND issue_date >= ").push_bind(from.format("%Y-%m-%d").to_string());
        }
        if let Some(to) = filter.issued_to {
            qb.push(" AND issue_date <= ").push_bind(to.format("%Y-%m-%d").to_string());
        }
        if let Some(from) = filter.first_seen_from {
            qb.push(" AND first_seen_at >= ").push_bind(to_millis(from));
        }
        if let Some(to) = filter.first_seen_to {
            qb.push(" AND first_seen_at < ").push_bind(to_millis(to));
        }
        qb.push(" ORDER BY first_seen_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = qb
            .build_query_as::<DocumentRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(FiscalDocument::try_from).collect()
    }

    pub async fn list_attempts(&self, key: &NaturalKey) -> StoreResult<Vec<NotificationAttempt>> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT issuer_tax_id, access_key, attempt_number, outcome, detail, attempted_at
              FROM notification_attempts
             WHERE issuer_tax_id = ? AND access_key = ?
             ORDER BY attempt_number
            "#,
        )
        .bind(&key.issuer_tax_id)
        .bind(&key.access_key)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(NotificationAttempt::try_from).collect()
    }

    pub async fn start_poll_run(&self, tax_id: &TaxId, now: DateTime<Utc>) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO poll_runs (tax_id, started_at, status) VALUES (?, ?, 'running')",
        )
        .bind(tax_id.as_str())
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn finish_poll_run(
        &self,
        run_id: i64,
        report: &PollRunReport,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE poll_runs
               SET finished_at = ?, status = ?, documents_found = ?, new_documents = ?,
                   error_kind = ?, error_message = ?
             WHERE id = ?
            "#,
        )
        .bind(to_millis(now))
        .bind(report.status.as_str())
        .bind(i64::from(report.documents_found))
        .bind(i64::from(report.new_documents))
        .bind(report.error_kind.as_deref())
        .bind(report.error_message.as_deref())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_poll_runs(&self, tax_id: &TaxId, limit: u32) -> StoreResult<Vec<PollRun>> {
        let rows = sqlx::query_as::<_, PollRunRow>(
            r#"
            SELECT id, tax_id, started_at, finished_at, status, documents_found,
                   new_documents, error_kind, error_message
              FROM poll_runs
             WHERE tax_id = ?
             ORDER BY started_at DESC, id DESC
             LIMIT ?
            "#,
        )
        .bind(tax_id.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PollRun::try_from).collect()
    }
}

async fn load_known_keys(
    conn: &mut SqliteConnection,
    access_keys: &[String],
) -> StoreResult<HashSet<NaturalKey>> {
    let mut known = HashSet::new();
    for chunk in access_keys.chunks(IN_LIST_CHUNK) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT issuer_tax_id, access_key FROM fiscal_documents WHERE access_key IN (",
        );
        let mut separated = qb.separated(", ");
        for key in chunk {
            separated.push_bind(key.as_str());
        }
        separated.push_unseparated(")");

        let rows = qb
            .build_query_as::<(String, String)>()
            .fetch_all(&mut *conn)
            .await?;
        known.extend(
            rows.into_iter()
                .map(|(issuer, access_key)| NaturalKey::new(issuer, access_key)),
        );
    }
    Ok(known)
}
