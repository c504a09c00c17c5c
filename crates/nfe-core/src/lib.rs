//! Core domain model for the NFe monitor: tax IDs, fiscal document identity,
//! monitored companies and the small time/backoff primitives shared by the
//! storage, gateway and sync crates.

mod backoff;
mod clock;
mod company;
mod document;

use thiserror::Error;

pub use backoff::{to_chrono, BackoffPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use company::{
    Checkpoint, CompanyRegistration, CompanyStatus, MonitoredCompany, PollPhase, PollRun,
    PollRunStatus, TaxId,
};
pub use document::{
    classify, is_well_formed_access_key, AttemptOutcome, Classification, DocumentState,
    FiscalDocument, KnownKeys, NaturalKey, NotificationAttempt, RawDocumentDescriptor,
    ACCESS_KEY_LEN,
};

pub const CRATE_NAME: &str = "nfe-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("invalid tax id {0:?}: expected 14 digits")]
    InvalidTaxId(String),
    #[error("candidate has an empty access key")]
    EmptyAccessKey,
    #[error("invalid document key {0:?}")]
    InvalidDocumentKey(String),
    #[error("unknown document state {0:?}")]
    UnknownState(String),
    #[error("unknown attempt outcome {0:?}")]
    UnknownOutcome(String),
    #[error("unknown company status {0:?}")]
    UnknownStatus(String),
}
