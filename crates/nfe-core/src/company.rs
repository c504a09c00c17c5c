use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::IdentityError;

/// Brazilian company tax ID (CNPJ), stored as its 14 bare digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaxId(String);

impl TaxId {
    pub const LEN: usize = 14;

    /// Accepts bare digits or the `XX.XXX.XXX/XXXX-XX` display form.
    pub fn parse(input: &str) -> Result<Self, IdentityError> {
        let trimmed = input.trim();
        let has_foreign_chars = trimmed
            .chars()
            .any(|c| !(c.is_ascii_digit() || matches!(c, '.' | '/' | '-')));
        let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
        if has_foreign_chars || digits.len() != Self::LEN {
            return Err(IdentityError::InvalidTaxId(input.to_string()));
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn formatted(&self) -> String {
        let d = &self.0;
        format!(
            "{}.{}.{}/{}-{}",
            &d[0..2],
            &d[2..5],
            &d[5..8],
            &d[8..12],
            &d[12..14]
        )
    }
}

impl fmt::Display for TaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TaxId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TaxId> for String {
    fn from(value: TaxId) -> Self {
        value.0
    }
}

impl FromStr for TaxId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Opaque portal cursor. Only the gateway interprets its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(pub String);

impl Checkpoint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyStatus {
    Active,
    Disabled,
}

impl CompanyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }
}

impl FromStr for CompanyStatus {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "disabled" => Ok(Self::Disabled),
            other => Err(IdentityError::UnknownStatus(other.to_string())),
        }
    }
}

/// Where a company sits in its poll state machine, derived from durable fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollPhase {
    Idle,
    Polling,
    BackingOff,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitoredCompany {
    pub tax_id: TaxId,
    pub display_name: String,
    pub state_code: String,
    pub notify_email: String,
    pub poll_interval_seconds: u64,
    pub status: CompanyStatus,
    pub disabled_reason: Option<String>,
    pub last_checkpoint: Option<Checkpoint>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub consecutive_failure_count: u32,
    pub next_eligible_poll_at: DateTime<Utc>,
    pub poll_lease_owner: Option<String>,
    pub poll_lease_expires_at: Option<DateTime<Utc>>,
}

impl MonitoredCompany {
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.poll_lease_owner.is_some()
            && self.poll_lease_expires_at.is_some_and(|expires| expires > now)
    }

    pub fn phase(&self, now: DateTime<Utc>) -> PollPhase {
        if self.status == CompanyStatus::Disabled {
            PollPhase::Disabled
        } else if self.has_live_lease(now) {
            PollPhase::Polling
        } else if self.consecutive_failure_count > 0 && self.next_eligible_poll_at > now {
            PollPhase::BackingOff
        } else {
            PollPhase::Idle
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == CompanyStatus::Active
            && self.next_eligible_poll_at <= now
            && !self.has_live_lease(now)
    }

    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            self.tax_id.as_str()
        } else {
            &self.display_name
        }
    }
}

/// Registry entry used to create or refresh a monitored company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRegistration {
    pub tax_id: TaxId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub state_code: String,
    pub notify_email: String,
    #[serde(default)]
    pub poll_interval_seconds: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollRunStatus {
    Running,
    Success,
    Failed,
}

impl PollRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for PollRunStatus {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(IdentityError::UnknownStatus(other.to_string())),
        }
    }
}

/// One poll cycle, as written to the run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollRun {
    pub id: i64,
    pub tax_id: TaxId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: PollRunStatus,
    pub documents_found: u32,
    pub new_documents: u32,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}
