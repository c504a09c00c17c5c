use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{IdentityError, TaxId};

/// Length of a well-formed NFe access key ("chave de acesso").
pub const ACCESS_KEY_LEN: usize = 44;

/// Issuer CNPJ position inside a 44-digit access key (after UF and AAMM).
const ISSUER_RANGE: std::ops::Range<usize> = 6..20;

/// Candidate document as returned by the portal gateway, before identity is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocumentDescriptor {
    pub access_key: String,
    pub issue_date: NaiveDate,
    pub total_value: f64,
    pub issuer_name: String,
    #[serde(default)]
    pub issuer_tax_id: Option<String>,
    #[serde(default)]
    pub nfe_number: Option<String>,
    #[serde(default)]
    pub series: Option<String>,
}

pub fn is_well_formed_access_key(key: &str) -> bool {
    key.len() == ACCESS_KEY_LEN && key.bytes().all(|b| b.is_ascii_digit())
}

/// Deduplication key: `(issuer tax id, access key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub issuer_tax_id: String,
    pub access_key: String,
}

impl NaturalKey {
    pub fn new(issuer_tax_id: impl Into<String>, access_key: impl Into<String>) -> Self {
        Self {
            issuer_tax_id: issuer_tax_id.into(),
            access_key: access_key.into(),
        }
    }

    /// Derives the key from a descriptor. A well-formed access key always wins over
    /// the descriptor's issuer field, so the same document maps to the same key no
    /// matter which optional fields the portal filled in on a given cycle.
    pub fn from_descriptor(descriptor: &RawDocumentDescriptor) -> Result<Self, IdentityError> {
        let access_key = descriptor.access_key.trim();
        if access_key.is_empty() {
            return Err(IdentityError::EmptyAccessKey);
        }

        let issuer_tax_id = if is_well_formed_access_key(access_key) {
            access_key[ISSUER_RANGE].to_string()
        } else {
            descriptor
                .issuer_tax_id
                .as_deref()
                .map(|raw| raw.chars().filter(char::is_ascii_digit).collect())
                .unwrap_or_default()
        };

        Ok(Self::new(issuer_tax_id, access_key))
    }

    /// Stable string form used by operators and the attempt log: `issuer:access_key`.
    pub fn document_key(&self) -> String {
        format!("{}:{}", self.issuer_tax_id, self.access_key)
    }

    pub fn parse_document_key(input: &str) -> Result<Self, IdentityError> {
        let (issuer, access_key) = input
            .split_once(':')
            .ok_or_else(|| IdentityError::InvalidDocumentKey(input.to_string()))?;
        if access_key.is_empty() {
            return Err(IdentityError::InvalidDocumentKey(input.to_string()));
        }
        Ok(Self::new(issuer, access_key))
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.issuer_tax_id, self.access_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Discovered,
    PendingNotification,
    Notified,
    DeadLetter,
}

impl DocumentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::PendingNotification => "pending_notification",
            Self::Notified => "notified",
            Self::DeadLetter => "dead_letter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Notified | Self::DeadLetter)
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentState {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(Self::Discovered),
            "pending_notification" => Ok(Self::PendingNotification),
            "notified" => Ok(Self::Notified),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(IdentityError::UnknownState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiscalDocument {
    pub key: NaturalKey,
    pub monitored_tax_id: TaxId,
    pub nfe_number: Option<String>,
    pub series: Option<String>,
    pub issuer_name: String,
    pub issue_date: NaiveDate,
    pub total_value: f64,
    pub first_seen_at: DateTime<Utc>,
    pub state: DocumentState,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub dead_letter_reason: Option<String>,
}

impl FiscalDocument {
    pub fn discovered(
        monitored_tax_id: &TaxId,
        key: NaturalKey,
        descriptor: &RawDocumentDescriptor,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            monitored_tax_id: monitored_tax_id.clone(),
            nfe_number: non_blank(descriptor.nfe_number.as_deref()),
            series: non_blank(descriptor.series.as_deref()),
            issuer_name: descriptor.issuer_name.trim().to_string(),
            issue_date: descriptor.issue_date,
            total_value: descriptor.total_value,
            first_seen_at: now,
            state: DocumentState::Discovered,
            attempt_count: 0,
            next_attempt_at: now,
            terminal_at: None,
            dead_letter_reason: None,
        }
    }

    pub fn into_pending(mut self) -> Self {
        self.state = DocumentState::PendingNotification;
        self
    }

    pub fn document_key(&self) -> String {
        self.key.document_key()
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// Lookup of natural keys already ingested.
pub trait KnownKeys {
    fn contains_key(&self, key: &NaturalKey) -> bool;
}

impl KnownKeys for HashSet<NaturalKey> {
    fn contains_key(&self, key: &NaturalKey) -> bool {
        self.contains(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    New(NaturalKey),
    Known(NaturalKey),
}

impl Classification {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }
}

/// Classifies a candidate purely by natural key; descriptive fields never matter.
pub fn classify<K: KnownKeys + ?Sized>(
    candidate: &RawDocumentDescriptor,
    known: &K,
) -> Result<Classification, IdentityError> {
    let key = NaturalKey::from_descriptor(candidate)?;
    if known.contains_key(&key) {
        Ok(Classification::Known(key))
    } else {
        Ok(Classification::New(key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::TransientFailure => "transient_failure",
            Self::PermanentFailure => "permanent_failure",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "transient_failure" => Ok(Self::TransientFailure),
            "permanent_failure" => Ok(Self::PermanentFailure),
            other => Err(IdentityError::UnknownOutcome(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAttempt {
    pub document_key: NaturalKey,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_44: &str = "35240612345678000190550010000012341000012345";

    fn descriptor(access_key: &str) -> RawDocumentDescriptor {
        RawDocumentDescriptor {
            access_key: access_key.to_string(),
            issue_date: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            total_value: 1234.56,
            issuer_name: "Fornecedor Exemplo Ltda".to_string(),
            issuer_tax_id: None,
            nfe_number: Some("1234".to_string()),
            series: Some(" ".to_string()),
        }
    }

    #[test]
    fn well_formed_access_key_determines_issuer() {
        assert!(is_well_formed_access_key(KEY_44));
        let mut d = descriptor(KEY_44);
        d.issuer_tax_id = Some("99.999.999/0001-99".to_string());

        let key = NaturalKey::from_descriptor(&d).unwrap();
        assert_eq!(key.issuer_tax_id, "12345678000190");
        assert_eq!(key.access_key, KEY_44);
    }

    #[test]
    fn short_access_key_falls_back_to_descriptor_issuer() {
        let mut d = descriptor(" A1 ");
        assert_eq!(NaturalKey::from_descriptor(&d).unwrap(), NaturalKey::new("", "A1"));

        d.issuer_tax_id = Some("11.222.333/0001-81".to_string());
        assert_eq!(
            NaturalKey::from_descriptor(&d).unwrap(),
            NaturalKey::new("11222333000181", "A1")
        );
    }

    #[test]
    fn empty_access_key_is_rejected() {
        assert_eq!(
            NaturalKey::from_descriptor(&descriptor("   ")),
            Err(IdentityError::EmptyAccessKey)
        );
    }

    #[test]
    fn classification_ignores_descriptive_fields() {
        let mut known = HashSet::new();
        let first = descriptor(KEY_44);
        assert!(classify(&first, &known).unwrap().is_new());
        known.insert(NaturalKey::from_descriptor(&first).unwrap());

        let mut changed = first.clone();
        changed.total_value = 1.0;
        changed.issuer_name = "Outro Nome".to_string();
        assert_eq!(
            classify(&changed, &known).unwrap(),
            Classification::Known(NaturalKey::from_descriptor(&first).unwrap())
        );
    }

    #[test]
    fn document_key_round_trips_through_text() {
        let key = NaturalKey::new("12345678000190", KEY_44);
        assert_eq!(NaturalKey::parse_document_key(&key.document_key()).unwrap(), key);
        assert_eq!(NaturalKey::parse_document_key(":A1").unwrap(), NaturalKey::new("", "A1"));
        assert!(NaturalKey::parse_document_key("no-separator").is_err());
    }

    #[test]
    fn discovered_document_normalizes_optional_fields() {
        let tax_id = TaxId::parse("12.345.678/0001-90").unwrap();
        let now = Utc::now();
        let d = descriptor(KEY_44);
        let key = NaturalKey::from_descriptor(&d).unwrap();
        let doc = FiscalDocument::discovered(&tax_id, key, &d, now);

        assert_eq!(doc.state, DocumentState::Discovered);
        assert_eq!(doc.series, None);
        assert_eq!(doc.nfe_number.as_deref(), Some("1234"));
        assert_eq!(doc.into_pending().state, DocumentState::PendingNotification);
    }

    #[test]
    fn states_parse_from_storage_text() {
        for state in [
            DocumentState::Discovered,
            DocumentState::PendingNotification,
            DocumentState::Notified,
            DocumentState::DeadLetter,
        ] {
            assert_eq!(state.as_str().parse::<DocumentState>().unwrap(), state);
        }
        assert!("archived".parse::<DocumentState>().is_err());
        assert!(DocumentState::DeadLetter.is_terminal());
        assert!(!DocumentState::PendingNotification.is_terminal());
    }
}
