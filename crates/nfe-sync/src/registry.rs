//! `companies.yaml`: the operator-maintained list of monitored companies.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use nfe_core::CompanyRegistration;
use nfe_storage::DedupStore;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompanyRegistry {
    #[serde(default)]
    pub companies: Vec<CompanyRegistration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySyncSummary {
    pub active: usize,
    pub disabled: usize,
}

impl CompanyRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing company registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for company in &self.companies {
            if !seen.insert(company.tax_id.as_str()) {
                bail!("company {} is listed more than once", company.tax_id.formatted());
            }
            if !company.notify_email.contains('@') {
                bail!(
                    "company {} has no usable notify_email ({:?})",
                    company.tax_id.formatted(),
                    company.notify_email
                );
            }
            if company.poll_interval_seconds == Some(0) {
                bail!("company {} has a zero poll interval", company.tax_id.formatted());
            }
        }
        Ok(())
    }

    /// Upserts every listed company. Companies missing from the file are left
    /// untouched; checkpoints and backoff state are never reset here.
    pub async fn sync(
        &self,
        store: &DedupStore,
        default_poll_interval_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<RegistrySyncSummary> {
        let mut summary = RegistrySyncSummary::default();
        for registration in &self.companies {
            store
                .upsert_company(registration, default_poll_interval_secs, now)
                .await
                .with_context(|| format!("upserting company {}", registration.tax_id))?;
            if registration.enabled {
                summary.active += 1;
            } else {
                summary.disabled += 1;
            }
        }
        info!(active = summary.active, disabled = summary.disabled, "company registry synced");
        Ok(summary)
    }
}
