//! Fixture-first portal: one JSON file per company under a fixtures directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nfe_core::{Checkpoint, RawDocumentDescriptor, TaxId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{advance_checkpoint, checkpoint_date, GatewayError, PortalBatch, PortalGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureFailure {
    Transient,
    RateLimited,
    Permanent,
}

/// Contents of `<fixtures_dir>/<tax_id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalFixture {
    pub tax_id: TaxId,
    #[serde(default)]
    pub notes: Option<String>,
    /// Makes every fetch for this company fail with the given kind.
    #[serde(default)]
    pub fail_with: Option<FixtureFailure>,
    #[serde(default)]
    pub documents: Vec<RawDocumentDescriptor>,
}

pub fn load_portal_fixture(path: impl AsRef<Path>) -> Result<PortalFixture> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct FixturePortalGateway {
    root: PathBuf,
}

impl FixturePortalGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn fixture_path(&self, tax_id: &TaxId) -> PathBuf {
        self.root.join(format!("{tax_id}.json"))
    }
}

#[async_trait]
impl PortalGateway for FixturePortalGateway {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(
        &self,
        tax_id: &TaxId,
        checkpoint: Option<&Checkpoint>,
        _timeout: Duration,
    ) -> Result<PortalBatch, GatewayError> {
        let path = self.fixture_path(tax_id);
        if !path.exists() {
            return Err(GatewayError::Permanent(format!(
                "no portal fixture for {tax_id} at {}",
                path.display()
            )));
        }
        let fixture = load_portal_fixture(&path)
            .map_err(|err| GatewayError::Permanent(format!("{err:#}")))?;
        if fixture.tax_id != *tax_id {
            return Err(GatewayError::Permanent(format!(
                "fixture {} belongs to {}",
                path.display(),
                fixture.tax_id
            )));
        }

        match fixture.fail_with {
            Some(FixtureFailure::Transient) => {
                return Err(GatewayError::Transient("fixture: portal unavailable".into()))
            }
            Some(FixtureFailure::RateLimited) => {
                return Err(GatewayError::RateLimited("fixture: too many requests".into()))
            }
            Some(FixtureFailure::Permanent) => {
                return Err(GatewayError::Permanent("fixture: access denied".into()))
            }
            None => {}
        }

        let since = checkpoint.and_then(|c| {
            let date = checkpoint_date(c);
            if date.is_none() {
                warn!(%tax_id, checkpoint = %c, "ignoring unparseable checkpoint");
            }
            date
        });
        // Same-day documents are returned again; the store absorbs the overlap.
        let candidates: Vec<RawDocumentDescriptor> = fixture
            .documents
            .into_iter()
            .filter(|d| since.map_or(true, |since| d.issue_date >= since))
            .collect();
        debug!(%tax_id, candidates = candidates.len(), "fixture fetch");

        let checkpoint = advance_checkpoint(checkpoint, &candidates);
        Ok(PortalBatch {
            candidates,
            checkpoint,
        })
    }
}
