use std::path::{Path, PathBuf};
use std::time::Duration;

use nfe_core::{Checkpoint, NaturalKey, TaxId};
use nfe_gateway::{load_portal_fixture, FixturePortalGateway, GatewayError, PortalGateway};

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/portal")
}

#[test]
fn every_checked_in_fixture_parses_and_matches_its_file_name() {
    let mut seen = 0;
    for entry in std::fs::read_dir(fixtures_dir()).expect("fixtures dir") {
        let path = entry.expect("dir entry").path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let fixture = load_portal_fixture(&path).expect("fixture parses");
        let stem = path.file_stem().and_then(|s| s.to_str()).expect("file stem");
        assert_eq!(fixture.tax_id.as_str(), stem);
        for doc in &fixture.documents {
            NaturalKey::from_descriptor(doc).expect("fixture document has an access key");
        }
        seen += 1;
    }
    assert!(seen >= 2);
}

#[tokio::test]
async fn acme_fixture_overlaps_on_the_checkpoint_day() {
    let gateway = FixturePortalGateway::new(fixtures_dir());
    let acme = TaxId::parse("12345678000190").unwrap();

    let first = gateway
        .fetch(&acme, None, Duration::from_secs(5))
        .await
        .expect("fixture fetch");
    assert_eq!(first.candidates.len(), 3);
    assert_eq!(first.checkpoint, Some(Checkpoint::new("2024-06-07")));

    let second = gateway
        .fetch(&acme, first.checkpoint.as_ref(), Duration::from_secs(5))
        .await
        .expect("fixture fetch");
    assert_eq!(second.candidates.len(), 2);
    assert!(second
        .candidates
        .iter()
        .all(|c| c.issue_date.to_string() == "2024-06-07"));
}

#[tokio::test]
async fn unavailable_company_fixture_is_transient() {
    let gateway = FixturePortalGateway::new(fixtures_dir());
    let company = TaxId::parse("11.222.333/0001-81").unwrap();
    let err = gateway
        .fetch(&company, None, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Transient(_)));
}
