use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use nfe_core::{DocumentState, FiscalDocument, NaturalKey, TaxId};
use nfe_gateway::format_brl;
use nfe_storage::DocumentQuery;
use nfe_sync::{shutdown_on_ctrl_c, CompanyRegistry, Monitor, MonitorConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nfe-monitor")]
#[command(about = "Monitors the NFe portal for documents issued against registered companies")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync the company registry, then poll and notify until Ctrl-C.
    Run,
    /// Run a single poll tick, or a single cycle for one company.
    PollOnce {
        #[arg(long)]
        tax_id: Option<TaxId>,
    },
    /// Deliver every pending notification that is due.
    Drain,
    /// Create or upgrade the database schema.
    Migrate,
    /// Upsert companies from the registry file.
    SyncCompanies {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// List monitored companies with their poll state.
    Companies,
    /// List ingested documents.
    Documents {
        #[arg(long)]
        tax_id: Option<TaxId>,
        #[arg(long)]
        state: Option<DocumentState>,
        /// Earliest issue date (YYYY-MM-DD).
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Latest issue date (YYYY-MM-DD).
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// List documents whose notification was abandoned.
    DeadLetters {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Show the delivery attempts for one document (`issuer:access_key`).
    Attempts { document_key: String },
    /// Show recent poll runs for a company.
    Runs {
        tax_id: TaxId,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Re-enable a company disabled by a permanent portal failure.
    Enable { tax_id: TaxId },
    /// Send the daily digest now.
    Digest,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = MonitorConfig::from_env();
    let monitor = Monitor::from_config(config).await?;
    let store = monitor.store();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            sync_registry(&monitor, None, true).await?;
            monitor.run(shutdown_on_ctrl_c()).await?;
        }
        Commands::PollOnce { tax_id } => match tax_id {
            Some(tax_id) => {
                let outcome = monitor.scheduler().poll_company(&tax_id).await?;
                println!("{tax_id}: {outcome:?}");
            }
            None => {
                let summary = monitor.scheduler().tick().await?;
                println!(
                    "poll tick: due={} polled={} new={} backing_off={} disabled={} errors={}",
                    summary.due,
                    summary.polled,
                    summary.new_documents,
                    summary.backing_off,
                    summary.disabled,
                    summary.errors
                );
            }
        },
        Commands::Drain => {
            let summary = monitor.dispatcher().drain().await?;
            println!(
                "drain complete: sent={} retried={} dead_lettered={} skipped={}",
                summary.sent, summary.retried, summary.dead_lettered, summary.skipped
            );
        }
        Commands::Migrate => {
            store.migrate().await?;
            println!("migrations applied to {}", monitor.config().database_url);
        }
        Commands::SyncCompanies { file } => {
            sync_registry(&monitor, file, false).await?;
        }
        Commands::Companies => {
            let now = Utc::now();
            for company in store.list_companies().await? {
                println!(
                    "{}  {:<30} {:<2} {:<10} failures={} next={} checkpoint={}{}",
                    company.tax_id.formatted(),
                    company.label(),
                    company.state_code,
                    format!("{:?}", company.phase(now)),
                    company.consecutive_failure_count,
                    company.next_eligible_poll_at.format("%Y-%m-%d %H:%M:%S"),
                    company
                        .last_checkpoint
                        .as_ref()
                        .map(|c| c.as_str())
                        .unwrap_or("-"),
                    company
                        .disabled_reason
                        .as_deref()
                        .map(|r| format!(" ({r})"))
                        .unwrap_or_default(),
                );
            }
        }
        Commands::Documents {
            tax_id,
            state,
            from,
            to,
            limit,
        } => {
            let documents = store
                .query_documents(&DocumentQuery {
                    monitored_tax_id: tax_id,
                    state,
                    issued_from: from,
                    issued_to: to,
                    limit: Some(limit),
                    ..DocumentQuery::default()
                })
                .await?;
            print_documents(&documents);
        }
        Commands::DeadLetters { limit } => {
            let documents = store
                .query_documents(&DocumentQuery {
                    state: Some(DocumentState::DeadLetter),
                    limit: Some(limit),
                    ..DocumentQuery::default()
                })
                .await?;
            print_documents(&documents);
        }
        Commands::Attempts { document_key } => {
            let key = NaturalKey::parse_document_key(&document_key)?;
            for attempt in store.list_attempts(&key).await? {
                println!(
                    "#{} {} {} {}",
                    attempt.attempt_number,
                    attempt.attempted_at.to_rfc3339(),
                    attempt.outcome.as_str(),
                    attempt.detail.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Runs { tax_id, limit } => {
            for run in store.list_poll_runs(&tax_id, limit).await? {
                println!(
                    "{} {} found={} new={} {}",
                    run.started_at.to_rfc3339(),
                    run.status.as_str(),
                    run.documents_found,
                    run.new_documents,
                    run.error_message.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Enable { tax_id } => {
            store.enable_company(&tax_id, Utc::now()).await?;
            println!("{} enabled; it will be polled on the next tick", tax_id.formatted());
        }
        Commands::Digest => {
            let summary = monitor.dispatcher().send_daily_digest().await?;
            println!(
                "digest: companies={} sent={} empty={} failed={}",
                summary.companies, summary.sent, summary.empty, summary.failed
            );
        }
    }

    monitor.store().close().await;
    Ok(())
}

async fn sync_registry(monitor: &Monitor, file: Option<PathBuf>, optional: bool) -> Result<()> {
    let path = file.unwrap_or_else(|| monitor.config().companies_file.clone());
    if optional && !path.exists() {
        warn!(
            path = %path.display(),
            "company registry not found; polling companies already in the store"
        );
        return Ok(());
    }
    let registry = CompanyRegistry::load(&path).await?;
    let summary = registry
        .sync(
            monitor.store(),
            monitor.config().default_poll_interval_secs,
            Utc::now(),
        )
        .await
        .with_context(|| format!("syncing {}", path.display()))?;
    info!(path = %path.display(), "registry applied");
    println!(
        "companies synced: active={} disabled={}",
        summary.active, summary.disabled
    );
    Ok(())
}

fn print_documents(documents: &[FiscalDocument]) {
    for doc in documents {
        println!(
            "{}  {}  {:<22} {:>14}  {}  attempts={}{}",
            doc.issue_date.format("%d/%m/%Y"),
            doc.key,
            doc.state.as_str(),
            format_brl(doc.total_value),
            doc.issuer_name,
            doc.attempt_count,
            doc.dead_letter_reason
                .as_deref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default(),
        );
    }
    println!("{} document(s)", documents.len());
}
