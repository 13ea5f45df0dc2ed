use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wrr_audit::{AuditConfig, IssueType, PriceAuditor, PriceRepairer, RepairConfig};
use wrr_ingest::{load_payloads, ListingMapper};
use wrr_storage::{InMemoryStore, SnapshotFile, StoreHandles};
use wrr_sync::{BatchSummary, ProcessingOptions, SyncConfig, UnifiedProcessor};

const DEFAULT_STORE_PATH: &str = "./data/store.json";
const LOG_TARGETS: [&str; 5] = ["wrr_cli", "wrr_storage", "wrr_ingest", "wrr_sync", "wrr_audit"];

#[derive(Debug, Parser)]
#[command(name = "wrr-cli")]
#[command(about = "Work record reconciler command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest listing payloads (one object or an array) from a JSON file.
    Ingest {
        payloads: PathBuf,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        skip_price_history: bool,
    },
    /// Scan every stored work for price anomalies.
    Audit {
        /// Also write the detailed JSON report here.
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Repair one work. Dry run unless --live.
    Fix {
        #[arg(long)]
        work: String,
        #[arg(long = "type")]
        issue_type: IssueType,
        #[arg(long)]
        live: bool,
    },
    /// Repair several works sequentially. Dry run unless --live.
    BatchFix {
        #[arg(long = "type")]
        issue_type: String,
        #[arg(long)]
        live: bool,
        /// Take work ids from a fresh audit instead of the command line.
        #[arg(long, conflicts_with = "work_ids")]
        from_audit: bool,
        work_ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(log_filter()?).init();

    let cli = Cli::parse();
    let snapshot_file = SnapshotFile::new(
        std::env::var("WRR_STORE_PATH").unwrap_or_else(|_| DEFAULT_STORE_PATH.to_string()),
    );
    let store = Arc::new(InMemoryStore::from_snapshot(snapshot_file.load().await?));
    let handles = StoreHandles::from_shared(store.clone());
    info!(store = %snapshot_file.path().display(), "store loaded");

    match cli.command {
        Commands::Ingest {
            payloads,
            force,
            skip_price_history,
        } => {
            let payloads = load_payloads(&payloads)?;
            let processor = UnifiedProcessor::new(Arc::new(ListingMapper), handles, SyncConfig::from_env());
            let options = ProcessingOptions {
                force_update: force,
                skip_price_history,
            };
            let results = processor.process_batch(&payloads, options).await;
            for result in results.iter().filter(|r| !r.errors.is_empty()) {
                println!("{}", serde_json::to_string(result)?);
            }
            println!("ingest complete: {}", BatchSummary::from_results(&results));
            persist(&snapshot_file, &store).await?;
        }
        Commands::Audit { json } => {
            let run = PriceAuditor::new(handles, AuditConfig::from_env())
                .check_all_works()
                .await?;
            println!("{}", run.generate_report());

            let needing_fix = run.works_needing_fix();
            if !needing_fix.is_empty() {
                println!("\nworks needing repair: {}", needing_fix.len());
                println!("{}", needing_fix.join(", "));
            }

            if let Some(path) = json {
                let report = run.export_detailed_report(Utc::now());
                let body = serde_json::to_vec_pretty(&report).context("serializing audit report")?;
                tokio::fs::write(&path, body)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("detailed report written to {}", path.display());
            }
        }
        Commands::Fix {
            work,
            issue_type,
            live,
        } => {
            let repairer = PriceRepairer::new(handles, repair_config(live));
            let Some(result) = repairer.fix(&work, issue_type).await else {
                bail!("no repair routine for issue type `{issue_type}`");
            };
            let mut summary = repairer.summary();
            summary.push(result);
            println!("{summary}");
            if live {
                persist(&snapshot_file, &store).await?;
            }
        }
        Commands::BatchFix {
            issue_type,
            live,
            from_audit,
            work_ids,
        } => {
            let work_ids = if from_audit {
                let run = PriceAuditor::new(handles.clone(), AuditConfig::from_env())
                    .check_all_works()
                    .await?;
                match issue_type.parse::<IssueType>() {
                    Ok(kind) => {
                        let mut ids: Vec<String> = Vec::new();
                        for issue in run.issues.iter().filter(|i| i.issue_type == kind) {
                            if !ids.contains(&issue.work_id) {
                                ids.push(issue.work_id.clone());
                            }
                        }
                        ids
                    }
                    Err(_) => run.works_needing_fix(),
                }
            } else {
                work_ids
            };
            if work_ids.is_empty() {
                bail!("no work ids to repair; pass ids or --from-audit");
            }

            let repairer = PriceRepairer::new(handles, repair_config(live));
            let summary = repairer.batch_fix(&work_ids, &issue_type).await;
            println!("{summary}");
            if live {
                persist(&snapshot_file, &store).await?;
            }
        }
    }

    Ok(())
}

/// `RUST_LOG` plus an info directive for each workspace crate.
fn log_filter() -> Result<EnvFilter> {
    let mut filter = EnvFilter::from_default_env();
    for target in LOG_TARGETS {
        filter = filter.add_directive(format!("{target}=info").parse()?);
    }
    Ok(filter)
}

fn repair_config(live: bool) -> RepairConfig {
    RepairConfig {
        dry_run: !live,
        ..RepairConfig::from_env()
    }
}

async fn persist(file: &SnapshotFile, store: &InMemoryStore) -> Result<()> {
    let saved = file.save(&store.snapshot().await).await?;
    if saved.unchanged {
        info!(store = %saved.path.display(), "store unchanged");
    } else {
        info!(
            store = %saved.path.display(),
            bytes = saved.byte_size,
            sha256 = %saved.content_hash,
            "store saved"
        );
    }
    Ok(())
}
