use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use intel_adapters::Producer;
use intel_core::RecordKind;
use intel_sync::SyncConfig;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "intel-cli")]
#[command(about = "Grey Space intel reconciliation tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile a JSON file of producer records, optionally writing the result.
    Reconcile {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "event", value_parser = parse_kind)]
        kind: RecordKind,
        #[arg(long, default_value = "feed-entry", value_parser = parse_producer)]
        producer: Producer,
        /// Persist through the schema-tolerant writer.
        #[arg(long)]
        write: bool,
        /// Overrides the table configured for the record kind.
        #[arg(long)]
        table: Option<String>,
        /// Print the reconciled records instead of the run summary.
        #[arg(long)]
        records: bool,
    },
    /// Seed countries and country profiles from the knowledge base.
    ImportCountries,
}

fn parse_kind(raw: &str) -> Result<RecordKind, String> {
    RecordKind::parse(raw).ok_or_else(|| {
        let known: Vec<_> = RecordKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("unknown record kind {raw:?}; expected one of {}", known.join(", "))
    })
}

fn parse_producer(raw: &str) -> Result<Producer, String> {
    match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
        "admin-form" => Ok(Producer::AdminForm),
        "feed-entry" => Ok(Producer::FeedEntry),
        "briefing" => Ok(Producer::Briefing),
        "knowledge-base" => Ok(Producer::KnowledgeBase),
        "store-row" => Ok(Producer::StoreRow),
        other => Err(format!("unknown producer {other:?}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("intel=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Reconcile {
            input,
            kind,
            producer,
            write,
            table,
            records,
        } => {
            let table = write.then(|| table.unwrap_or_else(|| config.table_for(kind).to_string()));
            let (summary, report) =
                intel_sync::run_reconcile_file(&config, &input, producer, kind, table.as_deref())
                    .await?;
            if records {
                println!("{}", serde_json::to_string_pretty(&report.records)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            if !summary.failures.is_empty() {
                warn!(failed = summary.failures.len(), "some records were not written");
                std::process::exit(2);
            }
        }
        Commands::ImportCountries => {
            let summary = intel_sync::run_import_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
