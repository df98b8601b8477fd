//! Reconciliation engine: merge precedence, batch reconciliation,
//! schema-tolerant writes and the country bootstrap.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use intel_adapters::{load_raw_records, Producer, SparqlKnowledgeSource};
use intel_core::RecordKind;
use intel_storage::{HttpClientConfig, RestRowStore};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub mod bootstrap;
pub mod merge;
pub mod payload;
pub mod reconcile;
pub mod writer;

pub use bootstrap::{import_countries, ImportError, ImportPhase, ImportSummary};
pub use merge::merge;
pub use payload::{align_columns, minimal_payload, payload_for, validate, ValidationError};
pub use reconcile::{reconcile, reconcile_with_report, ReconcileReport, Reconciler};
pub use writer::{
    write, write_batch, write_row, WriteError, WriteMode, WriteOutcome, MAX_WRITE_ATTEMPTS,
};

pub const CRATE_NAME: &str = "intel-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_url: Option<String>,
    pub store_key: Option<String>,
    pub events_table: String,
    pub briefings_table: String,
    pub knowledge_endpoint: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub write_concurrency: usize,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            store_url: var("INTEL_STORE_URL").or_else(|| var("SUPABASE_URL")),
            store_key: var("INTEL_STORE_KEY").or_else(|| var("SUPABASE_SERVICE_ROLE_KEY")),
            events_table: var("INTEL_EVENTS_TABLE").unwrap_or_else(|| "live_intel".to_string()),
            briefings_table: var("INTEL_BRIEFINGS_TABLE")
                .unwrap_or_else(|| "briefings".to_string()),
            knowledge_endpoint: var("INTEL_KNOWLEDGE_ENDPOINT")
                .unwrap_or_else(|| intel_adapters::DEFAULT_SPARQL_ENDPOINT.to_string()),
            user_agent: var("INTEL_USER_AGENT")
                .unwrap_or_else(|| "greyspace-intel/0.1".to_string()),
            http_timeout_secs: var("INTEL_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            write_concurrency: var("INTEL_WRITE_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(4),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    /// Table a record kind is persisted to.
    pub fn table_for(&self, kind: RecordKind) -> &str {
        match kind {
            RecordKind::Event => &self.events_table,
            RecordKind::ScheduledBrief | RecordKind::RegionalBrief | RecordKind::SpecialBrief => {
                &self.briefings_table
            }
            RecordKind::Country => bootstrap::COUNTRIES_TABLE,
            RecordKind::CountryProfile => bootstrap::PROFILES_TABLE,
        }
    }

    pub fn rest_store(&self) -> Result<RestRowStore> {
        let url = self
            .store_url
            .as_deref()
            .context("INTEL_STORE_URL (or SUPABASE_URL) is not set")?;
        let key = self
            .store_key
            .as_deref()
            .context("INTEL_STORE_KEY (or SUPABASE_SERVICE_ROLE_KEY) is not set")?;
        RestRowStore::new(url, key, &self.http_client_config())
    }

    pub fn knowledge_source(&self) -> Result<SparqlKnowledgeSource> {
        SparqlKnowledgeSource::new(self.knowledge_endpoint.clone(), &self.http_client_config())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteFailure {
    pub index: usize,
    pub title: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub kind: RecordKind,
    pub table: Option<String>,
    pub raw_records: usize,
    pub unique_records: usize,
    pub malformed_fields: usize,
    pub written: usize,
    pub reshaped_writes: usize,
    pub minimal_writes: usize,
    pub failures: Vec<WriteFailure>,
}

/// Loads a producer file, reconciles it and, when `write_to` is set,
/// persists the result through the schema-tolerant writer.
pub async fn run_reconcile_file(
    config: &SyncConfig,
    input: &Path,
    producer: Producer,
    kind: RecordKind,
    write_to: Option<&str>,
) -> Result<(ReconcileRunSummary, ReconcileReport)> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let raw = load_raw_records(input, producer)?;

    async {
        let report = reconcile_with_report(&raw, kind);
        let mut summary = ReconcileRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            kind,
            table: write_to.map(str::to_string),
            raw_records: report.raw,
            unique_records: report.records.len(),
            malformed_fields: report.issues.len(),
            written: 0,
            reshaped_writes: 0,
            minimal_writes: 0,
            failures: Vec::new(),
        };

        if let Some(table) = write_to {
            let store = config.rest_store()?;
            let results =
                write_batch(&store, table, &report.records, false, config.write_concurrency).await;
            for (index, (record, result)) in report.records.iter().zip(results).enumerate() {
                match result {
                    Ok(outcome) => {
                        summary.written += 1;
                        if outcome.attempts > 1 {
                            summary.reshaped_writes += 1;
                        }
                        if outcome.used_minimal_payload {
                            summary.minimal_writes += 1;
                        }
                    }
                    Err(err) => summary.failures.push(WriteFailure {
                        index,
                        title: record.title.clone(),
                        error: err.to_string(),
                    }),
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            unique = summary.unique_records,
            written = summary.written,
            failed = summary.failures.len(),
            "reconcile run complete"
        );
        Ok::<_, anyhow::Error>((summary, report))
    }
    .instrument(info_span!("reconcile_run", %run_id, kind = %kind))
    .await
}

pub async fn run_import_from_env() -> Result<ImportSummary> {
    let config = SyncConfig::from_env();
    let store = config.rest_store()?;
    let knowledge = config.knowledge_source()?;
    let summary = import_countries(&store, &knowledge)
        .await
        .context("country import failed")?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> SyncConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let cfg = config(&[]);
        assert_eq!(cfg.events_table, "live_intel");
        assert_eq!(cfg.briefings_table, "briefings");
        assert_eq!(cfg.http_timeout_secs, 20);
        assert_eq!(cfg.write_concurrency, 4);
        assert!(cfg.store_url.is_none());
        assert!(cfg.rest_store().is_err());
    }

    #[test]
    fn store_settings_fall_back_to_legacy_names() {
        let cfg = config(&[
            ("SUPABASE_URL", "https://example.supabase.co"),
            ("INTEL_STORE_URL", " "),
            ("SUPABASE_SERVICE_ROLE_KEY", "secret"),
            ("INTEL_WRITE_CONCURRENCY", "0"),
            ("INTEL_HTTP_TIMEOUT_SECS", "5"),
        ]);
        assert_eq!(cfg.store_url.as_deref(), Some("https://example.supabase.co"));
        assert_eq!(cfg.store_key.as_deref(), Some("secret"));
        assert_eq!(cfg.write_concurrency, 4);
        assert_eq!(cfg.http_client_config().timeout, Duration::from_secs(5));
    }

    #[test]
    fn tables_follow_record_kind() {
        let cfg = config(&[("INTEL_BRIEFINGS_TABLE", "brief_archive")]);
        assert_eq!(cfg.table_for(RecordKind::Event), "live_intel");
        assert_eq!(cfg.table_for(RecordKind::SpecialBrief), "brief_archive");
        assert_eq!(cfg.table_for(RecordKind::CountryProfile), "country_profiles");
    }
}
