//! Schema-tolerant persistence: progressively reshapes a rejected payload
//! until the store accepts it, then falls back to a minimal payload.

use std::collections::HashSet;

use futures::stream::{self, StreamExt};
use intel_core::{CanonicalRecord, RecordKind};
use intel_storage::{KeyColumnStore, Row, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::payload::{
    conflict_columns, legacy_alternative, minimal_payload, payload_for, validate, ValidationError,
};

/// Column-reduction attempts allowed before the minimal fallback.
pub const MAX_WRITE_ATTEMPTS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Insert,
    Upsert,
    Update,
}

impl WriteMode {
    pub fn for_record(kind: RecordKind, is_update: bool) -> Self {
        if is_update {
            WriteMode::Update
        } else if conflict_columns(kind).is_empty() {
            WriteMode::Insert
        } else {
            WriteMode::Upsert
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WriteMode::Insert => "insert",
            WriteMode::Upsert => "upsert",
            WriteMode::Update => "update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub mode: WriteMode,
    /// Store calls made, the successful one included.
    pub attempts: usize,
    pub dropped_columns: Vec<String>,
    /// `(rejected, replacement)` pairs.
    pub renamed_columns: Vec<(String, String)>,
    pub used_minimal_payload: bool,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("record failed validation: {0}")]
    Validation(#[from] ValidationError),
    #[error("store unavailable: {0}")]
    StoreUnavailable(StoreError),
    #[error("store rejected write: {0}")]
    StoreRejected(StoreError),
}

impl WriteError {
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            WriteError::Validation(_) => None,
            WriteError::StoreUnavailable(err) | WriteError::StoreRejected(err) => Some(err),
        }
    }
}

/// Persists `record` into `table` using the column shape of its kind.
pub async fn write<S>(
    store: &S,
    table: &str,
    record: &CanonicalRecord,
    is_update: bool,
) -> Result<WriteOutcome, WriteError>
where
    S: KeyColumnStore + ?Sized,
{
    write_row(store, table, record, payload_for(record), is_update).await
}

/// Like [`write`] with a caller-supplied starting payload, for callers that
/// carry columns beyond the canonical shape.
pub async fn write_row<S>(
    store: &S,
    table: &str,
    record: &CanonicalRecord,
    payload: Row,
    is_update: bool,
) -> Result<WriteOutcome, WriteError>
where
    S: KeyColumnStore + ?Sized,
{
    validate(record, is_update)?;
    let mode = WriteMode::for_record(record.record_kind, is_update);
    let span = info_span!(
        "schema_tolerant_write",
        table,
        kind = %record.record_kind,
        mode = mode.as_str()
    );
    reduce_and_write(store, table, record, payload, mode)
        .instrument(span)
        .await
}

async fn reduce_and_write<S>(
    store: &S,
    table: &str,
    record: &CanonicalRecord,
    mut payload: Row,
    mode: WriteMode,
) -> Result<WriteOutcome, WriteError>
where
    S: KeyColumnStore + ?Sized,
{
    let mut outcome = WriteOutcome {
        mode,
        attempts: 0,
        dropped_columns: Vec::new(),
        renamed_columns: Vec::new(),
        used_minimal_payload: false,
    };
    let mut rejected: HashSet<String> = HashSet::new();
    let mut first_error: Option<StoreError> = None;

    let original = loop {
        outcome.attempts += 1;
        let err = match submit(store, table, record, &payload, mode).await {
            Ok(()) => {
                if outcome.attempts > 1 {
                    info!(
                        attempts = outcome.attempts,
                        dropped = ?outcome.dropped_columns,
                        renamed = ?outcome.renamed_columns,
                        "write accepted after reshaping payload"
                    );
                }
                return Ok(outcome);
            }
            Err(err) if err.is_unavailable() => return Err(WriteError::StoreUnavailable(err)),
            Err(err) => err,
        };

        let reshaped = reshape(&mut payload, &mut rejected, &mut outcome, &err);
        let first = first_error.take().unwrap_or(err);
        if !reshaped || outcome.attempts >= MAX_WRITE_ATTEMPTS || payload.is_empty() {
            break first;
        }
        first_error = Some(first);
    };

    warn!(
        attempts = outcome.attempts,
        "column reduction exhausted; falling back to minimal payload"
    );
    outcome.attempts += 1;
    outcome.used_minimal_payload = true;
    match submit(store, table, record, &minimal_payload(record), mode).await {
        Ok(()) => Ok(outcome),
        Err(minimal_err) => {
            warn!(error = %minimal_err, "minimal payload rejected");
            Err(WriteError::StoreRejected(original))
        }
    }
}

/// Removes or renames the column `err` blames. Returns false when the error
/// names no column present in the payload.
fn reshape(
    payload: &mut Row,
    rejected: &mut HashSet<String>,
    outcome: &mut WriteOutcome,
    err: &StoreError,
) -> bool {
    let column = err
        .offending_column()
        .and_then(|name| payload_column(payload, &name));
    warn!(
        attempt = outcome.attempts,
        column = column.as_deref().unwrap_or(""),
        error = %err,
        "store rejected payload"
    );
    let Some(column) = column else {
        return false;
    };

    rejected.insert(column.clone());
    let value = payload.remove(&column).unwrap_or_default();
    match legacy_alternative(&column)
        .filter(|alt| !payload.contains_key(*alt) && !rejected.contains(*alt))
    {
        Some(alt) => {
            payload.insert(alt.to_string(), value);
            outcome.renamed_columns.push((column, alt.to_string()));
        }
        None => outcome.dropped_columns.push(column),
    }
    true
}

/// The payload key the store's column name refers to, matched case-insensitively.
fn payload_column(payload: &Row, name: &str) -> Option<String> {
    if payload.contains_key(name) {
        return Some(name.to_string());
    }
    payload
        .keys()
        .find(|key| key.eq_ignore_ascii_case(name))
        .cloned()
}

async fn submit<S>(
    store: &S,
    table: &str,
    record: &CanonicalRecord,
    payload: &Row,
    mode: WriteMode,
) -> Result<(), StoreError>
where
    S: KeyColumnStore + ?Sized,
{
    let rows = std::slice::from_ref(payload);
    match mode {
        WriteMode::Update => {
            let id = record.id.as_deref().unwrap_or_default();
            store.update(table, payload, id).await
        }
        WriteMode::Upsert => {
            store
                .upsert(table, rows, conflict_columns(record.record_kind))
                .await
        }
        WriteMode::Insert => store.upsert(table, rows, &[]).await,
    }
}

/// Writes independent records concurrently, at most `concurrency` at a time.
/// Results line up with `records`.
pub async fn write_batch<S>(
    store: &S,
    table: &str,
    records: &[CanonicalRecord],
    is_update: bool,
    concurrency: usize,
) -> Vec<Result<WriteOutcome, WriteError>>
where
    S: KeyColumnStore + ?Sized,
{
    let mut indexed: Vec<(usize, Result<WriteOutcome, WriteError>)> =
        stream::iter(records.iter().enumerate().map(|(index, record)| async move {
            (index, write(store, table, record, is_update).await)
        }))
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, result)| result).collect()
}
