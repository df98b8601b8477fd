//! Column shapes per record kind, the minimal fallback shape and pre-write validation.

use std::collections::BTreeSet;

use intel_adapters::valid_coordinates;
use intel_core::{CanonicalRecord, RecordKind, MAX_LIST_ITEMS};
use intel_storage::Row;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

/// Legacy column names some store variants still use.
const LEGACY_ALTERNATIVES: &[(&str, &str)] = &[
    ("risk_level", "risk"),
    ("priority_level", "priority"),
    ("key_points", "points"),
    ("narrative", "details"),
    ("details", "narrative"),
    ("published_at", "timestamp"),
];

pub fn legacy_alternative(column: &str) -> Option<&'static str> {
    LEGACY_ALTERNATIVES
        .iter()
        .find(|(current, _)| *current == column)
        .map(|(_, legacy)| *legacy)
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("title is required")]
    MissingTitle,
    #[error("a two-letter iso2 code is required for {0} records")]
    MissingIso2(RecordKind),
    #[error("latitude and longitude must be set together")]
    HalfCoordinates,
    #[error("coordinates out of range: lat {lat}, lng {lng}")]
    CoordinatesOutOfRange { lat: f64, lng: f64 },
    #[error("{field} holds {count} entries; at most {max} are allowed", max = MAX_LIST_ITEMS)]
    TooManyItems { field: &'static str, count: usize },
    #[error("updates require a record id")]
    MissingId,
}

/// Rejects records that must never reach the store.
pub fn validate(record: &CanonicalRecord, is_update: bool) -> Result<(), ValidationError> {
    if record.record_kind.is_country() {
        let valid = record
            .iso2
            .as_deref()
            .is_some_and(|code| code.len() == 2 && code.chars().all(|c| c.is_ascii_uppercase()));
        if !valid {
            return Err(ValidationError::MissingIso2(record.record_kind));
        }
    }
    if record.record_kind != RecordKind::CountryProfile && record.title.trim().is_empty() {
        return Err(ValidationError::MissingTitle);
    }
    match (record.latitude, record.longitude) {
        (Some(lat), Some(lng)) if !valid_coordinates(lat, lng) => {
            return Err(ValidationError::CoordinatesOutOfRange { lat, lng });
        }
        (Some(_), None) | (None, Some(_)) => return Err(ValidationError::HalfCoordinates),
        _ => {}
    }
    for (field, count) in [
        ("key_points", record.key_points.len()),
        ("indicators", record.indicators.len()),
    ] {
        if count > MAX_LIST_ITEMS {
            return Err(ValidationError::TooManyItems { field, count });
        }
    }
    if is_update && record.id.as_deref().map_or(true, |id| id.trim().is_empty()) {
        return Err(ValidationError::MissingId);
    }
    Ok(())
}

/// Upsert conflict target; empty means a plain insert.
pub fn conflict_columns(kind: RecordKind) -> &'static [&'static str] {
    match kind {
        RecordKind::Country => &["iso2"],
        RecordKind::CountryProfile => &["iso2", "category"],
        _ => &[],
    }
}

fn put_text(row: &mut Row, column: &str, value: &str) {
    if !value.trim().is_empty() {
        row.insert(column.to_string(), JsonValue::String(value.to_string()));
    }
}

fn put_opt(row: &mut Row, column: &str, value: Option<&str>) {
    if let Some(value) = value {
        put_text(row, column, value);
    }
}

fn put_list(row: &mut Row, column: &str, items: &[String]) {
    if !items.is_empty() {
        row.insert(column.to_string(), json!(items));
    }
}

fn put_assessments(row: &mut Row, record: &CanonicalRecord) {
    row.insert("category".into(), json!(record.category().as_str()));
    row.insert("status".into(), json!(record.status.as_str()));
    row.insert("risk_level".into(), json!(record.risk_level.as_str()));
    row.insert("priority_level".into(), json!(record.priority_level.as_str()));
    row.insert("impact_level".into(), json!(record.impact_level.as_str()));
    row.insert("confidence".into(), json!(record.confidence_level.as_str()));
}

fn put_time(row: &mut Row, column: &str, at: Option<chrono::DateTime<chrono::Utc>>) {
    if let Some(at) = at {
        row.insert(column.to_string(), json!(at.to_rfc3339()));
    }
}

/// Full payload in the column names of the record kind's table family.
/// Absent values are omitted so updates never blank stored columns.
pub fn payload_for(record: &CanonicalRecord) -> Row {
    let mut row = Row::new();
    match record.record_kind {
        RecordKind::Event => {
            put_text(&mut row, "title", &record.title);
            put_text(&mut row, "summary", &record.summary);
            put_text(&mut row, "details", &record.narrative_body);
            put_opt(&mut row, "region", record.region.as_deref());
            put_assessments(&mut row, record);
            put_list(&mut row, "key_points", &record.key_points);
            put_list(&mut row, "indicators", &record.indicators);
            if !record.sources.is_empty() {
                row.insert("sources".into(), json!(record.sources.as_slice().join(", ")));
            }
            put_opt(&mut row, "source_url", record.source_url.as_deref());
            put_time(&mut row, "timestamp", record.observed_at);
            put_time(&mut row, "updated_at", record.updated_at);
            if let Some((lat, lng)) = record.coordinates() {
                row.insert("lat".into(), json!(lat));
                row.insert("lng".into(), json!(lng));
            }
        }
        RecordKind::ScheduledBrief | RecordKind::RegionalBrief | RecordKind::SpecialBrief => {
            put_text(&mut row, "title", &record.title);
            put_text(&mut row, "summary", &record.summary);
            put_text(&mut row, "narrative", &record.narrative_body);
            put_opt(&mut row, "region", record.region.as_deref());
            row.insert("brief_type".into(), json!(record.record_kind.as_str()));
            put_assessments(&mut row, record);
            put_list(&mut row, "key_points", &record.key_points);
            put_list(&mut row, "indicators", &record.indicators);
            put_list(&mut row, "sources", record.sources.as_slice());
            put_opt(&mut row, "source_url", record.source_url.as_deref());
            put_time(&mut row, "published_at", record.observed_at);
            put_time(&mut row, "updated_at", record.updated_at);
            if let Some((lat, lng)) = record.coordinates() {
                row.insert("coords".into(), json!([lng, lat]));
            }
        }
        RecordKind::Country => {
            put_opt(&mut row, "iso2", record.iso2.as_deref());
            put_text(&mut row, "name", &record.title);
            put_opt(&mut row, "capital", record.capital.as_deref());
            put_opt(&mut row, "region", record.region.as_deref());
            if let Some((lat, lng)) = record.coordinates() {
                row.insert("centroid_lat".into(), json!(lat));
                row.insert("centroid_lng".into(), json!(lng));
            }
        }
        RecordKind::CountryProfile => {
            put_opt(&mut row, "iso2", record.iso2.as_deref());
            row.insert("category".into(), json!(record.category().as_str()));
            row.insert("metrics".into(), json!(record.metrics));
            put_text(&mut row, "narrative", &record.narrative_body);
            row.insert("sources".into(), json!(record.sources.as_slice()));
        }
    }
    row
}

/// Gives every row the union of all rows' columns, filling gaps with `null`.
/// Bulk inserts into the row store require identical keys on every object.
pub fn align_columns(rows: &mut [Row]) {
    let columns: BTreeSet<String> = rows.iter().flat_map(|row| row.keys().cloned()).collect();
    for row in rows.iter_mut() {
        for column in &columns {
            if !row.contains_key(column) {
                row.insert(column.clone(), JsonValue::Null);
            }
        }
    }
}

/// The reduced payload used once column-by-column reduction gives up:
/// only columns every known variant of the table family carries.
pub fn minimal_payload(record: &CanonicalRecord) -> Row {
    let full = payload_for(record);
    let columns: &[&str] = match record.record_kind {
        RecordKind::Country => &["iso2", "name", "region"],
        RecordKind::CountryProfile => &["iso2", "category", "sources"],
        _ => &["title", "summary", "timestamp", "published_at", "category", "region", "sources"],
    };
    full.into_iter()
        .filter(|(column, _)| columns.contains(&column.as_str()))
        .collect()
}
