//! Field-level precedence for records sharing a canonical key.

use std::collections::BTreeMap;

use intel_core::{CanonicalRecord, MAX_LIST_ITEMS};

/// Combines two records with the same canonical key into a new record.
///
/// Identity fields are first-writer-wins, with absent values counting as
/// unset. Assessments take the more severe value, free text prefers the
/// longer value and lists are unioned.
pub fn merge(existing: &CanonicalRecord, incoming: &CanonicalRecord) -> CanonicalRecord {
    let incoming_is_newer = match (existing.observed_at, incoming.observed_at) {
        (Some(current), Some(next)) => next > current,
        (None, Some(_)) => true,
        _ => false,
    };
    let (latitude, longitude) = existing
        .coordinates()
        .or_else(|| incoming.coordinates())
        .map_or((None, None), |(lat, lng)| (Some(lat), Some(lng)));

    let mut merged = CanonicalRecord {
        id: first_set(&existing.id, &incoming.id),
        canonical_key: if existing.canonical_key.is_empty() {
            incoming.canonical_key.clone()
        } else {
            existing.canonical_key.clone()
        },
        record_kind: existing.record_kind,
        category: existing.category.or(incoming.category),
        region: first_set(&existing.region, &incoming.region),
        title: if existing.title.trim().is_empty() {
            incoming.title.clone()
        } else {
            existing.title.clone()
        },
        summary: longer_text(&existing.summary, &incoming.summary),
        narrative_body: longer_text(&existing.narrative_body, &incoming.narrative_body),
        key_points: union_capped(&existing.key_points, &incoming.key_points),
        indicators: union_capped(&existing.indicators, &incoming.indicators),
        sources: existing.sources.union(&incoming.sources),
        source_url: first_set(&existing.source_url, &incoming.source_url),
        status: if incoming_is_newer {
            incoming.status
        } else {
            existing.status
        },
        risk_level: existing.risk_level.max(incoming.risk_level),
        priority_level: existing.priority_level.max(incoming.priority_level),
        impact_level: existing.impact_level.max(incoming.impact_level),
        confidence_level: existing.confidence_level.max(incoming.confidence_level),
        observed_at: existing.observed_at.max(incoming.observed_at),
        updated_at: existing.updated_at.max(incoming.updated_at),
        latitude,
        longitude,
        iso2: first_set(&existing.iso2, &incoming.iso2),
        capital: first_set(&existing.capital, &incoming.capital),
        metrics: fill_blank_metrics(&existing.metrics, &incoming.metrics),
    };
    if merged.canonical_key.is_empty() {
        merged.canonical_key = merged.build_key();
    }
    merged
}

fn first_set(existing: &Option<String>, incoming: &Option<String>) -> Option<String> {
    existing
        .as_ref()
        .filter(|v| !v.trim().is_empty())
        .or(incoming.as_ref())
        .cloned()
}

/// Longer non-empty text; ties keep `existing`.
pub fn longer_text(existing: &str, incoming: &str) -> String {
    if incoming.trim().chars().count() > existing.trim().chars().count() {
        incoming.to_string()
    } else {
        existing.to_string()
    }
}

/// First-seen order, exact duplicates removed, capped at [`MAX_LIST_ITEMS`].
pub fn union_capped(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(MAX_LIST_ITEMS);
    for item in existing.iter().chain(incoming) {
        if out.len() == MAX_LIST_ITEMS {
            break;
        }
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

/// Keeps non-blank existing values; blank or missing keys come from `incoming`.
pub fn fill_blank_metrics(
    existing: &BTreeMap<String, String>,
    incoming: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut out = existing.clone();
    for (name, value) in incoming {
        if value.trim().is_empty() {
            out.entry(name.clone()).or_default();
            continue;
        }
        let slot = out.entry(name.clone()).or_default();
        if slot.trim().is_empty() {
            *slot = value.clone();
        }
    }
    out
}
