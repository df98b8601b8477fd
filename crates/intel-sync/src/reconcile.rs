//! Folds a batch of raw records into one merged record per canonical key.

use std::collections::HashMap;

use intel_adapters::{normalize_with_issues, RawRecord};
use intel_core::{CanonicalRecord, MalformedField, RecordKind};
use serde::Serialize;
use tracing::{debug, info};

use crate::merge::merge;

/// Insertion-ordered map from canonical key to merged record.
#[derive(Debug, Default)]
pub struct Reconciler {
    records: Vec<CanonicalRecord>,
    index: HashMap<String, usize>,
    merged: usize,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a normalized record, merging it into an earlier record with the same key.
    pub fn push(&mut self, record: CanonicalRecord) {
        let key = if record.canonical_key.is_empty() {
            record.build_key()
        } else {
            record.canonical_key.clone()
        };
        match self.index.get(&key) {
            Some(&slot) => {
                self.records[slot] = merge(&self.records[slot], &record);
                self.merged += 1;
            }
            None => {
                let mut record = record;
                record.canonical_key = key.clone();
                self.index.insert(key, self.records.len());
                self.records.push(record);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of pushes absorbed into an existing entry.
    pub fn merged(&self) -> usize {
        self.merged
    }

    pub fn finish(self) -> Vec<CanonicalRecord> {
        self.records
    }
}

/// Bad fields found while reconciling, tagged with the raw record's position.
#[derive(Debug, Clone, Serialize)]
pub struct BatchIssue {
    pub index: usize,
    #[serde(flatten)]
    pub field: MalformedField,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub raw: usize,
    pub merged: usize,
    pub records: Vec<CanonicalRecord>,
    pub issues: Vec<BatchIssue>,
}

/// Normalizes and deduplicates `raw_batch`; output keeps first-occurrence order.
pub fn reconcile(raw_batch: &[RawRecord], kind: RecordKind) -> Vec<CanonicalRecord> {
    reconcile_with_report(raw_batch, kind).records
}

pub fn reconcile_with_report(raw_batch: &[RawRecord], kind: RecordKind) -> ReconcileReport {
    let mut reconciler = Reconciler::new();
    let mut issues = Vec::new();

    for (index, raw) in raw_batch.iter().enumerate() {
        let (record, found) = normalize_with_issues(raw, kind);
        for field in found {
            debug!(index, %field, "substituted default for malformed field");
            issues.push(BatchIssue { index, field });
        }
        reconciler.push(record);
    }

    let merged = reconciler.merged();
    let records = reconciler.finish();
    info!(
        kind = %kind,
        raw = raw_batch.len(),
        unique = records.len(),
        merged,
        "reconciled batch"
    );
    ReconcileReport {
        raw: raw_batch.len(),
        merged,
        records,
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intel_adapters::Producer;
    use intel_core::RiskLevel;
    use proptest::prelude::*;
    use serde_json::{json, Value as JsonValue};
    use std::collections::HashSet;

    fn feed(value: JsonValue) -> RawRecord {
        RawRecord::from_value(Producer::FeedEntry, value).expect("object")
    }

    #[test]
    fn same_story_same_day_collapses() {
        let batch = vec![
            feed(json!({
                "title": "Border Clash Reported",
                "sources": ["https://www.reuters.com/world/a"],
                "timestamp": "2026-02-27T08:00:00Z",
                "risk_level": "medium",
            })),
            feed(json!({
                "title": "border clash reported ",
                "sources": "https://reuters.com/world/b, AP",
                "timestamp": "2026-02-27T21:30:00Z",
                "risk": "high",
            })),
        ];
        let report = reconcile_with_report(&batch, RecordKind::Event);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.merged, 1);
        let record = &report.records[0];
        assert_eq!(record.risk_level, RiskLevel::High);
        assert_eq!(record.title, "Border Clash Reported");
        assert_eq!(
            record.sources.as_slice(),
            &[
                "https://www.reuters.com/world/a".to_string(),
                "https://reuters.com/world/b".to_string(),
                "AP".to_string(),
            ]
        );
    }

    #[test]
    fn scheme_less_sources_share_the_outlet_domain() {
        let form = |source: &str| {
            RawRecord::from_value(
                Producer::AdminForm,
                json!({
                    "title": "Border Clash Reported",
                    "sources": source,
                    "timestamp": "2026-02-27T09:00",
                }),
            )
            .expect("object")
        };
        let batch = vec![
            form("https://www.reuters.com/world/a"),
            form("www.reuters.com/world/b"),
            form("reuters.com/world/c"),
        ];
        let out = reconcile(&batch, RecordKind::Event);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].canonical_key,
            "sig:border clash reported|reuters.com|2026-02-27"
        );
        assert_eq!(out[0].sources.len(), 3);
    }

    #[test]
    fn category_from_a_later_duplicate_is_kept() {
        let batch = vec![
            feed(json!({"title": "Port closure", "source": "Reuters"})),
            feed(json!({"title": "Port closure", "source": "Reuters", "category": "military"})),
        ];
        let out = reconcile(&batch, RecordKind::Event);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].category(), intel_core::Category::Military);
    }

    #[test]
    fn explicit_urls_collapse_across_days() {
        let batch = vec![
            feed(json!({"title": "A", "url": "https://example.com/x", "date": "2026-01-01"})),
            feed(json!({"title": "B", "url": "HTTPS://EXAMPLE.COM/x ", "date": "2026-01-09"})),
            feed(json!({"title": "A", "date": "2026-01-01"})),
        ];
        let out = reconcile(&batch, RecordKind::Event);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].canonical_key, "url:https://example.com/x");
        assert_eq!(out[0].title, "A");
    }

    #[test]
    fn keeps_first_occurrence_order() {
        let batch: Vec<RawRecord> = ["c", "a", "b", "a", "c"]
            .iter()
            .map(|t| feed(json!({"title": t})))
            .collect();
        let titles: Vec<_> = reconcile(&batch, RecordKind::Event)
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert_eq!(titles, vec!["c", "a", "b"]);
    }

    #[test]
    fn bad_records_degrade_instead_of_failing() {
        let batch = vec![
            feed(json!({"title": "ok", "timestamp": "garbage", "lat": "north"})),
            feed(json!({"title": "fine"})),
        ];
        let report = reconcile_with_report(&batch, RecordKind::Event);
        assert_eq!(report.records.len(), 2);
        assert!(report.issues.iter().all(|issue| issue.index == 0));
        assert_eq!(report.records[0].observed_at, None);
    }

    #[test]
    fn empty_batch_is_empty() {
        assert!(reconcile(&[], RecordKind::ScheduledBrief).is_empty());
    }

    proptest! {
        #[test]
        fn property_one_record_per_key(titles in prop::collection::vec("[a-c]{1,2}", 0..30)) {
            let batch: Vec<RawRecord> = titles
                .iter()
                .map(|t| feed(json!({"title": t, "source": "Reuters"})))
                .collect();
            let out = reconcile(&batch, RecordKind::Event);
            let keys: HashSet<_> = out.iter().map(|r| r.canonical_key.clone()).collect();
            prop_assert_eq!(keys.len(), out.len());
            let distinct: HashSet<_> = titles.iter().collect();
            prop_assert_eq!(out.len(), distinct.len());
        }
    }
}
