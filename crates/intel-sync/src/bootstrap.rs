//! Country bootstrap: seeds `countries` and `country_profiles` from the
//! knowledge base and fills blank profile metrics.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use intel_adapters::{
    normalize, parse_enrichment, starter_metrics, EnrichmentFacts, ExternalKnowledgeSource,
    KnowledgeError, Producer, RawRecord, COUNTRY_QUERY, ENRICHMENT_QUERY, WIKIDATA_SOURCE,
};
use intel_core::{CanonicalRecord, Category, RecordKind, SourceSet};
use intel_storage::{KeyColumnStore, Row, StoreError};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::merge::merge;
use crate::payload::{align_columns, conflict_columns, payload_for};
use crate::reconcile::Reconciler;

pub const COUNTRIES_TABLE: &str = "countries";
pub const PROFILES_TABLE: &str = "country_profiles";

const COUNTRY_COLUMNS: &[&str] = &["iso2", "name", "capital", "region", "centroid_lat", "centroid_lng"];
const PROFILE_KEY_COLUMNS: &[&str] = &["iso2", "category"];
const PROFILE_COLUMNS: &[&str] = &["id", "iso2", "category", "metrics", "narrative", "sources"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPhase {
    FetchCountries,
    LoadCountries,
    UpsertCountries,
    LoadProfiles,
    CreateProfiles,
    FetchEnrichment,
    EnrichProfiles,
}

impl fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImportPhase::FetchCountries => "fetching countries",
            ImportPhase::LoadCountries => "loading stored countries",
            ImportPhase::UpsertCountries => "upserting countries",
            ImportPhase::LoadProfiles => "loading stored profiles",
            ImportPhase::CreateProfiles => "creating profiles",
            ImportPhase::FetchEnrichment => "fetching enrichment facts",
            ImportPhase::EnrichProfiles => "enriching profiles",
        })
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("{phase} failed: {source}")]
    Knowledge {
        phase: ImportPhase,
        #[source]
        source: KnowledgeError,
    },
    #[error("{phase} failed: {source}")]
    Store {
        phase: ImportPhase,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub countries_processed: usize,
    pub countries_inserted: usize,
    pub countries_updated: usize,
    pub profiles_created: usize,
    pub profiles_enriched: usize,
}

fn store_err(phase: ImportPhase) -> impl FnOnce(StoreError) -> ImportError {
    move |source| ImportError::Store { phase, source }
}

fn knowledge_err(phase: ImportPhase) -> impl FnOnce(KnowledgeError) -> ImportError {
    move |source| ImportError::Knowledge { phase, source }
}

fn from_store_row(row: Row, kind: RecordKind) -> CanonicalRecord {
    normalize(&RawRecord::new(Producer::StoreRow, row), kind)
}

/// Runs the full bootstrap against `store`.
pub async fn import_countries<S, K>(store: &S, knowledge: &K) -> Result<ImportSummary, ImportError>
where
    S: KeyColumnStore + ?Sized,
    K: ExternalKnowledgeSource + ?Sized,
{
    let mut summary = ImportSummary::default();

    let bindings = knowledge
        .query(COUNTRY_QUERY)
        .await
        .map_err(knowledge_err(ImportPhase::FetchCountries))?;
    let fresh = fresh_countries(bindings.iter().map(RawRecord::from_binding));
    let codes: Vec<String> = fresh.iter().filter_map(|c| c.iso2.clone()).collect();
    let code_set: HashSet<&str> = codes.iter().map(String::as_str).collect();
    info!(bindings = bindings.len(), countries = fresh.len(), "fetched countries");

    let stored: HashMap<String, CanonicalRecord> = store
        .select_all(COUNTRIES_TABLE, COUNTRY_COLUMNS)
        .await
        .map_err(store_err(ImportPhase::LoadCountries))?
        .into_iter()
        .map(|row| from_store_row(row, RecordKind::Country))
        .filter_map(|record| Some((record.iso2.clone()?, record)))
        .collect();

    let mut rows = Vec::with_capacity(fresh.len());
    for country in &fresh {
        let merged = match country.iso2.as_ref().and_then(|code| stored.get(code)) {
            Some(current) => {
                summary.countries_updated += 1;
                merge(country, current)
            }
            None => {
                summary.countries_inserted += 1;
                country.clone()
            }
        };
        rows.push(payload_for(&merged));
    }
    summary.countries_processed = rows.len();
    align_columns(&mut rows);
    if !rows.is_empty() {
        store
            .upsert(COUNTRIES_TABLE, &rows, conflict_columns(RecordKind::Country))
            .await
            .map_err(store_err(ImportPhase::UpsertCountries))?;
    }

    let existing_profiles: HashSet<(String, Category)> = store
        .select_all(PROFILES_TABLE, PROFILE_KEY_COLUMNS)
        .await
        .map_err(store_err(ImportPhase::LoadProfiles))?
        .into_iter()
        .map(|row| from_store_row(row, RecordKind::CountryProfile))
        .filter_map(|profile| Some((profile.iso2?, profile.category?)))
        .collect();
    let missing = missing_profiles(&codes, &existing_profiles);
    summary.profiles_created = missing.len();
    if !missing.is_empty() {
        let mut rows: Vec<Row> = missing.iter().map(payload_for).collect();
        align_columns(&mut rows);
        store
            .upsert(PROFILES_TABLE, &rows, conflict_columns(RecordKind::CountryProfile))
            .await
            .map_err(store_err(ImportPhase::CreateProfiles))?;
    }

    let facts = parse_enrichment(
        &knowledge
            .query(ENRICHMENT_QUERY)
            .await
            .map_err(knowledge_err(ImportPhase::FetchEnrichment))?,
    );
    let profiles = store
        .select_all(PROFILES_TABLE, PROFILE_COLUMNS)
        .await
        .map_err(store_err(ImportPhase::EnrichProfiles))?;
    let mut updates = Vec::new();
    for row in profiles {
        let mut profile = from_store_row(row, RecordKind::CountryProfile);
        let Some(code) = profile.iso2.clone().filter(|c| code_set.contains(c.as_str())) else {
            continue;
        };
        let (Some(id), Some(country_facts)) = (profile.id.clone(), facts.get(&code)) else {
            continue;
        };
        if !enrich_profile(&mut profile, country_facts) {
            continue;
        }
        debug!(iso2 = %code, category = %profile.category(), "profile enriched");
        let mut row = payload_for(&profile);
        row.insert("id".into(), json!(id));
        updates.push(row);
    }
    summary.profiles_enriched = updates.len();
    align_columns(&mut updates);
    if !updates.is_empty() {
        store
            .upsert(PROFILES_TABLE, &updates, &["id"])
            .await
            .map_err(store_err(ImportPhase::EnrichProfiles))?;
    }

    info!(
        processed = summary.countries_processed,
        inserted = summary.countries_inserted,
        updated = summary.countries_updated,
        profiles_created = summary.profiles_created,
        profiles_enriched = summary.profiles_enriched,
        "country import complete"
    );
    Ok(summary)
}

/// Normalizes country bindings, dropping rows without a code or a name and
/// folding duplicate codes so the fuller row wins field by field.
pub fn fresh_countries(raw: impl IntoIterator<Item = RawRecord>) -> Vec<CanonicalRecord> {
    let mut reconciler = Reconciler::new();
    for raw in raw {
        let record = normalize(&raw, RecordKind::Country);
        if record.iso2.is_none() || record.title.trim().is_empty() {
            continue;
        }
        reconciler.push(record);
    }
    reconciler.finish()
}

/// Starter profiles for every category each code is still missing.
pub fn missing_profiles(
    codes: &[String],
    existing: &HashSet<(String, Category)>,
) -> Vec<CanonicalRecord> {
    let mut out = Vec::new();
    for code in codes {
        for &category in Category::ALL {
            if existing.contains(&(code.clone(), category)) {
                continue;
            }
            let mut profile = CanonicalRecord::new(RecordKind::CountryProfile);
            profile.iso2 = Some(code.clone());
            profile.category = Some(category);
            profile.metrics = starter_metrics(category);
            profile.sources = SourceSet::from_iter([WIKIDATA_SOURCE]);
            profile.canonical_key = profile.build_key();
            out.push(profile);
        }
    }
    out
}

/// Fills blank metrics from `facts`; on any change the knowledge base is
/// added to the profile's sources. Returns whether anything changed.
pub fn enrich_profile(profile: &mut CanonicalRecord, facts: &EnrichmentFacts) -> bool {
    let mut changed = false;
    for (name, value) in facts.metrics_for(profile.category()) {
        changed |= fill_blank(&mut profile.metrics, name, value);
    }
    if changed {
        profile.sources.insert(WIKIDATA_SOURCE);
    }
    changed
}

fn fill_blank(metrics: &mut BTreeMap<String, String>, name: &str, value: String) -> bool {
    let slot = metrics.entry(name.to_string()).or_default();
    if !slot.trim().is_empty() || value.trim().is_empty() {
        return false;
    }
    *slot = value;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use intel_adapters::KnowledgeBinding;
    use serde_json::Value as JsonValue;
    use std::sync::Mutex;

    fn binding(pairs: &[(&str, &str)]) -> KnowledgeBinding {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct FakeKnowledge {
        countries: Vec<KnowledgeBinding>,
        enrichment: Vec<KnowledgeBinding>,
    }

    #[async_trait]
    impl ExternalKnowledgeSource for FakeKnowledge {
        async fn query(&self, query_text: &str) -> Result<Vec<KnowledgeBinding>, KnowledgeError> {
            if query_text == COUNTRY_QUERY {
                Ok(self.countries.clone())
            } else {
                Ok(self.enrichment.clone())
            }
        }
    }

    /// Tables as vectors of rows; upserts merge on the conflict columns.
    #[derive(Default)]
    struct TableStore {
        tables: Mutex<HashMap<String, Vec<Row>>>,
        next_id: Mutex<u64>,
        fail_table: Option<&'static str>,
    }

    impl TableStore {
        fn rows(&self, table: &str) -> Vec<Row> {
            self.tables
                .lock()
                .expect("lock")
                .get(table)
                .cloned()
                .unwrap_or_default()
        }

        fn seed(&self, table: &str, row: JsonValue) {
            let JsonValue::Object(row) = row else {
                panic!("seed rows must be objects");
            };
            self.tables
                .lock()
                .expect("lock")
                .entry(table.to_string())
                .or_default()
                .push(row);
        }
    }

    #[async_trait]
    impl KeyColumnStore for TableStore {
        async fn select_all(&self, table: &str, columns: &[&str]) -> Result<Vec<Row>, StoreError> {
            Ok(self
                .rows(table)
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .filter(|(k, _)| columns.contains(&k.as_str()))
                        .collect()
                })
                .collect())
        }

        async fn upsert(
            &self,
            table: &str,
            rows: &[Row],
            conflict_columns: &[&str],
        ) -> Result<(), StoreError> {
            if self.fail_table == Some(table) {
                return Err(StoreError::unavailable("store offline"));
            }
            if let Some(first) = rows.first() {
                let differs = |row: &Row| {
                    row.len() != first.len() || row.keys().any(|k| !first.contains_key(k))
                };
                if rows.iter().any(differs) {
                    return Err(StoreError::rejected("All object keys must match")
                        .with_details("PGRST102"));
                }
            }
            let mut tables = self.tables.lock().expect("lock");
            let stored = tables.entry(table.to_string()).or_default();
            for row in rows {
                let matches = |existing: &Row| {
                    !conflict_columns.is_empty()
                        && conflict_columns.iter().all(|c| existing.get(*c) == row.get(*c))
                };
                match stored.iter_mut().find(|existing| matches(&**existing)) {
                    Some(existing) => existing.extend(row.clone()),
                    None => {
                        let mut row = row.clone();
                        if !row.contains_key("id") {
                            let mut next = self.next_id.lock().expect("lock");
                            *next += 1;
                            row.insert("id".into(), json!(next.to_string()));
                        }
                        stored.push(row);
                    }
                }
            }
            Ok(())
        }

        async fn update(&self, _table: &str, _row: &Row, _id: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn knowledge() -> FakeKnowledge {
        FakeKnowledge {
            countries: vec![
                binding(&[("iso2", "fr"), ("countryLabel", "France"), ("coord", "Point(2.35 48.85)")]),
                binding(&[
                    ("iso2", "FR"),
                    ("countryLabel", "France"),
                    ("capitalLabel", "Paris"),
                    ("continentLabel", "Europe"),
                ]),
                binding(&[("iso2", "EE"), ("countryLabel", "Estonia")]),
                binding(&[("iso2", "XKX"), ("countryLabel", "Kosovo")]),
                binding(&[("iso2", "ZZ")]),
            ],
            enrichment: vec![binding(&[
                ("iso2", "FR"),
                ("governmentLabel", "semi-presidential system"),
                ("population", "68373433"),
                ("gdp", "3030904000000"),
            ])],
        }
    }

    #[test]
    fn duplicate_bindings_keep_the_fuller_row() {
        let countries = fresh_countries(knowledge().countries.iter().map(RawRecord::from_binding));
        assert_eq!(countries.len(), 2);
        let france = &countries[0];
        assert_eq!(france.iso2.as_deref(), Some("FR"));
        assert_eq!(france.capital.as_deref(), Some("Paris"));
        assert_eq!(france.region.as_deref(), Some("Europe"));
        assert_eq!(france.coordinates(), Some((48.85, 2.35)));
    }

    #[test]
    fn enrichment_fills_every_blank_and_tags_the_source() {
        let mut profile = CanonicalRecord::new(RecordKind::CountryProfile);
        profile.category = Some(Category::Social);
        profile.metrics = starter_metrics(Category::Social);
        profile.metrics.insert("Population".into(), "68 million".into());
        let facts = EnrichmentFacts {
            population: Some(68_373_433.0),
            life_expectancy: Some(82.3),
            hdi: Some(0.91),
            ..EnrichmentFacts::default()
        };
        assert!(enrich_profile(&mut profile, &facts));
        assert_eq!(profile.metrics["Population"], "68 million");
        assert_eq!(profile.metrics["Life expectancy"], "82.3 years");
        assert_eq!(profile.metrics["Human Development Index"], "0.910");
        assert!(profile.sources.contains("wikidata (cc0)"));
        assert!(!enrich_profile(&mut profile, &facts));
        assert_eq!(profile.sources.len(), 1);
    }

    #[tokio::test]
    async fn imports_countries_profiles_and_enrichment() {
        let store = TableStore::default();
        store.seed(
            COUNTRIES_TABLE,
            json!({"iso2": "EE", "name": "Estonia", "capital": "Tallinn", "centroid_lat": 58.6, "centroid_lng": 25.0}),
        );
        store.seed(
            PROFILES_TABLE,
            json!({"id": "p1", "iso2": "EE", "category": "military", "metrics": {}, "sources": []}),
        );

        let summary = import_countries(&store, &knowledge()).await.expect("import");
        assert_eq!(
            summary,
            ImportSummary {
                countries_processed: 2,
                countries_inserted: 1,
                countries_updated: 1,
                profiles_created: 9,
                profiles_enriched: 3,
            }
        );

        let countries = store.rows(COUNTRIES_TABLE);
        let estonia = countries
            .iter()
            .find(|row| row["iso2"] == "EE")
            .expect("estonia");
        assert_eq!(estonia["capital"], "Tallinn");
        assert_eq!(estonia["centroid_lat"], 58.6);

        let profiles = store.rows(PROFILES_TABLE);
        assert_eq!(profiles.len(), 10);
        let economic = profiles
            .iter()
            .find(|row| row["iso2"] == "FR" && row["category"] == "economic")
            .expect("economic profile");
        assert_eq!(economic["metrics"]["GDP"], "$3,030,904,000,000");
        assert_eq!(economic["sources"], json!([WIKIDATA_SOURCE]));
    }

    #[tokio::test]
    async fn bulk_rows_share_columns_when_countries_differ() {
        let store = TableStore::default();
        let knowledge = FakeKnowledge {
            countries: vec![
                binding(&[("iso2", "FR"), ("countryLabel", "France"), ("capitalLabel", "Paris")]),
                binding(&[("iso2", "AQ"), ("countryLabel", "Antarctica")]),
            ],
            enrichment: Vec::new(),
        };

        let summary = import_countries(&store, &knowledge).await.expect("import");
        assert_eq!(summary.countries_inserted, 2);
        let countries = store.rows(COUNTRIES_TABLE);
        let antarctica = countries
            .iter()
            .find(|row| row["iso2"] == "AQ")
            .expect("antarctica");
        assert_eq!(antarctica["capital"], JsonValue::Null);
    }

    #[tokio::test]
    async fn unrecognized_stored_categories_do_not_block_profiles() {
        let store = TableStore::default();
        store.seed(
            PROFILES_TABLE,
            json!({"id": "p9", "iso2": "EE", "category": "weather", "metrics": {}, "sources": []}),
        );

        let summary = import_countries(&store, &knowledge()).await.expect("import");
        assert_eq!(summary.profiles_created, 10);
        assert!(store
            .rows(PROFILES_TABLE)
            .iter()
            .any(|row| row["iso2"] == "EE" && row["category"] == "greyspace"));
    }

    #[tokio::test]
    async fn store_failures_name_the_phase() {
        let store = TableStore {
            fail_table: Some(PROFILES_TABLE),
            ..TableStore::default()
        };
        let err = import_countries(&store, &knowledge())
            .await
            .expect_err("profiles offline");
        assert!(matches!(
            err,
            ImportError::Store {
                phase: ImportPhase::CreateProfiles,
                ..
            }
        ));
        assert!(err.to_string().starts_with("creating profiles failed: store offline"));
    }

    #[test]
    fn summary_serializes_in_camel_case() {
        let value = serde_json::to_value(ImportSummary::default()).expect("serialize");
        assert!(value.get("countriesProcessed").is_some());
        assert!(value.get("profilesEnriched").is_some());
    }
}
