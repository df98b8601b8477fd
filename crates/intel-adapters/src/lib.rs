//! Ingestion boundary: raw producer records, synonym resolution and the
//! record normalizer, plus the knowledge-base source used for country data.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use intel_core::{
    build_key, CanonicalRecord, Category, ConfidenceLevel, ImpactLevel, MalformedField,
    PriorityLevel, RecordKind, RiskLevel, SourceSet, Status, MAX_LIST_ITEMS,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub mod knowledge;

pub use knowledge::{
    parse_enrichment, parse_sparql_bindings, starter_metrics, EnrichmentFacts,
    ExternalKnowledgeSource, KnowledgeBinding, KnowledgeError, SparqlKnowledgeSource,
    COUNTRY_QUERY, DEFAULT_SPARQL_ENDPOINT, ENRICHMENT_QUERY, WIKIDATA_SOURCE,
};

pub const CRATE_NAME: &str = "intel-adapters";

/// Key points derived from a narrative are limited to this many entries.
const DERIVED_POINTS_LIMIT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Producer {
    AdminForm,
    FeedEntry,
    Briefing,
    /// SPARQL result rows; every value is wrapped as `{"type": .., "value": ..}`.
    KnowledgeBase,
    /// Rows read back from the backing store.
    StoreRow,
}

/// A record exactly as an upstream producer emitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub producer: Producer,
    pub body: Map<String, JsonValue>,
}

impl RawRecord {
    pub fn new(producer: Producer, body: Map<String, JsonValue>) -> Self {
        Self { producer, body }
    }

    /// `None` unless `value` is a JSON object.
    pub fn from_value(producer: Producer, value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(body) => Some(Self::new(producer, body)),
            _ => None,
        }
    }
}

/// Reads a JSON array of producer objects (or a single object) from disk.
pub fn load_raw_records(path: impl AsRef<Path>, producer: Producer) -> anyhow::Result<Vec<RawRecord>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: JsonValue =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    let items = match value {
        JsonValue::Array(items) => items,
        single @ JsonValue::Object(_) => vec![single],
        _ => bail!("{} must hold a JSON object or array of objects", path.display()),
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            RawRecord::from_value(producer, item)
                .with_context(|| format!("{} entry {index} is not an object", path.display()))
        })
        .collect()
}

/// Semantic fields a producer may carry under one of several names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawField {
    Id,
    SourceUrl,
    Iso2,
    Title,
    Summary,
    Narrative,
    Category,
    Region,
    Status,
    Risk,
    Priority,
    Impact,
    Confidence,
    KeyPoints,
    Indicators,
    Sources,
    ObservedAt,
    UpdatedAt,
    Latitude,
    Longitude,
    Coordinates,
    WktPoint,
    Capital,
    Metrics,
}

/// Names accepted for each field, in precedence order. The first name
/// holding a non-empty value wins.
pub const SYNONYMS: &[(RawField, &[&str])] = &[
    (RawField::Id, &["id"]),
    (RawField::SourceUrl, &["source_url", "url", "link", "canonical_url"]),
    (RawField::Iso2, &["iso2"]),
    (RawField::Title, &["title", "headline", "name", "countryLabel"]),
    (RawField::Summary, &["summary", "executive_summary", "description", "excerpt"]),
    (
        RawField::Narrative,
        &["narrative", "details", "narrative_body", "body", "analysis"],
    ),
    (RawField::Category, &["category", "type", "category_slug"]),
    (RawField::Region, &["region", "region_code", "continent", "continentLabel"]),
    (RawField::Status, &["status", "state"]),
    (RawField::Risk, &["risk_level", "risk", "riskLevel"]),
    (RawField::Priority, &["priority_level", "priority", "priorityLevel"]),
    (RawField::Impact, &["impact_level", "impact", "impactLevel"]),
    (
        RawField::Confidence,
        &["confidence", "confidence_level", "confidenceLevel"],
    ),
    (RawField::KeyPoints, &["key_points", "points", "keyPoints", "highlights"]),
    (RawField::Indicators, &["indicators", "signals", "watch_indicators"]),
    (RawField::Sources, &["sources", "source", "source_list"]),
    (
        RawField::ObservedAt,
        &["observed_at", "timestamp", "published_at", "event_time", "date"],
    ),
    (RawField::UpdatedAt, &["updated_at", "modified_at", "last_updated"]),
    (RawField::Latitude, &["lat", "latitude", "centroid_lat"]),
    (
        RawField::Longitude,
        &["lng", "long", "lon", "longitude", "centroid_lng"],
    ),
    (RawField::Coordinates, &["coords", "coordinates", "centroid"]),
    (RawField::WktPoint, &["coord", "location"]),
    (RawField::Capital, &["capital", "capitalLabel"]),
    (RawField::Metrics, &["metrics"]),
];

pub fn synonyms_for(field: RawField) -> &'static [&'static str] {
    SYNONYMS
        .iter()
        .find(|(f, _)| *f == field)
        .map(|(_, names)| *names)
        .unwrap_or(&[])
}

/// Text or number as found in a raw body.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Text(String),
    Number(f64),
}

impl Scalar {
    fn as_text(&self) -> String {
        match self {
            Scalar::Text(s) => s.clone(),
            Scalar::Number(n) => n.to_string(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            Scalar::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ListInput {
    #[default]
    Absent,
    List(Vec<String>),
    Text(String),
}

/// Producer fields after synonym resolution, still unparsed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawFields {
    pub id: Option<String>,
    pub source_url: Option<String>,
    pub iso2: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub narrative: Option<String>,
    pub category: Option<String>,
    pub region: Option<String>,
    pub status: Option<String>,
    pub risk: Option<String>,
    pub priority: Option<String>,
    pub impact: Option<String>,
    pub confidence: Option<String>,
    pub capital: Option<String>,
    pub key_points: ListInput,
    pub indicators: ListInput,
    pub sources: ListInput,
    pub observed_at: Option<Scalar>,
    pub updated_at: Option<Scalar>,
    pub latitude: Option<Scalar>,
    pub longitude: Option<Scalar>,
    pub coordinates: Option<Vec<Scalar>>,
    pub wkt_point: Option<String>,
    pub metrics: BTreeMap<String, String>,
}

fn unwrap_binding(value: &JsonValue) -> &JsonValue {
    match value {
        JsonValue::Object(obj) => obj.get("value").unwrap_or(value),
        _ => value,
    }
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(obj) => obj.is_empty(),
        _ => false,
    }
}

fn lookup<'a>(raw: &'a RawRecord, field: RawField) -> Option<&'a JsonValue> {
    synonyms_for(field).iter().find_map(|name| {
        let value = raw.body.get(*name)?;
        let value = if raw.producer == Producer::KnowledgeBase {
            unwrap_binding(value)
        } else {
            value
        };
        (!is_blank(value)).then_some(value)
    })
}

fn scalar_of(value: &JsonValue) -> Option<Scalar> {
    match value {
        JsonValue::String(s) => Some(Scalar::Text(s.trim().to_string())),
        JsonValue::Number(n) => n.as_f64().map(Scalar::Number),
        JsonValue::Bool(b) => Some(Scalar::Text(b.to_string())),
        _ => None,
    }
}

fn text_of(value: &JsonValue) -> Option<String> {
    scalar_of(value).map(|s| s.as_text())
}

fn list_of(value: &JsonValue) -> ListInput {
    match value {
        JsonValue::Array(items) => ListInput::List(items.iter().filter_map(text_of).collect()),
        JsonValue::String(s) => ListInput::Text(s.clone()),
        _ => ListInput::Absent,
    }
}

fn metrics_of(value: &JsonValue) -> BTreeMap<String, String> {
    let JsonValue::Object(obj) = value else {
        return BTreeMap::new();
    };
    obj.iter()
        .map(|(k, v)| {
            let text = match v {
                JsonValue::Null => String::new(),
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect()
}

/// Resolves synonyms into the explicit field struct.
pub fn resolve_fields(raw: &RawRecord) -> RawFields {
    let text = |field| lookup(raw, field).and_then(text_of);
    let scalar = |field| lookup(raw, field).and_then(scalar_of);
    let list = |field| lookup(raw, field).map(list_of).unwrap_or_default();

    RawFields {
        id: text(RawField::Id),
        source_url: text(RawField::SourceUrl),
        iso2: text(RawField::Iso2),
        title: text(RawField::Title),
        summary: text(RawField::Summary),
        narrative: text(RawField::Narrative),
        category: text(RawField::Category),
        region: text(RawField::Region),
        status: text(RawField::Status),
        risk: text(RawField::Risk),
        priority: text(RawField::Priority),
        impact: text(RawField::Impact),
        confidence: text(RawField::Confidence),
        capital: text(RawField::Capital),
        key_points: list(RawField::KeyPoints),
        indicators: list(RawField::Indicators),
        sources: list(RawField::Sources),
        observed_at: scalar(RawField::ObservedAt),
        updated_at: scalar(RawField::UpdatedAt),
        latitude: scalar(RawField::Latitude),
        longitude: scalar(RawField::Longitude),
        coordinates: lookup(raw, RawField::Coordinates).and_then(|v| match v {
            JsonValue::Array(items) => Some(items.iter().filter_map(scalar_of).collect()),
            _ => None,
        }),
        wkt_point: text(RawField::WktPoint),
        metrics: lookup(raw, RawField::Metrics)
            .map(metrics_of)
            .unwrap_or_default(),
    }
}

/// Converts a raw record into the canonical shape, substituting defaults for
/// anything unparsable.
pub fn normalize(raw: &RawRecord, kind: RecordKind) -> CanonicalRecord {
    normalize_with_issues(raw, kind).0
}

/// Same as [`normalize`], also reporting every field that fell back to its default.
pub fn normalize_with_issues(
    raw: &RawRecord,
    kind: RecordKind,
) -> (CanonicalRecord, Vec<MalformedField>) {
    let fields = resolve_fields(raw);
    let mut issues = Vec::new();

    let narrative_body = fields.narrative.clone().unwrap_or_default();
    let mut key_points = parse_list(&fields.key_points);
    if key_points.is_empty() && !kind.is_country() {
        key_points = derive_points(&narrative_body);
    }
    let (latitude, longitude) = resolve_coordinates(&fields, &mut issues);

    let mut record = CanonicalRecord {
        id: fields.id.clone(),
        canonical_key: String::new(),
        record_kind: kind,
        category: parse_known("category", fields.category.as_deref(), Category::parse, &mut issues),
        region: fields.region.as_deref().and_then(normalize_region),
        title: fields.title.clone().unwrap_or_default(),
        summary: fields.summary.clone().unwrap_or_default(),
        narrative_body,
        key_points,
        indicators: parse_list(&fields.indicators),
        sources: parse_sources(&fields.sources),
        source_url: fields.source_url.clone().filter(|u| !u.is_empty()),
        status: parse_enum("status", fields.status.as_deref(), Status::parse, &mut issues),
        risk_level: parse_enum("risk_level", fields.risk.as_deref(), RiskLevel::parse, &mut issues),
        priority_level: parse_enum(
            "priority_level",
            fields.priority.as_deref(),
            PriorityLevel::parse,
            &mut issues,
        ),
        impact_level: parse_enum(
            "impact_level",
            fields.impact.as_deref(),
            ImpactLevel::parse,
            &mut issues,
        ),
        confidence_level: parse_enum(
            "confidence_level",
            fields.confidence.as_deref(),
            ConfidenceLevel::parse,
            &mut issues,
        ),
        observed_at: parse_time_field("observed_at", fields.observed_at.as_ref(), &mut issues),
        updated_at: parse_time_field("updated_at", fields.updated_at.as_ref(), &mut issues),
        latitude,
        longitude,
        iso2: parse_iso2(fields.iso2.as_deref(), &mut issues),
        capital: fields.capital.clone().filter(|c| !c.is_empty()),
        metrics: fields.metrics.clone(),
    };
    record.canonical_key = build_key(&record);
    (record, issues)
}

fn parse_enum<T: Default>(
    field: &'static str,
    raw: Option<&str>,
    parse: fn(&str) -> Option<T>,
    issues: &mut Vec<MalformedField>,
) -> T {
    parse_known(field, raw, parse, issues).unwrap_or_default()
}

/// Recognized value, or `None` for absent input and (reported) unknown tokens.
fn parse_known<T>(
    field: &'static str,
    raw: Option<&str>,
    parse: fn(&str) -> Option<T>,
    issues: &mut Vec<MalformedField>,
) -> Option<T> {
    let raw = raw?;
    let parsed = parse(raw);
    if parsed.is_none() {
        issues.push(MalformedField {
            field,
            raw: raw.to_string(),
            reason: "not in the allowed set".to_string(),
        });
    }
    parsed
}

/// Trims and collapses inner whitespace; blank regions are absent.
pub fn normalize_region(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

/// List-shaped input, in order: native list, newline-delimited text,
/// semicolon-delimited text. Capped at [`MAX_LIST_ITEMS`].
pub fn parse_list(input: &ListInput) -> Vec<String> {
    let items: Vec<String> = match input {
        ListInput::Absent => Vec::new(),
        ListInput::List(items) => clean_items(items.iter().map(String::as_str)),
        ListInput::Text(text) => {
            let lines = clean_items(text.lines());
            if lines.len() >= 2 {
                lines
            } else {
                clean_items(text.split(';'))
            }
        }
    };
    items.into_iter().take(MAX_LIST_ITEMS).collect()
}

fn clean_items<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    items
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Comma-delimited source text or a native list, trimmed and de-duplicated.
pub fn parse_sources(input: &ListInput) -> SourceSet {
    match input {
        ListInput::Absent => SourceSet::new(),
        ListInput::List(items) => items.iter().collect(),
        ListInput::Text(text) => text.split(',').collect(),
    }
}

/// Key points read off a narrative: its lines when there are at least two,
/// otherwise its sentences.
pub fn derive_points(narrative: &str) -> Vec<String> {
    let lines = clean_items(narrative.lines());
    let points = if lines.len() >= 2 {
        lines
    } else {
        split_sentences(narrative)
    };
    points.into_iter().take(DERIVED_POINTS_LIMIT).collect()
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        current.push(ch);
        let at_boundary = matches!(ch, '.' | '!' | '?')
            && chars.peek().map(|c| c.is_whitespace()).unwrap_or(false);
        if at_boundary {
            out.push(std::mem::take(&mut current));
        }
    }
    out.push(current);
    clean_items(out.iter().map(String::as_str))
}

/// Accepts RFC 3339, zone-less `YYYY-MM-DDTHH:MM[:SS]` (read as UTC), bare
/// dates and numeric epochs (milliseconds above 10^11, seconds otherwise).
pub fn parse_timestamp(raw: &Scalar) -> Option<DateTime<Utc>> {
    match raw {
        Scalar::Number(n) => from_epoch(*n),
        Scalar::Text(text) => {
            let text = text.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                    return Some(naive.and_utc());
                }
            }
            if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
                return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
            }
            text.parse::<f64>().ok().and_then(from_epoch)
        }
    }
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    if value.abs() > 1e11 {
        DateTime::from_timestamp_millis(value as i64)
    } else {
        DateTime::from_timestamp(value as i64, 0)
    }
}

fn parse_time_field(
    field: &'static str,
    raw: Option<&Scalar>,
    issues: &mut Vec<MalformedField>,
) -> Option<DateTime<Utc>> {
    let raw = raw?;
    let parsed = parse_timestamp(raw);
    if parsed.is_none() {
        issues.push(MalformedField {
            field,
            raw: raw.as_text(),
            reason: "unparsable timestamp".to_string(),
        });
    }
    parsed
}

/// Reads `Point(lng lat)` as produced by the knowledge base.
pub fn parse_wkt_point(raw: &str) -> Option<(f64, f64)> {
    let trimmed = raw.trim();
    let open = trimmed.find('(')?;
    if !trimmed[..open].trim().eq_ignore_ascii_case("point") {
        return None;
    }
    let inner = trimmed[open + 1..].strip_suffix(')')?;
    let mut parts = inner.split_whitespace();
    let lng = parts.next()?.parse::<f64>().ok()?;
    let lat = parts.next()?.parse::<f64>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((lng, lat))
}

fn resolve_coordinates(
    fields: &RawFields,
    issues: &mut Vec<MalformedField>,
) -> (Option<f64>, Option<f64>) {
    let explicit = (
        fields.latitude.as_ref().and_then(Scalar::as_f64),
        fields.longitude.as_ref().and_then(Scalar::as_f64),
    );
    let pair = match explicit {
        (Some(lat), Some(lng)) => Some((lat, lng)),
        (None, None) => fields
            .coordinates
            .as_ref()
            .filter(|c| c.len() == 2)
            .and_then(|c| Some((c[1].as_f64()?, c[0].as_f64()?)))
            .or_else(|| {
                fields
                    .wkt_point
                    .as_deref()
                    .and_then(parse_wkt_point)
                    .map(|(lng, lat)| (lat, lng))
            }),
        (lat, lng) => {
            issues.push(MalformedField {
                field: "coordinates",
                raw: format!("{lat:?}/{lng:?}"),
                reason: "latitude and longitude must both be present".to_string(),
            });
            None
        }
    };
    match pair {
        Some((lat, lng)) if valid_coordinates(lat, lng) => (Some(lat), Some(lng)),
        Some((lat, lng)) => {
            issues.push(MalformedField {
                field: "coordinates",
                raw: format!("{lat}/{lng}"),
                reason: "out of range".to_string(),
            });
            (None, None)
        }
        None => (None, None),
    }
}

pub fn valid_coordinates(lat: f64, lng: f64) -> bool {
    lat.is_finite()
        && lng.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lng)
}

/// Upper-cased ISO 3166-1 alpha-2 code, or `None` if `raw` is not one.
pub fn normalize_iso2(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_uppercase();
    (code.len() == 2 && code.chars().all(|c| c.is_ascii_uppercase())).then_some(code)
}

fn parse_iso2(raw: Option<&str>, issues: &mut Vec<MalformedField>) -> Option<String> {
    let raw = raw?;
    let code = normalize_iso2(raw);
    if code.is_none() {
        issues.push(MalformedField {
            field: "iso2",
            raw: raw.to_string(),
            reason: "expected a two-letter code".to_string(),
        });
    }
    code
}
