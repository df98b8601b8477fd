//! Public knowledge-base access for the country bootstrap.

use std::collections::BTreeMap;

use async_trait::async_trait;
use intel_core::Category;
use intel_storage::{build_http_client, HttpClientConfig};
use reqwest::header::ACCEPT;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use crate::{normalize_iso2, Producer, RawRecord};

pub const WIKIDATA_SOURCE: &str = "Wikidata (CC0)";
pub const DEFAULT_SPARQL_ENDPOINT: &str = "https://query.wikidata.org/sparql";

const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";
const ERROR_BODY_LIMIT: usize = 512;

/// Sovereign states and comparable territories with an ISO 3166-1 alpha-2 code.
pub const COUNTRY_QUERY: &str = r#"
SELECT ?country ?iso2 ?countryLabel ?capitalLabel ?continentLabel ?coord WHERE {
  ?country wdt:P297 ?iso2 .
  VALUES ?class {
    wd:Q6256
    wd:Q3624078
    wd:Q161243
    wd:Q3336843
    wd:Q82794
    wd:Q46395
  }
  ?country wdt:P31/wdt:P279* ?class .
  OPTIONAL { ?country wdt:P36 ?capital . }
  OPTIONAL { ?country wdt:P30 ?continent . }
  OPTIONAL { ?country wdt:P625 ?coord . }
  SERVICE wikibase:label { bd:serviceParam wikibase:language "en". }
}
ORDER BY ?countryLabel
"#;

/// One row per ISO code with the facts used to fill profile metrics.
pub const ENRICHMENT_QUERY: &str = r#"
SELECT ?iso2
       (SAMPLE(?governmentLabel) AS ?governmentLabel)
       (SAMPLE(?headOfStateLabel) AS ?headOfStateLabel)
       (SAMPLE(?headOfGovernmentLabel) AS ?headOfGovernmentLabel)
       (SAMPLE(?currencyLabel) AS ?currencyLabel)
       (MAX(?population) AS ?population)
       (MAX(?gdp) AS ?gdp)
       (MAX(?gdpPerCapita) AS ?gdpPerCapita)
       (MAX(?lifeExpectancy) AS ?lifeExpectancy)
       (MAX(?hdi) AS ?hdi)
       (MAX(?militaryPersonnel) AS ?militaryPersonnel)
       (MAX(?defenseSpending) AS ?defenseSpending)
WHERE {
  ?country wdt:P297 ?iso2 .
  FILTER(STRLEN(?iso2) = 2)
  FILTER NOT EXISTS { ?country wdt:P576 ?dissolved }
  OPTIONAL { ?country wdt:P122 ?government . }
  OPTIONAL { ?country wdt:P35 ?headOfState . }
  OPTIONAL { ?country wdt:P6 ?headOfGovernment . }
  OPTIONAL { ?country wdt:P38 ?currency . }
  OPTIONAL { ?country wdt:P1082 ?population . }
  OPTIONAL { ?country wdt:P2131 ?gdp . }
  OPTIONAL { ?country wdt:P2132 ?gdpPerCapita . }
  OPTIONAL { ?country wdt:P2250 ?lifeExpectancy . }
  OPTIONAL { ?country wdt:P1081 ?hdi . }
  OPTIONAL { ?country wdt:P1083 ?militaryPersonnel . }
  OPTIONAL { ?country wdt:P2206 ?defenseSpending . }
  SERVICE wikibase:label { bd:serviceParam wikibase:language "en". }
}
GROUP BY ?iso2
"#;

/// One result row: variable name to its lexical value.
pub type KnowledgeBinding = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("knowledge query transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("knowledge query failed: {status} {body}")]
    Status { status: u16, body: String },
    #[error("knowledge query returned invalid json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("knowledge query returned an unexpected shape: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait ExternalKnowledgeSource: Send + Sync {
    async fn query(&self, query_text: &str) -> Result<Vec<KnowledgeBinding>, KnowledgeError>;
}

pub struct SparqlKnowledgeSource {
    client: reqwest::Client,
    endpoint: String,
}

impl SparqlKnowledgeSource {
    pub fn new(endpoint: impl Into<String>, config: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_http_client(config)?,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ExternalKnowledgeSource for SparqlKnowledgeSource {
    async fn query(&self, query_text: &str) -> Result<Vec<KnowledgeBinding>, KnowledgeError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("query", query_text), ("format", "json")])
            .header(ACCEPT, SPARQL_RESULTS_JSON)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(KnowledgeError::Status {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }
        let value: JsonValue = serde_json::from_str(&body)?;
        let bindings = parse_sparql_bindings(&value)?;
        debug!(endpoint = %self.endpoint, rows = bindings.len(), "knowledge query complete");
        Ok(bindings)
    }
}

/// Flattens `results.bindings` of a SPARQL JSON result document.
pub fn parse_sparql_bindings(document: &JsonValue) -> Result<Vec<KnowledgeBinding>, KnowledgeError> {
    let rows = document
        .pointer("/results/bindings")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| KnowledgeError::Malformed("missing results.bindings".to_string()))?;

    Ok(rows
        .iter()
        .filter_map(JsonValue::as_object)
        .map(|row| {
            row.iter()
                .filter_map(|(name, cell)| {
                    let value = match cell.get("value").unwrap_or(cell) {
                        JsonValue::String(s) => s.clone(),
                        JsonValue::Null => return None,
                        other => other.to_string(),
                    };
                    Some((name.clone(), value))
                })
                .collect()
        })
        .collect())
}

impl RawRecord {
    pub fn from_binding(binding: &KnowledgeBinding) -> Self {
        let body: Map<String, JsonValue> = binding
            .iter()
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect();
        Self::new(Producer::KnowledgeBase, body)
    }
}

/// Facts about one country used to fill blank profile metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentFacts {
    pub government: Option<String>,
    pub head_of_state: Option<String>,
    pub head_of_government: Option<String>,
    pub currency: Option<String>,
    pub population: Option<f64>,
    pub gdp: Option<f64>,
    pub gdp_per_capita: Option<f64>,
    pub life_expectancy: Option<f64>,
    pub hdi: Option<f64>,
    pub military_personnel: Option<f64>,
    pub defense_spending: Option<f64>,
}

impl EnrichmentFacts {
    pub fn from_binding(binding: &KnowledgeBinding) -> Self {
        let text = |name: &str| {
            binding
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let number = |name: &str| {
            binding
                .get(name)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|n| n.is_finite())
        };
        Self {
            government: text("governmentLabel"),
            head_of_state: text("headOfStateLabel"),
            head_of_government: text("headOfGovernmentLabel"),
            currency: text("currencyLabel"),
            population: number("population"),
            gdp: number("gdp"),
            gdp_per_capita: number("gdpPerCapita"),
            life_expectancy: number("lifeExpectancy"),
            hdi: number("hdi"),
            military_personnel: number("militaryPersonnel"),
            defense_spending: number("defenseSpending"),
        }
    }

    /// Formatted metric values this country can contribute to a profile of
    /// `category`, in fill order. Facts that are unknown are omitted.
    pub fn metrics_for(&self, category: Category) -> Vec<(&'static str, String)> {
        let candidates: Vec<(&'static str, Option<String>)> = match category {
            Category::Political => vec![
                ("Government", self.government.clone()),
                ("Head of state", self.head_of_state.clone()),
                ("Head of government", self.head_of_government.clone()),
            ],
            Category::Economic => vec![
                ("GDP", self.gdp.map(format_money)),
                ("GDP per capita", self.gdp_per_capita.map(format_money)),
                ("Currency", self.currency.clone()),
            ],
            Category::Social => vec![
                ("Population", self.population.map(format_int)),
                ("Life expectancy", self.life_expectancy.map(format_years)),
                (
                    "Human Development Index",
                    self.hdi.map(|v| format_decimal(v, 3)),
                ),
            ],
            Category::Military => vec![
                ("Active personnel", self.military_personnel.map(format_int)),
                ("Defense spending", self.defense_spending.map(format_money)),
            ],
            Category::Greyspace => Vec::new(),
        };
        candidates
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name, v)))
            .collect()
    }
}

/// Enrichment rows keyed by upper-case ISO code; rows without a valid code are skipped.
pub fn parse_enrichment(bindings: &[KnowledgeBinding]) -> BTreeMap<String, EnrichmentFacts> {
    bindings
        .iter()
        .filter_map(|binding| {
            let iso2 = normalize_iso2(binding.get("iso2")?)?;
            Some((iso2, EnrichmentFacts::from_binding(binding)))
        })
        .collect()
}

/// Blank metric slots a freshly created profile starts with.
pub fn starter_metrics(category: Category) -> BTreeMap<String, String> {
    let names: &[&str] = match category {
        Category::Political => &["Government", "Stability"],
        Category::Military => &["Active personnel", "Reserve", "Defense spending"],
        Category::Economic => &["GDP", "Key industries"],
        Category::Social => &["Population", "Urbanization", "Life expectancy"],
        Category::Greyspace => &["Key agencies", "Cyber capability", "Influence ops"],
    };
    names
        .iter()
        .map(|name| (name.to_string(), String::new()))
        .collect()
}

fn group_thousands(value: f64) -> String {
    let rounded = value.abs().round() as u64;
    let digits = rounded.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// `1234567.4` -> `1,234,567`
pub fn format_int(value: f64) -> String {
    let sign = if value.round() < 0.0 { "-" } else { "" };
    format!("{sign}{}", group_thousands(value))
}

/// `-1234.5` -> `-$1,235`
pub fn format_money(value: f64) -> String {
    let sign = if value.round() < 0.0 { "-" } else { "" };
    format!("{sign}${}", group_thousands(value))
}

pub fn format_years(value: f64) -> String {
    format!("{value:.1} years")
}

pub fn format_decimal(value: f64, digits: usize) -> String {
    format!("{value:.digits$}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize;
    use intel_core::RecordKind;
    use serde_json::json;

    fn binding(pairs: &[(&str, &str)]) -> KnowledgeBinding {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn flattens_sparql_documents() {
        let document = json!({
            "head": {"vars": ["iso2", "countryLabel"]},
            "results": {"bindings": [
                {
                    "iso2": {"type": "literal", "value": "FR"},
                    "countryLabel": {"type": "literal", "xml:lang": "en", "value": "France"}
                },
                {"iso2": {"type": "literal", "value": "DE"}}
            ]}
        });
        let rows = parse_sparql_bindings(&document).expect("bindings");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("countryLabel").map(String::as_str), Some("France"));
        assert!(rows[1].get("countryLabel").is_none());
    }

    #[test]
    fn rejects_documents_without_bindings() {
        let err = parse_sparql_bindings(&json!({"boolean": true})).expect_err("no bindings");
        assert!(matches!(err, KnowledgeError::Malformed(_)));
    }

    #[test]
    fn bindings_normalize_as_countries() {
        let row = binding(&[
            ("iso2", "jp"),
            ("countryLabel", "Japan"),
            ("capitalLabel", "Tokyo"),
            ("continentLabel", "Asia"),
            ("coord", "Point(139.0 35.0)"),
        ]);
        let record = normalize(&RawRecord::from_binding(&row), RecordKind::Country);
        assert_eq!(record.canonical_key, "iso2:jp");
        assert_eq!(record.iso2.as_deref(), Some("JP"));
        assert_eq!(record.coordinates(), Some((35.0, 139.0)));
    }

    #[test]
    fn formats_follow_us_conventions() {
        assert_eq!(format_int(67_750_000.0), "67,750,000");
        assert_eq!(format_int(999.6), "1,000");
        assert_eq!(format_int(12.0), "12");
        assert_eq!(format_money(2_780_000_000_000.0), "$2,780,000,000,000");
        assert_eq!(format_money(-1234.5), "-$1,235");
        assert_eq!(format_years(82.456), "82.5 years");
        assert_eq!(format_decimal(0.9412, 3), "0.941");
    }

    #[test]
    fn enrichment_skips_invalid_codes_and_blank_facts() {
        let rows = vec![
            binding(&[
                ("iso2", "de"),
                ("governmentLabel", "federal parliamentary republic"),
                ("population", "84358845"),
                ("lifeExpectancy", "80.6"),
                ("hdi", "0.942"),
                ("gdp", "not-a-number"),
            ]),
            binding(&[("iso2", "XYZ"), ("population", "1")]),
        ];
        let facts = parse_enrichment(&rows);
        assert_eq!(facts.len(), 1);
        let de = &facts["DE"];
        assert_eq!(de.gdp, None);
        assert_eq!(
            de.metrics_for(Category::Social),
            vec![
                ("Population", "84,358,845".to_string()),
                ("Life expectancy", "80.6 years".to_string()),
                ("Human Development Index", "0.942".to_string()),
            ]
        );
        assert!(de.metrics_for(Category::Economic).is_empty());
        assert!(de.metrics_for(Category::Greyspace).is_empty());
    }

    #[test]
    fn starter_metrics_are_blank() {
        let metrics = starter_metrics(Category::Military);
        assert_eq!(metrics.len(), 3);
        assert!(metrics.values().all(String::is_empty));
        assert!(metrics.contains_key("Defense spending"));
    }
}
