//! Core domain model for intel record reconciliation.
//!
//! Holds the canonical record shape, the closed enumerations used for
//! classification and the risk/trust triad, the case-insensitive source set,
//! and the canonical key builder used to detect duplicates.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub const CRATE_NAME: &str = "intel-core";

/// Upper bound on `key_points` and `indicators` entries.
pub const MAX_LIST_ITEMS: usize = 12;

/// Lower-case and drop separators so "Grey Space", "grey-space" and
/// "greyspace" compare equal.
fn normalize_token(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Declares a closed enumeration with a fixed default and a severity order
/// matching declaration order.
macro_rules! closed_enum {
    (
        $(#[$meta:meta])*
        $name:ident default $default:ident {
            $($variant:ident => $token:literal $(| $alias:literal)*),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $token),+
                }
            }

            /// Strict parse; `None` when the token is not in the allowed set.
            pub fn parse(raw: &str) -> Option<Self> {
                let token = normalize_token(raw);
                $(
                    if token == $token $(|| token == $alias)* {
                        return Some($name::$variant);
                    }
                )+
                None
            }

            /// Parse with the field's fixed default for absent or unrecognized input.
            pub fn parse_or_default(raw: Option<&str>) -> Self {
                raw.and_then(Self::parse).unwrap_or_default()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::$default
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

closed_enum! {
    /// Thematic category of an intel record.
    Category default Greyspace {
        Political => "political",
        Military => "military",
        Economic => "economic",
        Social => "social",
        Greyspace => "greyspace",
    }
}

closed_enum! {
    RiskLevel default Low {
        Low => "low",
        Medium => "medium" | "med",
        High => "high",
    }
}

closed_enum! {
    PriorityLevel default Medium {
        Low => "low",
        Medium => "medium" | "med",
        High => "high",
    }
}

closed_enum! {
    ImpactLevel default Noise {
        Noise => "noise",
        Tactical => "tactical",
        Operational => "operational",
        Strategic => "strategic",
    }
}

closed_enum! {
    ConfidenceLevel default Medium {
        Low => "low",
        Medium => "medium" | "med",
        High => "high",
    }
}

closed_enum! {
    Status default Ongoing {
        Ongoing => "ongoing",
        Developing => "developing",
        Resolved => "resolved",
    }
}

/// Which producer family a record belongs to; selects the persisted shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    #[default]
    Event,
    ScheduledBrief,
    RegionalBrief,
    SpecialBrief,
    Country,
    CountryProfile,
}

impl RecordKind {
    pub const ALL: &'static [RecordKind] = &[
        RecordKind::Event,
        RecordKind::ScheduledBrief,
        RecordKind::RegionalBrief,
        RecordKind::SpecialBrief,
        RecordKind::Country,
        RecordKind::CountryProfile,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Event => "event",
            RecordKind::ScheduledBrief => "scheduled-brief",
            RecordKind::RegionalBrief => "regional-brief",
            RecordKind::SpecialBrief => "special-brief",
            RecordKind::Country => "country",
            RecordKind::CountryProfile => "country-profile",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let token = raw.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL.iter().copied().find(|kind| kind.as_str() == token)
    }

    pub fn is_brief(self) -> bool {
        matches!(
            self,
            RecordKind::ScheduledBrief | RecordKind::RegionalBrief | RecordKind::SpecialBrief
        )
    }

    pub fn is_country(self) -> bool {
        matches!(self, RecordKind::Country | RecordKind::CountryProfile)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered set of provenance strings, unique under case-insensitive comparison.
///
/// Entries are trimmed on insert and blanks are ignored. The first spelling
/// seen for an entry is the one kept.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct SourceSet {
    entries: Vec<String>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `entry` unless an equal entry (ignoring case) is present.
    /// Returns whether the set grew.
    pub fn insert(&mut self, entry: &str) -> bool {
        let trimmed = entry.trim();
        if trimmed.is_empty() || self.contains(trimmed) {
            return false;
        }
        self.entries.push(trimmed.to_string());
        true
    }

    pub fn contains(&self, entry: &str) -> bool {
        let needle = entry.trim().to_lowercase();
        self.entries.iter().any(|e| e.to_lowercase() == needle)
    }

    /// Existing entries first, then unseen entries of `other` in their order.
    pub fn union(&self, other: &SourceSet) -> SourceSet {
        let mut out = self.clone();
        for entry in &other.entries {
            out.insert(entry);
        }
        out
    }

    pub fn first(&self) -> Option<&str> {
        self.entries.first().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.entries
    }
}

impl<S: AsRef<str>> FromIterator<S> for SourceSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = SourceSet::new();
        for entry in iter {
            set.insert(entry.as_ref());
        }
        set
    }
}

impl From<Vec<String>> for SourceSet {
    fn from(entries: Vec<String>) -> Self {
        entries.into_iter().collect()
    }
}

impl From<SourceSet> for Vec<String> {
    fn from(set: SourceSet) -> Self {
        set.entries
    }
}

/// A single field that failed to parse and was replaced by its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedField {
    pub field: &'static str,
    pub raw: String,
    pub reason: String,
}

impl fmt::Display for MalformedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({:?})", self.field, self.reason, self.raw)
    }
}

/// The reconciled representation of an intel item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CanonicalRecord {
    pub id: Option<String>,
    pub canonical_key: String,
    pub record_kind: RecordKind,
    /// `None` until a producer supplies a recognized category; see [`CanonicalRecord::category`].
    pub category: Option<Category>,
    pub region: Option<String>,
    pub title: String,
    pub summary: String,
    pub narrative_body: String,
    pub key_points: Vec<String>,
    pub indicators: Vec<String>,
    pub sources: SourceSet,
    /// Explicit external identifier, usually the story's canonical URL.
    pub source_url: Option<String>,
    pub status: Status,
    pub risk_level: RiskLevel,
    pub priority_level: PriorityLevel,
    pub impact_level: ImpactLevel,
    pub confidence_level: ConfidenceLevel,
    pub observed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub iso2: Option<String>,
    pub capital: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, String>,
}

impl CanonicalRecord {
    pub fn new(record_kind: RecordKind) -> Self {
        Self {
            record_kind,
            ..Default::default()
        }
    }

    /// Category with the `greyspace` default applied.
    pub fn category(&self) -> Category {
        self.category.unwrap_or_default()
    }

    /// The `(latitude, longitude)` pair when both halves are present and finite.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) if lat.is_finite() && lng.is_finite() => Some((lat, lng)),
            _ => None,
        }
    }

    pub fn build_key(&self) -> String {
        build_key(self)
    }
}

/// Derives the deduplication key for `record`.
///
/// Explicit identifiers win: country kinds key on their ISO code, other kinds
/// on their source URL. Without one the key is a content signature of the
/// title, the host of the first source and the UTC calendar day observed.
pub fn build_key(record: &CanonicalRecord) -> String {
    if let Some(key) = explicit_key(record) {
        return key;
    }
    let title = record.title.trim().to_lowercase();
    let domain = record.sources.first().map(source_domain).unwrap_or_default();
    let bucket = record.observed_at.map(date_bucket).unwrap_or_default();
    format!("sig:{title}|{domain}|{bucket}")
}

fn explicit_key(record: &CanonicalRecord) -> Option<String> {
    let iso2 = record
        .iso2
        .as_deref()
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_ascii_lowercase);
    match (record.record_kind, iso2) {
        (RecordKind::Country, Some(code)) => return Some(format!("iso2:{code}")),
        (RecordKind::CountryProfile, Some(code)) => {
            return Some(format!("profile:{code}|{}", record.category().as_str()))
        }
        _ => {}
    }
    record
        .source_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| format!("url:{}", url.to_lowercase()))
}

/// Host of a URL-shaped source (without a leading `www.`), otherwise the
/// trimmed, lower-cased source itself. Scheme-less `host/path` forms count
/// as URL-shaped.
pub fn source_domain(source: &str) -> String {
    let trimmed = source.trim();
    let host = url_host(trimmed).or_else(|| {
        looks_like_host_path(trimmed)
            .then(|| url_host(&format!("https://{trimmed}")))
            .flatten()
    });
    match host {
        Some(host) => host.strip_prefix("www.").unwrap_or(&host).to_string(),
        None => trimmed.to_lowercase(),
    }
}

fn url_host(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .map(str::to_ascii_lowercase)
}

/// `reuters.com`, `www.bbc.co.uk/news`, `example.org:8080/x`: a dotted host
/// with an alphabetic top-level label, optionally followed by a path.
fn looks_like_host_path(raw: &str) -> bool {
    let authority = raw.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.split(':').next().unwrap_or_default();
    let Some((_, tld)) = host.rsplit_once('.') else {
        return false;
    };
    !host.starts_with('.')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        && tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic())
        && !raw.chars().any(char::is_whitespace)
}

/// Calendar day in UTC, `YYYY-MM-DD`.
pub fn date_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}
