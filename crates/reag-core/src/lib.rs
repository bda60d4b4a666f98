//! Core domain model and provenance types for REAG.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod address;

pub use address::{normalize, NormalizedAddress};

pub const CRATE_NAME: &str = "reag-core";

/// Rejected before any I/O or computation starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("similarity threshold {0} is outside 0..=100")]
    ThresholdOutOfRange(u16),
    #[error("strict threshold {strict} must be >= fuzzy threshold {fuzzy}")]
    ThresholdOrder { strict: u8, fuzzy: u8 },
    #[error("source {source_id} is missing required parameter `{parameter}`")]
    MissingParameter {
        source_id: String,
        parameter: &'static str,
    },
    #[error("unknown adapter kind `{0}`")]
    UnknownAdapter(String),
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Free-text postal address as delivered by an upstream source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressFields {
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub zip: String,
}

impl AddressFields {
    pub fn new(
        street: impl Into<String>,
        city: impl Into<String>,
        state: impl Into<String>,
        zip: impl Into<String>,
    ) -> Self {
        Self {
            street: street.into(),
            city: city.into(),
            state: state.into(),
            zip: zip.into(),
        }
    }

    /// Split a one-line address such as `123 Main St, Seattle, WA 98101`.
    ///
    /// Parts that cannot be identified are left empty.
    pub fn parse_single_line(line: &str) -> Self {
        let parts = line
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>();

        match parts.as_slice() {
            [] => Self::default(),
            [street] => Self {
                street: street.to_string(),
                ..Self::default()
            },
            [street, tail] => {
                let mut tokens = tail.split_whitespace().collect::<Vec<_>>();
                let zip = pop_zip(&mut tokens);
                let state = if tokens.len() > 1 && tokens.last().is_some_and(|t| t.len() == 2) {
                    tokens.pop().unwrap_or_default()
                } else {
                    ""
                };
                Self::new(*street, tokens.join(" "), state, zip)
            }
            [street, city, rest @ ..] => {
                let joined = rest.join(" ");
                let mut tokens = joined.split_whitespace().collect::<Vec<_>>();
                let zip = pop_zip(&mut tokens);
                Self::new(*street, *city, tokens.join(" "), zip)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.street.trim().is_empty()
            && self.city.trim().is_empty()
            && self.state.trim().is_empty()
            && self.zip.trim().is_empty()
    }
}

fn pop_zip<'a>(tokens: &mut Vec<&'a str>) -> &'a str {
    if tokens
        .last()
        .is_some_and(|t| t.starts_with(|c: char| c.is_ascii_digit()))
    {
        tokens.pop().unwrap_or_default()
    } else {
        ""
    }
}

impl From<&NormalizedAddress> for AddressFields {
    fn from(value: &NormalizedAddress) -> Self {
        Self::new(
            value.street.clone(),
            value.city.clone(),
            value.state.clone(),
            value.zip.clone(),
        )
    }
}

/// Typed listing attributes; missing upstream keys stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingAttributes {
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub beds: Option<f64>,
    #[serde(default)]
    pub baths: Option<f64>,
    #[serde(default)]
    pub sqft: Option<f64>,
    #[serde(default)]
    pub year_built: Option<i32>,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub listing_status: Option<String>,
}

impl ListingAttributes {
    /// Copy values from `other` only where `self` has none.
    pub fn fill_missing_from(&mut self, other: &ListingAttributes) {
        fill(&mut self.price, &other.price);
        fill(&mut self.beds, &other.beds);
        fill(&mut self.baths, &other.baths);
        fill(&mut self.sqft, &other.sqft);
        fill(&mut self.year_built, &other.year_built);
        fill(&mut self.property_type, &other.property_type);
        fill(&mut self.listing_status, &other.listing_status);
    }

    /// Last-writer-wins per field: populated fields of `newer` replace ours.
    pub fn overlay(&mut self, newer: &ListingAttributes) {
        replace(&mut self.price, &newer.price);
        replace(&mut self.beds, &newer.beds);
        replace(&mut self.baths, &newer.baths);
        replace(&mut self.sqft, &newer.sqft);
        replace(&mut self.year_built, &newer.year_built);
        replace(&mut self.property_type, &newer.property_type);
        replace(&mut self.listing_status, &newer.listing_status);
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(other);
    }
}

fn replace<T: Clone>(slot: &mut Option<T>, newer: &Option<T>) {
    if newer.is_some() {
        slot.clone_from(newer);
    }
}

/// One listing as returned by a single source fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_id: String,
    pub external_id: String,
    pub address: AddressFields,
    pub attributes: ListingAttributes,
    pub fetched_at: DateTime<Utc>,
    /// Relative paths of every stored raw payload this record was parsed
    /// from, in the order they were seen.
    #[serde(default)]
    pub audit_artifacts: Vec<String>,
}

impl RawRecord {
    pub fn add_artifact(&mut self, artifact: &str) {
        push_unique(&mut self.audit_artifacts, artifact);
    }
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|existing| existing == item) {
        list.push(item.to_string());
    }
}

/// Which upstream identifiers contributed to a canonical record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Provenance(BTreeMap<String, Vec<String>>);

impl Provenance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, source_id: &str, external_id: &str) {
        let ids = self.0.entry(source_id.to_string()).or_default();
        if !ids.iter().any(|id| id == external_id) {
            ids.push(external_id.to_string());
        }
    }

    /// Additive merge; never drops an existing pair.
    pub fn merge(&mut self, other: &Provenance) {
        for (source_id, external_id) in other.pairs() {
            self.add(source_id, external_id);
        }
    }

    pub fn contains(&self, source_id: &str, external_id: &str) -> bool {
        self.0
            .get(source_id)
            .is_some_and(|ids| ids.iter().any(|id| id == external_id))
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(s, ids)| ids.iter().map(move |id| (s.as_str(), id.as_str())))
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// Persisted, deduplicated property entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProperty {
    pub property_key: String,
    pub address: AddressFields,
    pub normalized: NormalizedAddress,
    pub attributes: ListingAttributes,
    pub source_provenance: Provenance,
    #[serde(default)]
    pub audit_artifacts: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub stale_at: Option<DateTime<Utc>>,
    /// Set once this record has been folded into another one.
    #[serde(default)]
    pub merged_into: Option<String>,
}

impl CanonicalProperty {
    pub fn property_key_for(source_id: &str, external_id: &str) -> String {
        format!("{source_id}:{external_id}")
    }

    /// Fold a re-observation of this property into the stored record.
    ///
    /// Attributes are last-writer-wins per field, provenance and audit
    /// artifacts are additive, `created_at` is kept and a stale mark is
    /// cleared.
    pub fn absorb(&mut self, newer: &CanonicalProperty) {
        if !newer.address.is_empty() {
            self.address = newer.address.clone();
            self.normalized = newer.normalized.clone();
        }
        self.attributes.overlay(&newer.attributes);
        self.source_provenance.merge(&newer.source_provenance);
        for artifact in &newer.audit_artifacts {
            push_unique(&mut self.audit_artifacts, artifact);
        }
        self.updated_at = self.updated_at.max(newer.updated_at);
        self.stale_at = None;
    }

    /// Turn this record into a stale pointer at `survivor`, which now owns
    /// its provenance pairs.
    pub fn retire_into(&mut self, survivor: &str, at: DateTime<Utc>) {
        self.source_provenance.clear();
        self.stale_at = Some(at);
        self.merged_into = Some(survivor.to_string());
    }

    pub fn is_merged(&self) -> bool {
        self.merged_into.is_some()
    }
}

/// Market-level aggregate for one upstream resource id and period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTrendPoint {
    pub source_id: String,
    pub resource_id: String,
    pub period: NaiveDate,
    pub median_list_price: Option<f64>,
    pub inventory: Option<u32>,
}

/// One observation of dedup effectiveness for a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupMetricSample {
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub input_count: usize,
    pub strict_count: usize,
    pub fuzzy_count: usize,
    pub threshold: u8,
}

impl DedupMetricSample {
    /// `fuzzy_count / strict_count`, clamped to `[0, 1]`.
    pub fn ratio(&self) -> f64 {
        if self.strict_count == 0 {
            return 1.0;
        }
        (self.fuzzy_count as f64 / self.strict_count as f64).clamp(0.0, 1.0)
    }

    pub fn counts_consistent(&self) -> bool {
        self.fuzzy_count <= self.strict_count && self.strict_count <= self.input_count
    }
}
