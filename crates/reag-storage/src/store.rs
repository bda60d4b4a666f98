//! Persistence boundary: upsert-by-key canonical properties and an
//! append-only dedup metric history.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reag_core::{CanonicalProperty, DedupMetricSample, MarketTrendPoint, NormalizedAddress};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("canonical property has an empty property_key")]
    EmptyKey,
    #[error("canonical property {0} has no provenance")]
    MissingProvenance(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{column} value {value} is out of range")]
    OutOfRange { column: &'static str, value: String },
    #[error("property {0} disappeared during upsert")]
    Vanished(String),
}

/// Everything one source run persists; committed atomically.
#[derive(Debug, Clone, Default)]
pub struct LoadBatch {
    pub properties: Vec<CanonicalProperty>,
    pub trends: Vec<MarketTrendPoint>,
}

impl LoadBatch {
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.trends.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub trends_upserted: usize,
}

pub(crate) fn validate(property: &CanonicalProperty) -> Result<(), StoreError> {
    if property.property_key.trim().is_empty() {
        return Err(StoreError::EmptyKey);
    }
    if property.source_provenance.is_empty() {
        return Err(StoreError::MissingProvenance(property.property_key.clone()));
    }
    Ok(())
}

/// Inventory as the `INTEGER` column holds it.
pub(crate) fn inventory_column(point: &MarketTrendPoint) -> Result<Option<i32>, StoreError> {
    point
        .inventory
        .map(|v| {
            i32::try_from(v).map_err(|_| StoreError::OutOfRange {
                column: "market_trends.inventory",
                value: v.to_string(),
            })
        })
        .transpose()
}

/// Where to look for stored properties that may be the same as a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Locality<'a> {
    Zip(&'a str),
    CityState { city: &'a str, state: &'a str },
}

impl<'a> Locality<'a> {
    /// `None` when the address has no street or nothing to narrow by.
    pub(crate) fn of(address: &'a NormalizedAddress) -> Option<Self> {
        if address.street.is_empty() {
            return None;
        }
        if !address.zip.is_empty() {
            return Some(Self::Zip(&address.zip));
        }
        if address.city.is_empty() {
            return None;
        }
        Some(Self::CityState {
            city: &address.city,
            state: &address.state,
        })
    }

    fn contains(&self, address: &NormalizedAddress) -> bool {
        match *self {
            Self::Zip(zip) => address.zip == zip,
            Self::CityState { city, state } => address.city == city && address.state == state,
        }
    }
}

/// Fold every stored record a candidate resolved to into the oldest one,
/// then fold in the candidate itself. The others come back retired.
pub(crate) fn fold_matches(
    mut matches: Vec<CanonicalProperty>,
    candidate: &CanonicalProperty,
) -> Option<(CanonicalProperty, Vec<CanonicalProperty>)> {
    matches.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.property_key.cmp(&b.property_key))
    });
    let mut matches = matches.into_iter();
    let mut survivor = matches.next()?;
    let mut retired = Vec::new();
    for mut other in matches {
        survivor.absorb(&other);
        other.retire_into(&survivor.property_key, candidate.updated_at);
        retired.push(other);
    }
    survivor.absorb(candidate);
    Some((survivor, retired))
}

#[async_trait]
pub trait PropertyStore: Send + Sync {
    /// Upsert every property and trend point in one transaction.
    ///
    /// A candidate is matched against stored records by its key and by each
    /// of its provenance pairs. With no match it is inserted under its own
    /// key. Otherwise every matched record is folded into the oldest one
    /// (see [`CanonicalProperty::absorb`]), the rest are retired as stale
    /// pointers to it, and the candidate is folded in last. Any failure
    /// leaves the store untouched.
    async fn commit_batch(&self, batch: &LoadBatch) -> Result<CommitSummary, StoreError>;

    /// Retired records are returned too; check `merged_into`.
    async fn get(&self, property_key: &str) -> Result<Option<CanonicalProperty>, StoreError>;

    /// Live properties in the same ZIP as `address`, or the same city and
    /// state when it has no ZIP. Empty when the address has no street.
    async fn find_nearby(
        &self,
        address: &NormalizedAddress,
        limit: usize,
    ) -> Result<Vec<CanonicalProperty>, StoreError>;

    /// Live properties, most recently updated first.
    async fn list(
        &self,
        source_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CanonicalProperty>, StoreError>;

    async fn find_by_provenance(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<CanonicalProperty>, StoreError>;

    /// Returns `false` when no property has that key.
    async fn mark_stale(&self, property_key: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn market_trends(
        &self,
        source_id: &str,
        resource_id: &str,
    ) -> Result<Vec<MarketTrendPoint>, StoreError>;
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn append_sample(&self, sample: &DedupMetricSample) -> Result<(), StoreError>;

    /// The last `n` samples for a source, oldest first.
    async fn get_recent_samples(
        &self,
        source_id: &str,
        n: usize,
    ) -> Result<Vec<DedupMetricSample>, StoreError>;
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    properties: BTreeMap<String, CanonicalProperty>,
    provenance_index: HashMap<(String, String), String>,
    trends: BTreeMap<(String, String, chrono::NaiveDate), MarketTrendPoint>,
    samples: Vec<DedupMetricSample>,
}

impl MemoryState {
    /// Follow retirement pointers to the record that is still live.
    fn live_key(&self, key: &str) -> Option<String> {
        let mut key = key;
        for _ in 0..=self.properties.len() {
            match &self.properties.get(key)?.merged_into {
                Some(next) => key = next.as_str(),
                None => return Some(key.to_string()),
            }
        }
        None
    }

    fn matching_keys(&self, candidate: &CanonicalProperty) -> Vec<String> {
        let via_provenance = candidate.source_provenance.pairs().filter_map(|(s, e)| {
            self.provenance_index
                .get(&(s.to_string(), e.to_string()))
                .and_then(|key| self.live_key(key))
        });
        let mut keys: Vec<String> = Vec::new();
        for key in self.live_key(&candidate.property_key).into_iter().chain(via_provenance) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    fn upsert(&mut self, candidate: &CanonicalProperty) -> Result<bool, StoreError> {
        validate(candidate)?;
        let matches = self
            .matching_keys(candidate)
            .iter()
            .filter_map(|key| self.properties.get(key).cloned())
            .collect::<Vec<_>>();
        let (survivor, retired, inserted) = match fold_matches(matches, candidate) {
            Some((survivor, retired)) => (survivor, retired, false),
            None => (candidate.clone(), Vec::new(), true),
        };

        for record in retired {
            self.properties.insert(record.property_key.clone(), record);
        }
        for (source_id, external_id) in survivor.source_provenance.pairs() {
            self.provenance_index.insert(
                (source_id.to_string(), external_id.to_string()),
                survivor.property_key.clone(),
            );
        }
        self.properties.insert(survivor.property_key.clone(), survivor);
        Ok(inserted)
    }
}

/// In-process store used by tests and `--memory` runs.
///
/// A batch is applied to a copy of the state and swapped in only when every
/// item succeeded.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn property_count(&self) -> usize {
        self.state.read().await.properties.len()
    }
}

#[async_trait]
impl PropertyStore for MemoryStore {
    async fn commit_batch(&self, batch: &LoadBatch) -> Result<CommitSummary, StoreError> {
        let mut guard = self.state.write().await;
        let mut staged = guard.clone();
        let mut summary = CommitSummary::default();

        for candidate in &batch.properties {
            if staged.upsert(candidate)? {
                summary.inserted += 1;
            } else {
                summary.updated += 1;
            }
        }
        for point in &batch.trends {
            inventory_column(point)?;
            staged.trends.insert(
                (point.source_id.clone(), point.resource_id.clone(), point.period),
                point.clone(),
            );
            summary.trends_upserted += 1;
        }

        *guard = staged;
        Ok(summary)
    }

    async fn get(&self, property_key: &str) -> Result<Option<CanonicalProperty>, StoreError> {
        Ok(self.state.read().await.properties.get(property_key).cloned())
    }

    async fn find_nearby(
        &self,
        address: &NormalizedAddress,
        limit: usize,
    ) -> Result<Vec<CanonicalProperty>, StoreError> {
        let Some(locality) = Locality::of(address) else {
            return Ok(Vec::new());
        };
        let state = self.state.read().await;
        let mut rows = state
            .properties
            .values()
            .filter(|p| !p.is_merged() && locality.contains(&p.normalized))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.property_key.cmp(&b.property_key))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn list(
        &self,
        source_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CanonicalProperty>, StoreError> {
        let state = self.state.read().await;
        let mut rows = state
            .properties
            .values()
            .filter(|p| !p.is_merged())
            .filter(|p| source_id.map_or(true, |s| p.source_provenance.sources().any(|src| src == s)))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.property_key.cmp(&b.property_key))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn find_by_provenance(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<CanonicalProperty>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .provenance_index
            .get(&(source_id.to_string(), external_id.to_string()))
            .and_then(|key| state.properties.get(key))
            .cloned())
    }

    async fn mark_stale(&self, property_key: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.properties.get_mut(property_key) {
            Some(property) => {
                property.stale_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn market_trends(
        &self,
        source_id: &str,
        resource_id: &str,
    ) -> Result<Vec<MarketTrendPoint>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .trends
            .values()
            .filter(|p| p.source_id == source_id && p.resource_id == resource_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn append_sample(&self, sample: &DedupMetricSample) -> Result<(), StoreError> {
        self.state.write().await.samples.push(sample.clone());
        Ok(())
    }

    async fn get_recent_samples(
        &self,
        source_id: &str,
        n: usize,
    ) -> Result<Vec<DedupMetricSample>, StoreError> {
        let state = self.state.read().await;
        let mut recent = state
            .samples
            .iter()
            .filter(|s| s.source_id == source_id)
            .collect::<Vec<_>>();
        recent.sort_by_key(|s| s.timestamp);
        let skip = recent.len().saturating_sub(n);
        Ok(recent.into_iter().skip(skip).cloned().collect())
    }
}
