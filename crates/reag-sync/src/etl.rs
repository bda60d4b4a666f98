//! Per-source extract / transform / load.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use reag_adapters::{
    AdapterContext, ExtractionError, FetchedPayload, PayloadKind, SourceAdapter, TransformRecordError,
};
use reag_core::{CanonicalProperty, ConfigurationError, DedupMetricSample, MarketTrendPoint, RawRecord};
use reag_storage::{ArtifactStore, CommitSummary, LoadBatch, MetricsStore, PropertyStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::alerting::{AlertPolicy, AlertSink, DedupAlert};
use crate::config::SourceConfig;
use crate::dedup::{reduce_group, DedupEngine, DedupThresholds};

/// Upper bound on stored properties scored per candidate.
const NEARBY_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{source_id}: committing {properties} properties and {trends} trend points failed, batch rolled back: {source}")]
    Commit {
        source_id: String,
        properties: usize,
        trends: usize,
        source: StoreError,
    },
    #[error("{source_id}: looking up stored properties failed: {source}")]
    Lookup { source_id: String, source: StoreError },
    #[error("{source_id}: recording dedup metrics failed: {source}")]
    Metrics { source_id: String, source: StoreError },
}

#[derive(Debug, Error)]
pub enum EtlError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("{source_id}: all {entries} entries in the batch failed to parse; first error: {first}")]
    BatchUnusable {
        source_id: String,
        entries: usize,
        first: TransformRecordError,
    },
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("{source_id}: archiving raw payload failed: {message}")]
    Artifact { source_id: String, message: String },
}

/// Shared collaborators every source run needs.
#[derive(Clone)]
pub struct EtlServices {
    pub store: Arc<dyn PropertyStore>,
    pub metrics: Arc<dyn MetricsStore>,
    pub artifacts: ArtifactStore,
    pub alert_policy: Arc<AlertPolicy>,
    pub alert_sink: Arc<dyn AlertSink>,
    /// Held from the stored-property lookup through the commit, so two
    /// sources loading the same house cannot both insert it.
    pub load_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone)]
pub struct ExtractedBatch {
    pub source_id: String,
    pub run_id: Uuid,
    pub payloads: Vec<FetchedPayload>,
}

#[derive(Debug, Clone)]
pub struct TransformedBatch {
    pub source_id: String,
    /// Parsed listings, one per external id, in first-seen order.
    pub records: Vec<RawRecord>,
    pub properties: Vec<CanonicalProperty>,
    pub trends: Vec<MarketTrendPoint>,
    pub skipped: Vec<TransformRecordError>,
    pub strict_count: usize,
    pub fuzzy_count: usize,
    pub fuzzy_threshold: u8,
}

impl TransformedBatch {
    pub fn input_count(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub source_id: String,
    pub inserted: usize,
    pub updated: usize,
    /// Properties routed to a stored record by address similarity.
    pub matched_stored: usize,
    pub trends_upserted: usize,
    pub sample: Option<DedupMetricSample>,
    pub alert: Option<DedupAlert>,
}

/// Everything one successful `run` produced.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRunReport {
    pub source_id: String,
    pub payloads: usize,
    pub skipped_records: usize,
    pub load: LoadSummary,
}

pub struct SourceEtl {
    source: SourceConfig,
    adapter: Arc<dyn SourceAdapter>,
    services: EtlServices,
    thresholds: DedupThresholds,
    run_id: Uuid,
}

impl SourceEtl {
    pub fn new(
        source: SourceConfig,
        adapter: Arc<dyn SourceAdapter>,
        services: EtlServices,
        thresholds: DedupThresholds,
        run_id: Uuid,
    ) -> Self {
        Self {
            source,
            adapter,
            services,
            thresholds,
            run_id,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source.source_id
    }

    pub async fn run(&self) -> Result<SourceRunReport, EtlError> {
        let span = info_span!("source_run", run_id = %self.run_id, source_id = %self.source.source_id);
        async {
            let extracted = self.extract().await?;
            let payloads = extracted.payloads.len();
            let transformed = self.transform(&extracted)?;
            let skipped_records = transformed.skipped.len();
            let load = self.load(transformed).await?;
            info!(
                payloads,
                skipped_records,
                inserted = load.inserted,
                updated = load.updated,
                matched_stored = load.matched_stored,
                "source run complete"
            );
            Ok::<_, EtlError>(SourceRunReport {
                source_id: self.source.source_id.clone(),
                payloads,
                skipped_records,
                load,
            })
        }
        .instrument(span)
        .await
    }

    /// Fetch every configured search page, detail record and market series.
    /// Configuration is checked before the first request goes out.
    pub async fn extract(&self) -> Result<ExtractedBatch, EtlError> {
        self.source.validate()?;
        let ctx = AdapterContext { run_id: self.run_id };
        let mut payloads = Vec::new();

        for location in &self.source.locations {
            for page in 1..=self.source.pages {
                let payload = self.adapter.search(&ctx, location, page).await?;
                let payload = self.archive(payload).await?;

                if self.source.hydrate_details {
                    let external_ids = self
                        .adapter
                        .parse_search(&payload)
                        .into_iter()
                        .filter_map(Result::ok)
                        .map(|record| record.external_id)
                        .collect::<Vec<_>>();
                    payloads.push(payload);
                    for external_id in external_ids {
                        let detail = self.adapter.fetch_property(&ctx, &external_id).await?;
                        payloads.push(self.archive(detail).await?);
                    }
                } else {
                    payloads.push(payload);
                }
            }
        }

        for resource_id in &self.source.resource_ids {
            let payload = self
                .adapter
                .fetch_market_data(&ctx, resource_id, self.source.beds, &self.source.property_types)
                .await?;
            payloads.push(self.archive(payload).await?);
        }

        Ok(ExtractedBatch {
            source_id: self.source.source_id.clone(),
            run_id: self.run_id,
            payloads,
        })
    }

    async fn archive(&self, mut payload: FetchedPayload) -> Result<FetchedPayload, EtlError> {
        let stored = self
            .services
            .artifacts
            .store_bytes(payload.fetched_at, &payload.source_id, "json", &payload.body)
            .await
            .map_err(|err| EtlError::Artifact {
                source_id: payload.source_id.clone(),
                message: format!("{err:#}"),
            })?;
        payload.artifact = Some(stored.relative_path_string());
        Ok(payload)
    }

    /// Parse, normalize and group. Bad entries are logged and skipped; the
    /// batch only fails when it had entries and none of them parsed.
    pub fn transform(&self, batch: &ExtractedBatch) -> Result<TransformedBatch, EtlError> {
        let mut records: Vec<RawRecord> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut trends = Vec::new();
        let mut skipped = Vec::new();
        let mut entries = 0usize;

        let mut accept = |record: RawRecord| match positions.get(&record.external_id) {
            Some(&at) => reobserve(&mut records[at], record),
            None => {
                positions.insert(record.external_id.clone(), records.len());
                records.push(record);
            }
        };

        for payload in &batch.payloads {
            match &payload.kind {
                PayloadKind::Search { .. } => {
                    for entry in self.adapter.parse_search(payload) {
                        entries += 1;
                        match entry {
                            Ok(record) => accept(record),
                            Err(err) => skipped.push(err),
                        }
                    }
                }
                PayloadKind::Property { .. } => {
                    entries += 1;
                    match self.adapter.parse_property(payload) {
                        Ok(record) => accept(record),
                        Err(err) => skipped.push(err),
                    }
                }
                PayloadKind::MarketData { .. } => {
                    for entry in self.adapter.parse_market_data(payload) {
                        entries += 1;
                        match entry {
                            Ok(point) => trends.push(point),
                            Err(err) => skipped.push(err),
                        }
                    }
                }
            }
        }

        for err in &skipped {
            warn!(source_id = %batch.source_id, error = %err, "skipping unparseable entry");
        }

        if entries > 0 && skipped.len() == entries {
            return Err(EtlError::BatchUnusable {
                source_id: batch.source_id.clone(),
                entries,
                first: skipped.swap_remove(0),
            });
        }

        let strict_count = DedupEngine::new(self.thresholds.strict)
            .group(&records, |r| Some(&r.address))
            .len();
        let properties = DedupEngine::new(self.thresholds.fuzzy)
            .group(&records, |r| Some(&r.address))
            .iter()
            .map(reduce_group)
            .collect::<Vec<_>>();

        Ok(TransformedBatch {
            source_id: batch.source_id.clone(),
            fuzzy_count: properties.len(),
            records,
            properties,
            trends,
            skipped,
            strict_count,
            fuzzy_threshold: self.thresholds.fuzzy.value(),
        })
    }

    /// Match against stored properties, commit the batch atomically, then
    /// record its dedup sample and check the alert policy.
    pub async fn load(&self, batch: TransformedBatch) -> Result<LoadSummary, EtlError> {
        let source_id = batch.source_id.clone();
        let input_count = batch.input_count();
        let mut load_batch = LoadBatch {
            properties: batch.properties,
            trends: batch.trends,
        };

        let (commit, matched_stored) = if load_batch.is_empty() {
            (CommitSummary::default(), 0)
        } else {
            let _guard = self.services.load_lock.lock().await;
            let matched = self
                .match_stored(&mut load_batch.properties)
                .await
                .map_err(|source| LoadError::Lookup {
                    source_id: source_id.clone(),
                    source,
                })?;
            let commit = self
                .services
                .store
                .commit_batch(&load_batch)
                .await
                .map_err(|source| LoadError::Commit {
                    source_id: source_id.clone(),
                    properties: load_batch.properties.len(),
                    trends: load_batch.trends.len(),
                    source,
                })?;
            (commit, matched)
        };

        let mut summary = LoadSummary {
            source_id: source_id.clone(),
            inserted: commit.inserted,
            updated: commit.updated,
            matched_stored,
            trends_upserted: commit.trends_upserted,
            sample: None,
            alert: None,
        };
        if input_count == 0 {
            return Ok(summary);
        }

        let sample = DedupMetricSample {
            timestamp: Utc::now(),
            source_id: source_id.clone(),
            input_count,
            strict_count: batch.strict_count,
            fuzzy_count: batch.fuzzy_count,
            threshold: batch.fuzzy_threshold,
        };
        if !sample.counts_consistent() {
            warn!(
                source_id = %source_id,
                input_count,
                strict_count = sample.strict_count,
                fuzzy_count = sample.fuzzy_count,
                "fuzzy grouping produced more groups than strict grouping"
            );
        }

        let metrics_err = |source| LoadError::Metrics {
            source_id: source_id.clone(),
            source,
        };
        self.services
            .metrics
            .append_sample(&sample)
            .await
            .map_err(metrics_err)?;
        let recent = self
            .services
            .metrics
            .get_recent_samples(&source_id, self.services.alert_policy.window)
            .await
            .map_err(metrics_err)?;

        let alert = self.services.alert_policy.evaluate(&source_id, &recent);
        if let Some(alert) = &alert {
            if let Err(err) = self.services.alert_sink.send(alert).await {
                warn!(source_id = %source_id, error = %format!("{err:#}"), "alert delivery failed");
            }
        }

        summary.sample = Some(sample);
        summary.alert = alert;
        Ok(summary)
    }

    /// Point each candidate at the stored property whose address scores at
    /// or above the fuzzy threshold, so listings of one house reported by
    /// different sources end up in one record. Ties go to the oldest record.
    /// Returns how many candidates were re-keyed.
    async fn match_stored(&self, properties: &mut [CanonicalProperty]) -> Result<usize, StoreError> {
        let engine = DedupEngine::new(self.thresholds.fuzzy);
        let threshold = engine.threshold().value();
        let mut matched = 0;

        for candidate in properties.iter_mut() {
            let nearby = self
                .services
                .store
                .find_nearby(&candidate.normalized, NEARBY_LIMIT)
                .await?;
            let best = nearby
                .iter()
                .map(|stored| (engine.score(&stored.normalized, &candidate.normalized), stored))
                .filter(|(score, _)| *score >= threshold)
                .max_by(|(score_a, a), (score_b, b)| {
                    score_a
                        .cmp(score_b)
                        .then_with(|| b.created_at.cmp(&a.created_at))
                        .then_with(|| b.property_key.cmp(&a.property_key))
                });
            let Some((score, stored)) = best else {
                continue;
            };
            if stored.property_key != candidate.property_key {
                debug!(
                    candidate = %candidate.property_key,
                    stored = %stored.property_key,
                    score,
                    "matched stored property"
                );
                candidate.property_key = stored.property_key.clone();
                matched += 1;
            }
        }
        Ok(matched)
    }
}

/// The same listing seen twice in one run, e.g. in search results and again
/// as a hydrated detail record.
fn reobserve(existing: &mut RawRecord, newer: RawRecord) {
    existing.attributes.overlay(&newer.attributes);
    if !newer.address.is_empty() {
        existing.address = newer.address;
    }
    existing.fetched_at = existing.fetched_at.max(newer.fetched_at);
    for artifact in &newer.audit_artifacts {
        existing.add_artifact(artifact);
    }
}
