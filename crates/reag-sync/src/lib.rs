//! Sync pipeline orchestration: per-source ETL, fuzzy dedup, alerting,
//! run reports and scheduling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reag_adapters::{adapter_for_source, SourceAdapter};
use reag_storage::{
    ArtifactStore, HttpClientConfig, HttpFetcher, MetricsStore, PgStore, PropertyStore, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod alerting;
pub mod config;
pub mod dedup;
pub mod etl;
pub mod reports;

pub use alerting::{AlertPolicy, AlertSink, DedupAlert, LogAlertSink, NoopAlertSink, WebhookAlertSink};
pub use config::{SourceConfig, SourceRegistry, SyncConfig};
pub use dedup::{
    deduplicate, reduce_group, DedupEngine, DedupThresholds, LevenshteinRatio, SimilarityGroup,
    SimilarityScorer, Threshold, TokenSortRatio,
};
pub use etl::{EtlError, EtlServices, ExtractedBatch, LoadError, LoadSummary, SourceEtl, SourceRunReport, TransformedBatch};

pub const CRATE_NAME: &str = "reag-sync";

/// Properties included in a run's Parquet snapshot.
const SNAPSHOT_LIMIT: usize = 100_000;

/// How one source fared in a run; failures are recorded, not propagated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub error: Option<String>,
    pub payloads: usize,
    pub input_count: usize,
    pub strict_count: usize,
    pub fuzzy_count: usize,
    pub skipped_records: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Properties routed to an existing record by address similarity.
    #[serde(default)]
    pub matched_stored: usize,
    pub trends_upserted: usize,
    pub alert: Option<String>,
}

impl SourceOutcome {
    fn failed(source_id: &str, error: impl std::fmt::Display) -> Self {
        Self {
            source_id: source_id.to_string(),
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    fn from_report(report: &SourceRunReport) -> Self {
        let sample = report.load.sample.as_ref();
        Self {
            source_id: report.source_id.clone(),
            error: None,
            payloads: report.payloads,
            input_count: sample.map_or(0, |s| s.input_count),
            strict_count: sample.map_or(0, |s| s.strict_count),
            fuzzy_count: sample.map_or(0, |s| s.fuzzy_count),
            skipped_records: report.skipped_records,
            inserted: report.load.inserted,
            updated: report.load.updated,
            matched_stored: report.load.matched_stored,
            trends_upserted: report.load.trends_upserted,
            alert: report.load.alert.as_ref().map(DedupAlert::summary),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub sources: Vec<SourceOutcome>,
    pub reports_dir: String,
    pub parquet_manifest: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    http: Arc<HttpFetcher>,
    services: EtlServices,
}

impl SyncPipeline {
    /// One HTTP client is built here and shared by every adapter.
    pub fn new(
        config: SyncConfig,
        registry: SourceRegistry,
        store: Arc<dyn PropertyStore>,
        metrics: Arc<dyn MetricsStore>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let alert_sink: Arc<dyn AlertSink> = match &config.alert_webhook_url {
            Some(url) => Arc::new(WebhookAlertSink::new(url.clone())),
            None => Arc::new(LogAlertSink),
        };
        let services = EtlServices {
            store,
            metrics,
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
            alert_policy: Arc::new(registry.alert_policy()),
            alert_sink,
            load_lock: Arc::new(tokio::sync::Mutex::new(())),
        };
        Ok(Self {
            config,
            registry,
            http: Arc::new(http),
            services,
        })
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.services.alert_sink = sink;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn services(&self) -> &EtlServices {
        &self.services
    }

    /// Run every enabled source from the registry.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let mut jobs: Vec<(SourceConfig, Arc<dyn SourceAdapter>)> = Vec::new();
        let mut failures = Vec::new();
        for source in self.registry.enabled() {
            if let Some(config) = source.requests_per_second.and_then(TokenBucketConfig::per_second) {
                self.http.set_rate_limit(&source.source_id, config).await;
            }
            match adapter_for_source(&source.adapter_settings(), Arc::clone(&self.http)) {
                Ok(adapter) => jobs.push((source.clone(), Arc::from(adapter))),
                Err(err) => {
                    warn!(source_id = %source.source_id, error = %err, "source not runnable");
                    failures.push(SourceOutcome::failed(&source.source_id, err));
                }
            }
        }
        self.run_sources(jobs, failures).await
    }

    /// Run the given sources with caller-supplied adapters.
    pub async fn run_with_adapters(
        &self,
        jobs: Vec<(SourceConfig, Arc<dyn SourceAdapter>)>,
    ) -> Result<SyncRunSummary> {
        self.run_sources(jobs, Vec::new()).await
    }

    async fn run_sources(
        &self,
        jobs: Vec<(SourceConfig, Arc<dyn SourceAdapter>)>,
        mut outcomes: Vec<SourceOutcome>,
    ) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let enabled_sources = jobs.len() + outcomes.len();
        info!(%run_id, sources = enabled_sources, "sync run starting");

        let etls = jobs
            .into_iter()
            .map(|(source, adapter)| {
                SourceEtl::new(source, adapter, self.services.clone(), self.config.thresholds, run_id)
            })
            .collect::<Vec<_>>();
        let results = join_all(etls.iter().map(|etl| etl.run())).await;

        let mut samples = Vec::new();
        for (etl, result) in etls.iter().zip(results) {
            match result {
                Ok(report) => {
                    samples.extend(report.load.sample.clone());
                    outcomes.push(SourceOutcome::from_report(&report));
                }
                Err(err) => {
                    error!(%run_id, source_id = %etl.source_id(), error = %err, "source run failed");
                    outcomes.push(SourceOutcome::failed(etl.source_id(), err));
                }
            }
        }
        outcomes.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        let reports_dir = self.config.reports_root().join(run_id.to_string());
        let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            enabled_sources,
            succeeded,
            failed: outcomes.len() - succeeded,
            sources: outcomes,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: None,
        };

        let properties = self
            .services
            .store
            .list(None, SNAPSHOT_LIMIT)
            .await
            .context("listing properties for snapshot")?;
        let manifest = reports::export_parquet_snapshots(&reports_dir, &properties, &samples).await?;
        summary.parquet_manifest = Some(manifest.display().to_string());
        reports::write_run_reports(&reports_dir, &summary).await?;

        info!(
            %run_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "sync run finished"
        );
        Ok(summary)
    }
}

/// Two cron jobs that each run the whole pipeline, when enabled.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&pipeline.config.sync_cron_1, &pipeline.config.sync_cron_2] {
        let pipeline = Arc::clone(&pipeline);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, failed = summary.failed, "scheduled sync finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

/// Connect to Postgres, apply migrations and run every enabled source once.
pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let registry = SourceRegistry::load(config.sources_path()).await?;
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    let store = Arc::new(store);
    let pipeline = SyncPipeline::new(config, registry, store.clone(), store)?;
    pipeline.run_once().await
}
