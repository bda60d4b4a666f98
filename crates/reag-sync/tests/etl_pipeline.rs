use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reag_adapters::{
    adapter_for_source, load_payload_file, AdapterContext, AdapterKind, AdapterSettings, EntryResult,
    ExtractionError, FetchedPayload, PayloadKind, SourceAdapter,
};
use reag_core::{CanonicalProperty, DedupMetricSample, MarketTrendPoint, NormalizedAddress, RawRecord};
use reag_storage::{
    ArtifactStore, CommitSummary, HttpClientConfig, HttpFetcher, LoadBatch, MemoryStore, MetricsStore,
    PropertyStore, StoreError,
};
use reag_sync::{
    AlertPolicy, AlertSink, DedupAlert, DedupThresholds, EtlError, EtlServices, LoadError, NoopAlertSink,
    SourceConfig, SourceEtl, SourceRegistry, SyncConfig, SyncPipeline,
};
use uuid::Uuid;

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

/// Serves payloads from `<root>/<kind>/` and parses them with the real adapter.
struct FixtureAdapter {
    root: PathBuf,
    inner: Box<dyn SourceAdapter>,
    requests: AtomicUsize,
}

impl FixtureAdapter {
    fn new(kind: AdapterKind, root: PathBuf) -> Self {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let settings = AdapterSettings {
            source_id: kind.as_str().to_string(),
            kind,
            base_url: "https://upstream.invalid".into(),
            api_key: Some("test".into()),
        };
        Self {
            root,
            inner: adapter_for_source(&settings, http).unwrap(),
            requests: AtomicUsize::new(0),
        }
    }

    fn load(&self, file: String, kind: PayloadKind) -> Result<FetchedPayload, ExtractionError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let path = self.root.join(self.inner.kind().as_str()).join(&file);
        load_payload_file(&path, self.source_id(), kind).map_err(|err| ExtractionError::Connection {
            source_id: self.source_id().to_string(),
            url: path.display().to_string(),
            message: format!("{err:#}"),
        })
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    fn kind(&self) -> AdapterKind {
        self.inner.kind()
    }

    async fn search(
        &self,
        _ctx: &AdapterContext,
        location: &str,
        page: u32,
    ) -> Result<FetchedPayload, ExtractionError> {
        self.load(
            format!("search_{location}_p{page}.json"),
            PayloadKind::Search {
                location: location.to_string(),
                page,
            },
        )
    }

    async fn fetch_property(
        &self,
        _ctx: &AdapterContext,
        external_id: &str,
    ) -> Result<FetchedPayload, ExtractionError> {
        self.load(
            format!("property_{external_id}.json"),
            PayloadKind::Property {
                external_id: external_id.to_string(),
            },
        )
    }

    async fn fetch_market_data(
        &self,
        _ctx: &AdapterContext,
        resource_id: &str,
        _beds: Option<u32>,
        _property_types: &[String],
    ) -> Result<FetchedPayload, ExtractionError> {
        self.load(
            format!("market_{resource_id}.json"),
            PayloadKind::MarketData {
                resource_id: resource_id.to_string(),
            },
        )
    }

    fn parse_search(&self, payload: &FetchedPayload) -> Vec<EntryResult<RawRecord>> {
        self.inner.parse_search(payload)
    }

    fn parse_property(&self, payload: &FetchedPayload) -> EntryResult<RawRecord> {
        self.inner.parse_property(payload)
    }

    fn parse_market_data(&self, payload: &FetchedPayload) -> Vec<EntryResult<MarketTrendPoint>> {
        self.inner.parse_market_data(payload)
    }
}

#[derive(Default)]
struct RecordingSink {
    alerts: Mutex<Vec<DedupAlert>>,
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn send(&self, alert: &DedupAlert) -> anyhow::Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Property store whose commits always fail.
struct BrokenStore(MemoryStore);

#[async_trait]
impl PropertyStore for BrokenStore {
    async fn commit_batch(&self, _batch: &LoadBatch) -> Result<CommitSummary, StoreError> {
        Err(StoreError::EmptyKey)
    }

    async fn get(&self, property_key: &str) -> Result<Option<CanonicalProperty>, StoreError> {
        self.0.get(property_key).await
    }

    async fn find_nearby(
        &self,
        address: &NormalizedAddress,
        limit: usize,
    ) -> Result<Vec<CanonicalProperty>, StoreError> {
        self.0.find_nearby(address, limit).await
    }

    async fn list(&self, source_id: Option<&str>, limit: usize) -> Result<Vec<CanonicalProperty>, StoreError> {
        self.0.list(source_id, limit).await
    }

    async fn find_by_provenance(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<CanonicalProperty>, StoreError> {
        self.0.find_by_provenance(source_id, external_id).await
    }

    async fn mark_stale(&self, property_key: &str, at: chrono::DateTime<Utc>) -> Result<bool, StoreError> {
        self.0.mark_stale(property_key, at).await
    }

    async fn market_trends(
        &self,
        source_id: &str,
        resource_id: &str,
    ) -> Result<Vec<MarketTrendPoint>, StoreError> {
        self.0.market_trends(source_id, resource_id).await
    }
}

fn zillow_source(extra: &str) -> SourceConfig {
    let yaml = format!(
        "sources:\n  - source_id: zillow\n    kind: zillow\n    base_url: https://upstream.invalid\n    locations: [\"seattle\"]\n    resource_ids: [\"98101\"]\n{extra}"
    );
    SourceRegistry::from_yaml(&yaml).unwrap().sources.remove(0)
}

fn mls_source() -> SourceConfig {
    let yaml = "sources:\n  - source_id: mls\n    kind: mls\n    base_url: https://upstream.invalid\n    locations: [\"seattle\"]\n    pages: 1\n";
    SourceRegistry::from_yaml(yaml).unwrap().sources.remove(0)
}

async fn main_street_records(store: &MemoryStore) -> Vec<CanonicalProperty> {
    store
        .list(None, 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.normalized.street == "123 main street")
        .collect()
}

struct Harness {
    store: Arc<MemoryStore>,
    sink: Arc<RecordingSink>,
    services: EtlServices,
    _artifacts: tempfile::TempDir,
}

fn harness(policy: AlertPolicy) -> Harness {
    let artifacts = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::default());
    let services = EtlServices {
        store: store.clone(),
        metrics: store.clone(),
        artifacts: ArtifactStore::new(artifacts.path()),
        alert_policy: Arc::new(policy),
        alert_sink: sink.clone(),
        load_lock: Arc::new(tokio::sync::Mutex::new(())),
    };
    Harness {
        store,
        sink,
        services,
        _artifacts: artifacts,
    }
}

fn etl(source: SourceConfig, adapter: Arc<FixtureAdapter>, services: EtlServices) -> SourceEtl {
    SourceEtl::new(source, adapter, services, DedupThresholds::default(), Uuid::new_v4())
}

#[tokio::test]
async fn zillow_fixtures_run_end_to_end() {
    let h = harness(AlertPolicy::default());
    let adapter = Arc::new(FixtureAdapter::new(AdapterKind::Zillow, fixtures_root()));
    let report = etl(zillow_source(""), adapter, h.services.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(report.payloads, 2);
    // two bad search entries plus one unparseable market period
    assert_eq!(report.skipped_records, 3);
    assert_eq!(report.load.inserted, 2);
    assert_eq!(report.load.trends_upserted, 3);

    let sample = report.load.sample.unwrap();
    assert_eq!(sample.input_count, 3);
    assert_eq!(sample.strict_count, 2);
    assert_eq!(sample.fuzzy_count, 2);
    assert!(report.load.alert.is_none());

    // "123 Main St" and "123 Main Street" collapse into one property
    let merged = h.store.find_by_provenance("zillow", "48749426").await.unwrap().unwrap();
    assert!(merged.source_provenance.contains("zillow", "48749425"));
    assert_eq!(h.store.property_count().await, 2);
    assert_eq!(h.store.market_trends("zillow", "98101").await.unwrap().len(), 3);
    assert_eq!(h.store.get_recent_samples("zillow", 5).await.unwrap().len(), 1);
}

#[tokio::test]
async fn rerun_updates_instead_of_duplicating() {
    let h = harness(AlertPolicy::default());
    let adapter = Arc::new(FixtureAdapter::new(AdapterKind::Zillow, fixtures_root()));
    let first = etl(zillow_source(""), adapter.clone(), h.services.clone()).run().await.unwrap();
    let second = etl(zillow_source(""), adapter, h.services.clone()).run().await.unwrap();

    assert_eq!(first.load.inserted, 2);
    assert_eq!(second.load.inserted, 0);
    assert_eq!(second.load.updated, 2);
    assert_eq!(h.store.property_count().await, 2);
    assert_eq!(h.store.get_recent_samples("zillow", 5).await.unwrap().len(), 2);
}

#[tokio::test]
async fn same_house_from_two_sources_reconciles_into_one_record() {
    let h = harness(AlertPolicy::default());
    let zillow = Arc::new(FixtureAdapter::new(AdapterKind::Zillow, fixtures_root()));
    let mls = Arc::new(FixtureAdapter::new(AdapterKind::Mls, fixtures_root()));

    etl(zillow_source(""), zillow, h.services.clone()).run().await.unwrap();
    let report = etl(mls_source(), mls, h.services.clone()).run().await.unwrap();
    assert_eq!(report.load.matched_stored, 1);
    assert!(report.load.updated >= 1);

    let records = main_street_records(&h.store).await;
    assert_eq!(records.len(), 1, "{records:?}");
    let house = &records[0];
    assert_eq!(house.property_key, "zillow:48749425");
    assert!(house.source_provenance.contains("zillow", "48749425"));
    assert!(house.source_provenance.contains("zillow", "48749426"));
    assert!(house.source_provenance.contains("mls", "NWM2101234"));
    assert_eq!(house.source_provenance.sources().collect::<Vec<_>>(), vec!["mls", "zillow"]);
    assert_eq!(house.attributes.price, Some(719_000.0));

    let via_mls = h.store.find_by_provenance("mls", "NWM2101234").await.unwrap().unwrap();
    assert_eq!(via_mls.property_key, "zillow:48749425");
    assert!(h.store.get("mls:NWM2101234").await.unwrap().is_none());
}

#[tokio::test]
async fn misconfigured_source_fails_before_any_request() {
    let h = harness(AlertPolicy::default());
    let adapter = Arc::new(FixtureAdapter::new(AdapterKind::Zillow, fixtures_root()));
    let mut source = zillow_source("");
    source.locations.clear();
    source.resource_ids.clear();

    let err = etl(source, adapter.clone(), h.services.clone()).run().await.unwrap_err();
    assert!(matches!(err, EtlError::Configuration(_)));
    assert_eq!(adapter.requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_detail_fetch_aborts_the_source() {
    let h = harness(AlertPolicy::default());
    let adapter = Arc::new(FixtureAdapter::new(AdapterKind::Zillow, fixtures_root()));
    // only property_48749511.json exists, the first detail fetch fails
    let source = zillow_source("    hydrate_details: true\n");

    let err = etl(source, adapter, h.services.clone()).run().await.unwrap_err();
    match err {
        EtlError::Extraction(ExtractionError::Connection { source_id, url, .. }) => {
            assert_eq!(source_id, "zillow");
            assert!(url.ends_with("property_48749425.json"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.store.property_count().await, 0);
}

#[tokio::test]
async fn batch_with_no_parseable_entry_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("zillow");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("search_seattle_p1.json"),
        r#"{"results":[{"address":"1 A St, Seattle, WA"},{"price":1}]}"#,
    )
    .unwrap();

    let h = harness(AlertPolicy::default());
    let adapter = Arc::new(FixtureAdapter::new(AdapterKind::Zillow, root.path().to_path_buf()));
    let mut source = zillow_source("");
    source.resource_ids.clear();

    let err = etl(source, adapter, h.services.clone()).run().await.unwrap_err();
    assert!(matches!(err, EtlError::BatchUnusable { entries: 2, .. }));
    assert!(h.store.get_recent_samples("zillow", 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_commit_records_no_metrics() {
    let h = harness(AlertPolicy::default());
    let broken = Arc::new(BrokenStore(MemoryStore::new()));
    let services = EtlServices {
        store: broken.clone(),
        ..h.services.clone()
    };
    let adapter = Arc::new(FixtureAdapter::new(AdapterKind::Zillow, fixtures_root()));

    let err = etl(zillow_source(""), adapter, services).run().await.unwrap_err();
    assert!(matches!(
        err,
        EtlError::Load(LoadError::Commit { properties: 2, trends: 3, .. })
    ));
    assert!(h.store.get_recent_samples("zillow", 5).await.unwrap().is_empty());
    assert!(broken.list(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn low_dedup_history_raises_alert() {
    let h = harness(AlertPolicy::default().with_min_rate("zillow", 0.95));
    for hours_ago in (1..=4).rev() {
        h.store
            .append_sample(&DedupMetricSample {
                timestamp: Utc::now() - Duration::hours(hours_ago),
                source_id: "zillow".into(),
                input_count: 100,
                strict_count: 100,
                fuzzy_count: 80,
                threshold: 95,
            })
            .await
            .unwrap();
    }
    let adapter = Arc::new(FixtureAdapter::new(AdapterKind::Zillow, fixtures_root()));

    let report = etl(zillow_source(""), adapter, h.services.clone()).run().await.unwrap();
    let alert = report.load.alert.unwrap();
    assert_eq!(alert.offending.len(), 4);
    assert_eq!(h.sink.alerts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn pipeline_writes_reports_and_snapshots() {
    let workspace = tempfile::tempdir().unwrap();
    let root = workspace.path().display().to_string();
    let config = SyncConfig::from_lookup(move |key: &str| match key {
        "REAG_WORKSPACE_ROOT" => Some(root.clone()),
        _ => None,
    })
    .unwrap();
    let registry = SourceRegistry::from_yaml("sources: []").unwrap();
    let store = Arc::new(MemoryStore::new());
    let pipeline = SyncPipeline::new(config, registry, store.clone(), store.clone())
        .unwrap()
        .with_alert_sink(Arc::new(NoopAlertSink));

    let zillow: Arc<dyn SourceAdapter> = Arc::new(FixtureAdapter::new(AdapterKind::Zillow, fixtures_root()));
    let mut broken = zillow_source("");
    broken.source_id = "zillow-broken".into();
    broken.locations.clear();
    broken.resource_ids.clear();

    let summary = pipeline
        .run_with_adapters(vec![(zillow_source(""), zillow.clone()), (broken, zillow)])
        .await
        .unwrap();

    assert_eq!(summary.enabled_sources, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.sources[0].source_id, "zillow");
    assert_eq!(summary.sources[0].fuzzy_count, 2);
    assert!(summary.sources[1].error.is_some());

    let run_dir = workspace.path().join("reports").join(summary.run_id.to_string());
    assert!(run_dir.join("run_summary.json").is_file());
    let brief = std::fs::read_to_string(run_dir.join("daily_brief.md")).unwrap();
    assert!(brief.contains("zillow-broken: FAILED"));
    assert!(run_dir.join("snapshots/properties.parquet").is_file());
    assert!(run_dir.join("snapshots/manifest.json").is_file());

    let digest = reag_sync::reports::report_daily_markdown(3, &workspace.path().join("reports")).unwrap();
    assert!(digest.contains(&summary.run_id.to_string()));
    assert!(digest.contains("listings: 3 -> properties: 2"));
}

#[tokio::test]
async fn concurrent_sources_keep_one_record_per_house() {
    let workspace = tempfile::tempdir().unwrap();
    let root = workspace.path().display().to_string();
    let config = SyncConfig::from_lookup(move |key: &str| match key {
        "REAG_WORKSPACE_ROOT" => Some(root.clone()),
        _ => None,
    })
    .unwrap();
    let registry = SourceRegistry::from_yaml("sources: []").unwrap();
    let store = Arc::new(MemoryStore::new());
    let pipeline = SyncPipeline::new(config, registry, store.clone(), store.clone())
        .unwrap()
        .with_alert_sink(Arc::new(NoopAlertSink));

    let zillow: Arc<dyn SourceAdapter> = Arc::new(FixtureAdapter::new(AdapterKind::Zillow, fixtures_root()));
    let mls: Arc<dyn SourceAdapter> = Arc::new(FixtureAdapter::new(AdapterKind::Mls, fixtures_root()));
    let summary = pipeline
        .run_with_adapters(vec![(zillow_source(""), zillow), (mls_source(), mls)])
        .await
        .unwrap();
    assert_eq!(summary.failed, 0);

    let records = main_street_records(&store).await;
    assert_eq!(records.len(), 1, "{records:?}");
    assert_eq!(records[0].source_provenance.sources().count(), 2);
}
