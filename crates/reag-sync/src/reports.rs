//! Run reports and Parquet snapshots written under `reports/<run_id>/`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, Int32Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use reag_core::{CanonicalProperty, DedupMetricSample};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::SyncRunSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

pub async fn write_run_reports(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    fs::write(reports_dir.join("daily_brief.md"), daily_brief(summary))
        .await
        .context("writing daily_brief.md")?;
    Ok(())
}

fn daily_brief(summary: &SyncRunSummary) -> String {
    let mut lines = vec![
        "# REAG Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- Sources: {} enabled, {} succeeded, {} failed",
            summary.enabled_sources, summary.succeeded, summary.failed
        ),
        String::new(),
        "## Sources".to_string(),
    ];
    for outcome in &summary.sources {
        match &outcome.error {
            None => lines.push(format!(
                "- {}: {} listings -> {} properties (strict {}), {} new, {} updated, {} trend points, {} skipped{}",
                outcome.source_id,
                outcome.input_count,
                outcome.fuzzy_count,
                outcome.strict_count,
                outcome.inserted,
                outcome.updated,
                outcome.trends_upserted,
                outcome.skipped_records,
                if outcome.alert.is_some() { " **ALERT**" } else { "" }
            )),
            Some(error) => lines.push(format!("- {}: FAILED ({error})", outcome.source_id)),
        }
    }
    let alerts = summary
        .sources
        .iter()
        .filter_map(|o| o.alert.as_deref())
        .collect::<Vec<_>>();
    if !alerts.is_empty() {
        lines.push(String::new());
        lines.push("## Alerts".to_string());
        lines.extend(alerts.into_iter().map(|a| format!("- {a}")));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Write `properties.parquet` and `dedup_metrics.parquet` plus a sha256
/// manifest into `<reports_dir>/snapshots`.
pub async fn export_parquet_snapshots(
    reports_dir: &Path,
    properties: &[CanonicalProperty],
    samples: &[DedupMetricSample],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let properties_path = snapshot_dir.join("properties.parquet");
    let metrics_path = snapshot_dir.join("dedup_metrics.parquet");
    write_parquet(&properties_path, properties_batch(properties)?)?;
    write_parquet(&metrics_path, metrics_batch(samples)?)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("properties", reports_dir, &properties_path, properties.len())?,
            manifest_entry("dedup_metrics", reports_dir, &metrics_path, samples.len())?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn properties_batch(properties: &[CanonicalProperty]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("property_key", DataType::Utf8, false),
        ArrowField::new("street", DataType::Utf8, false),
        ArrowField::new("city", DataType::Utf8, false),
        ArrowField::new("state", DataType::Utf8, false),
        ArrowField::new("zip", DataType::Utf8, false),
        ArrowField::new("price", DataType::Float64, true),
        ArrowField::new("beds", DataType::Float64, true),
        ArrowField::new("baths", DataType::Float64, true),
        ArrowField::new("sqft", DataType::Float64, true),
        ArrowField::new("year_built", DataType::Int32, true),
        ArrowField::new("sources", DataType::Utf8, false),
        ArrowField::new("provenance_count", DataType::UInt32, false),
        ArrowField::new("updated_at", DataType::Utf8, false),
        ArrowField::new("stale", DataType::Boolean, false),
    ]));

    let text = |f: fn(&CanonicalProperty) -> String| -> ArrayRef {
        Arc::new(StringArray::from(properties.iter().map(f).collect::<Vec<_>>()))
    };
    let number = |f: fn(&CanonicalProperty) -> Option<f64>| -> ArrayRef {
        Arc::new(Float64Array::from(properties.iter().map(f).collect::<Vec<_>>()))
    };

    let columns: Vec<ArrayRef> = vec![
        text(|p| p.property_key.clone()),
        text(|p| p.normalized.street.clone()),
        text(|p| p.normalized.city.clone()),
        text(|p| p.normalized.state.clone()),
        text(|p| p.normalized.zip.clone()),
        number(|p| p.attributes.price),
        number(|p| p.attributes.beds),
        number(|p| p.attributes.baths),
        number(|p| p.attributes.sqft),
        Arc::new(Int32Array::from(
            properties.iter().map(|p| p.attributes.year_built).collect::<Vec<_>>(),
        )),
        text(|p| p.source_provenance.sources().collect::<Vec<_>>().join(",")),
        Arc::new(UInt32Array::from(
            properties
                .iter()
                .map(|p| p.source_provenance.len() as u32)
                .collect::<Vec<_>>(),
        )),
        text(|p| p.updated_at.to_rfc3339()),
        Arc::new(BooleanArray::from(
            properties.iter().map(|p| p.stale_at.is_some()).collect::<Vec<_>>(),
        )),
    ];

    RecordBatch::try_new(schema, columns).context("building properties record batch")
}

fn metrics_batch(samples: &[DedupMetricSample]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("timestamp", DataType::Utf8, false),
        ArrowField::new("input_count", DataType::UInt64, false),
        ArrowField::new("strict_count", DataType::UInt64, false),
        ArrowField::new("fuzzy_count", DataType::UInt64, false),
        ArrowField::new("threshold", DataType::UInt32, false),
        ArrowField::new("ratio", DataType::Float64, false),
    ]));

    let counts = |f: fn(&DedupMetricSample) -> usize| -> ArrayRef {
        Arc::new(UInt64Array::from(
            samples.iter().map(|s| f(s) as u64).collect::<Vec<_>>(),
        ))
    };

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            samples.iter().map(|s| s.source_id.clone()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            samples.iter().map(|s| s.timestamp.to_rfc3339()).collect::<Vec<_>>(),
        )),
        counts(|s| s.input_count),
        counts(|s| s.strict_count),
        counts(|s| s.fuzzy_count),
        Arc::new(UInt32Array::from(
            samples.iter().map(|s| u32::from(s.threshold)).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            samples.iter().map(DedupMetricSample::ratio).collect::<Vec<_>>(),
        )),
    ];

    RecordBatch::try_new(schema, columns).context("building dedup metrics record batch")
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}

/// Markdown digest of the newest `runs` run summaries under `reports_root`.
pub fn report_daily_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut summaries = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path().join("run_summary.json"))
        .filter(|path| path.is_file())
        .map(|path| {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<SyncRunSummary>(&text)
                .with_context(|| format!("parsing {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# REAG Report Daily".to_string(), String::new()];
    for summary in summaries.iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}` ({})", summary.run_id, summary.started_at));
        lines.push(format!(
            "- sources: {} succeeded, {} failed",
            summary.succeeded, summary.failed
        ));
        let properties: usize = summary.sources.iter().map(|s| s.fuzzy_count).sum();
        let listings: usize = summary.sources.iter().map(|s| s.input_count).sum();
        lines.push(format!("- listings: {listings} -> properties: {properties}"));
        let alerting = summary
            .sources
            .iter()
            .filter(|s| s.alert.is_some())
            .map(|s| s.source_id.as_str())
            .collect::<Vec<_>>();
        if !alerting.is_empty() {
            lines.push(format!("- alerts: {}", alerting.join(", ")));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
