//! Source adapter contracts and the Zillow / MLS / county implementations.
//!
//! Adapters own two halves of a source: fetching raw JSON through the shared
//! [`HttpFetcher`], and turning those payloads into typed [`RawRecord`]s and
//! [`MarketTrendPoint`]s. Parsing is per entry so one bad listing never costs
//! the rest of the page.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reag_core::{AddressFields, ConfigurationError, ListingAttributes, MarketTrendPoint, RawRecord};
use reag_storage::{FetchError, FetchRequest, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

mod county;
mod mls;
mod zillow;

pub use county::CountyAdapter;
pub use mls::MlsAdapter;
pub use zillow::ZillowAdapter;

pub const CRATE_NAME: &str = "reag-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Zillow,
    Mls,
    County,
}

impl AdapterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zillow => "zillow",
            Self::Mls => "mls",
            Self::County => "county",
        }
    }
}

impl std::str::FromStr for AdapterKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zillow" => Ok(Self::Zillow),
            "mls" => Ok(Self::Mls),
            "county" => Ok(Self::County),
            other => Err(ConfigurationError::UnknownAdapter(other.to_string())),
        }
    }
}

/// What an adapter call asked the upstream for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadKind {
    Search { location: String, page: u32 },
    Property { external_id: String },
    MarketData { resource_id: String },
}

/// Raw upstream response, kept verbatim until it is parsed and archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPayload {
    pub source_id: String,
    pub kind: PayloadKind,
    pub url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    /// Relative path of the archived copy, once stored.
    pub artifact: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("{source_id}: connection to {url} failed: {message}")]
    Connection {
        source_id: String,
        url: String,
        message: String,
    },
    #[error("{source_id}: rate limited by upstream at {url}")]
    RateLimited { source_id: String, url: String },
    #[error("{source_id}: upstream returned status {status} for {url}")]
    UpstreamStatus {
        source_id: String,
        status: u16,
        url: String,
    },
    #[error("{source_id}: malformed response from {url}: {message}")]
    Malformed {
        source_id: String,
        url: String,
        message: String,
    },
}

impl ExtractionError {
    pub fn source_id(&self) -> &str {
        match self {
            Self::Connection { source_id, .. }
            | Self::RateLimited { source_id, .. }
            | Self::UpstreamStatus { source_id, .. }
            | Self::Malformed { source_id, .. } => source_id,
        }
    }

    pub fn from_fetch(source_id: &str, url: &str, err: FetchError) -> Self {
        if err.is_rate_limited() {
            return Self::RateLimited {
                source_id: source_id.to_string(),
                url: url.to_string(),
            };
        }
        match err {
            FetchError::HttpStatus { status, url } => Self::UpstreamStatus {
                source_id: source_id.to_string(),
                status,
                url,
            },
            FetchError::Request(err) => Self::Connection {
                source_id: source_id.to_string(),
                url: url.to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// One entry of a payload that could not be turned into a typed record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformRecordError {
    #[error("{source_id}: payload from {url} is unusable: {message}")]
    Payload {
        source_id: String,
        url: String,
        message: String,
    },
    #[error("{source_id}: entry {index} is missing `{field}`")]
    MissingField {
        source_id: String,
        index: usize,
        field: &'static str,
    },
    #[error("{source_id}: entry {index} has invalid `{field}`: {message}")]
    InvalidField {
        source_id: String,
        index: usize,
        field: &'static str,
        message: String,
    },
}

pub type EntryResult<T> = Result<T, TransformRecordError>;

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> AdapterKind;

    async fn search(
        &self,
        ctx: &AdapterContext,
        location: &str,
        page: u32,
    ) -> Result<FetchedPayload, ExtractionError>;

    async fn fetch_property(
        &self,
        ctx: &AdapterContext,
        external_id: &str,
    ) -> Result<FetchedPayload, ExtractionError>;

    async fn fetch_market_data(
        &self,
        ctx: &AdapterContext,
        resource_id: &str,
        beds: Option<u32>,
        property_types: &[String],
    ) -> Result<FetchedPayload, ExtractionError>;

    fn parse_search(&self, payload: &FetchedPayload) -> Vec<EntryResult<RawRecord>>;

    fn parse_property(&self, payload: &FetchedPayload) -> EntryResult<RawRecord>;

    fn parse_market_data(&self, payload: &FetchedPayload) -> Vec<EntryResult<MarketTrendPoint>>;
}

/// Connection settings resolved from the source registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSettings {
    pub source_id: String,
    pub kind: AdapterKind,
    pub base_url: String,
    pub api_key: Option<String>,
}

pub fn adapter_for_source(
    settings: &AdapterSettings,
    http: Arc<HttpFetcher>,
) -> Result<Box<dyn SourceAdapter>, ConfigurationError> {
    if settings.base_url.trim().is_empty() {
        return Err(ConfigurationError::MissingParameter {
            source_id: settings.source_id.clone(),
            parameter: "base_url",
        });
    }
    let upstream = Upstream {
        source_id: settings.source_id.clone(),
        base_url: settings.base_url.trim_end_matches('/').to_string(),
        api_key: settings.api_key.clone().filter(|k| !k.trim().is_empty()),
        http,
    };
    match settings.kind {
        AdapterKind::Zillow => Ok(Box::new(ZillowAdapter::new(upstream.require_key()?))),
        AdapterKind::Mls => Ok(Box::new(MlsAdapter::new(upstream.require_key()?))),
        AdapterKind::County => Ok(Box::new(CountyAdapter::new(upstream))),
    }
}

/// Shared plumbing for one configured upstream.
#[derive(Debug, Clone)]
pub(crate) struct Upstream {
    pub(crate) source_id: String,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) http: Arc<HttpFetcher>,
}

impl Upstream {
    fn require_key(self) -> Result<Self, ConfigurationError> {
        if self.api_key.is_none() {
            return Err(ConfigurationError::MissingParameter {
                source_id: self.source_id,
                parameter: "api_key",
            });
        }
        Ok(self)
    }

    pub(crate) fn api_key(&self) -> &str {
        self.api_key.as_deref().unwrap_or_default()
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub(crate) async fn fetch_json(
        &self,
        ctx: &AdapterContext,
        request: FetchRequest,
        kind: PayloadKind,
    ) -> Result<FetchedPayload, ExtractionError> {
        let response = self
            .http
            .fetch_bytes(ctx.run_id, &self.source_id, &request)
            .await
            .map_err(|err| ExtractionError::from_fetch(&self.source_id, &request.url, err))?;

        if let Err(err) = serde_json::from_slice::<JsonValue>(&response.body) {
            return Err(ExtractionError::Malformed {
                source_id: self.source_id.clone(),
                url: response.final_url,
                message: err.to_string(),
            });
        }

        tracing::debug!(
            source_id = %self.source_id,
            url = %response.final_url,
            bytes = response.body.len(),
            "fetched upstream payload"
        );

        Ok(FetchedPayload {
            source_id: self.source_id.clone(),
            kind,
            url: response.final_url,
            body: response.body,
            fetched_at: Utc::now(),
            artifact: None,
        })
    }
}

/// Replay a captured response from disk as if it had just been fetched.
pub fn load_payload_file(
    path: impl AsRef<Path>,
    source_id: &str,
    kind: PayloadKind,
) -> Result<FetchedPayload> {
    let path = path.as_ref();
    let body = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice::<JsonValue>(&body).with_context(|| format!("parsing {}", path.display()))?;
    Ok(FetchedPayload {
        source_id: source_id.to_string(),
        kind,
        url: format!("file://{}", path.display()),
        body,
        fetched_at: Utc::now(),
        artifact: None,
    })
}

// ---- payload helpers shared by the adapters ----

fn payload_error(payload: &FetchedPayload, message: impl Into<String>) -> TransformRecordError {
    TransformRecordError::Payload {
        source_id: payload.source_id.clone(),
        url: payload.url.clone(),
        message: message.into(),
    }
}

pub(crate) fn payload_json(payload: &FetchedPayload) -> EntryResult<JsonValue> {
    serde_json::from_slice(&payload.body).map_err(|err| payload_error(payload, err.to_string()))
}

/// Apply `parse` to every element of the array under `key`.
pub(crate) fn parse_entries<T>(
    payload: &FetchedPayload,
    key: &str,
    parse: impl Fn(&EntryCursor<'_>) -> EntryResult<T>,
) -> Vec<EntryResult<T>> {
    let root = match payload_json(payload) {
        Ok(root) => root,
        Err(err) => return vec![Err(err)],
    };
    let Some(entries) = root.get(key).and_then(JsonValue::as_array) else {
        return vec![Err(payload_error(payload, format!("missing `{key}` array")))];
    };
    entries
        .iter()
        .enumerate()
        .map(|(index, value)| {
            parse(&EntryCursor {
                source_id: &payload.source_id,
                index,
                value,
            })
        })
        .collect()
}

/// A single JSON entry plus the context needed to report problems with it.
pub(crate) struct EntryCursor<'a> {
    pub(crate) source_id: &'a str,
    pub(crate) index: usize,
    pub(crate) value: &'a JsonValue,
}

impl<'a> EntryCursor<'a> {
    pub(crate) fn new(source_id: &'a str, value: &'a JsonValue) -> Self {
        Self {
            source_id,
            index: 0,
            value,
        }
    }

    fn lookup(&self, path: &[&str]) -> Option<&'a JsonValue> {
        let mut cur = self.value;
        for segment in path {
            cur = cur.get(*segment)?;
        }
        if cur.is_null() {
            None
        } else {
            Some(cur)
        }
    }

    fn missing(&self, field: &'static str) -> TransformRecordError {
        TransformRecordError::MissingField {
            source_id: self.source_id.to_string(),
            index: self.index,
            field,
        }
    }

    fn invalid(&self, field: &'static str, message: impl Into<String>) -> TransformRecordError {
        TransformRecordError::InvalidField {
            source_id: self.source_id.to_string(),
            index: self.index,
            field,
            message: message.into(),
        }
    }

    /// Identifier that upstreams send as either a string or an integer.
    pub(crate) fn id(&self, field: &'static str) -> EntryResult<String> {
        match self.lookup(&[field]) {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            Some(JsonValue::Number(n)) => Ok(n.to_string()),
            Some(JsonValue::String(_)) | None => Err(self.missing(field)),
            Some(other) => Err(self.invalid(field, format!("unexpected {other}"))),
        }
    }

    pub(crate) fn text(&self, path: &[&str]) -> String {
        self.lookup(path)
            .and_then(JsonValue::as_str)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    pub(crate) fn opt_text(&self, path: &[&str]) -> Option<String> {
        Some(self.text(path)).filter(|s| !s.is_empty())
    }

    /// Numbers may arrive as JSON numbers or as display strings like "$725,000".
    pub(crate) fn number(&self, field: &'static str, path: &[&str]) -> EntryResult<Option<f64>> {
        match self.lookup(path) {
            None => Ok(None),
            Some(JsonValue::Number(n)) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.invalid(field, "not representable as f64")),
            Some(JsonValue::String(s)) => {
                let cleaned: String = s.chars().filter(|c| !matches!(c, '$' | ',' | ' ')).collect();
                if cleaned.is_empty() {
                    return Ok(None);
                }
                cleaned
                    .parse::<f64>()
                    .map(Some)
                    .map_err(|_| self.invalid(field, format!("{s:?} is not a number")))
            }
            Some(other) => Err(self.invalid(field, format!("unexpected {other}"))),
        }
    }

    pub(crate) fn year(&self, field: &'static str, path: &[&str]) -> EntryResult<Option<i32>> {
        match self.number(field, path)? {
            None => Ok(None),
            Some(v) if v.fract() == 0.0 && (1600.0..=2200.0).contains(&v) => Ok(Some(v as i32)),
            Some(v) => Err(self.invalid(field, format!("{v} is not a plausible year"))),
        }
    }

    pub(crate) fn count(&self, field: &'static str, path: &[&str]) -> EntryResult<Option<u32>> {
        match self.number(field, path)? {
            None => Ok(None),
            Some(v) if v >= 0.0 && v.fract() == 0.0 && v <= f64::from(u32::MAX) => Ok(Some(v as u32)),
            Some(v) => Err(self.invalid(field, format!("{v} is not a count"))),
        }
    }

    pub(crate) fn period(&self, field: &'static str) -> EntryResult<NaiveDate> {
        let raw = self.text(&[field]);
        if raw.is_empty() {
            return Err(self.missing(field));
        }
        parse_period(&raw).ok_or_else(|| self.invalid(field, format!("{raw:?} is not a date")))
    }
}

/// `YYYY-MM-DD` or `YYYY-MM` (first of the month).
pub(crate) fn parse_period(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d"))
        .ok()
}

pub(crate) fn raw_record(
    payload: &FetchedPayload,
    external_id: String,
    address: AddressFields,
    attributes: ListingAttributes,
) -> RawRecord {
    RawRecord {
        source_id: payload.source_id.clone(),
        external_id,
        address,
        attributes,
        fetched_at: payload.fetched_at,
        audit_artifacts: payload.artifact.iter().cloned().collect(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use reag_storage::HttpClientConfig;
    use std::path::PathBuf;

    pub fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    pub fn fixture(source_dir: &str, file: &str, source_id: &str, kind: PayloadKind) -> FetchedPayload {
        let path = workspace_root().join("fixtures").join(source_dir).join(file);
        load_payload_file(path, source_id, kind).expect("fixture payload")
    }

    pub fn upstream(source_id: &str, api_key: Option<&str>) -> Upstream {
        Upstream {
            source_id: source_id.to_string(),
            base_url: "https://upstream.invalid".to_string(),
            api_key: api_key.map(ToString::to_string),
            http: Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http client")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reag_storage::HttpClientConfig;

    fn settings(kind: AdapterKind, api_key: Option<&str>) -> AdapterSettings {
        AdapterSettings {
            source_id: format!("{}-test", kind.as_str()),
            kind,
            base_url: "https://upstream.invalid/".to_string(),
            api_key: api_key.map(ToString::to_string),
        }
    }

    fn http() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap())
    }

    #[test]
    fn adapter_kind_parses_case_insensitively() {
        assert_eq!("Zillow".parse::<AdapterKind>().unwrap(), AdapterKind::Zillow);
        assert_eq!(" mls ".parse::<AdapterKind>().unwrap(), AdapterKind::Mls);
        assert_eq!(
            "redfin".parse::<AdapterKind>().unwrap_err(),
            ConfigurationError::UnknownAdapter("redfin".into())
        );
    }

    #[tokio::test]
    async fn keyed_sources_require_an_api_key() {
        for kind in [AdapterKind::Zillow, AdapterKind::Mls] {
            let err = adapter_for_source(&settings(kind, None), http()).err().unwrap();
            assert!(matches!(
                err,
                ConfigurationError::MissingParameter { parameter: "api_key", .. }
            ));
            let err = adapter_for_source(&settings(kind, Some("  ")), http()).err().unwrap();
            assert!(matches!(err, ConfigurationError::MissingParameter { .. }));
        }
        let county = adapter_for_source(&settings(AdapterKind::County, None), http()).unwrap();
        assert_eq!(county.kind(), AdapterKind::County);
        assert_eq!(county.source_id(), "county-test");
    }

    #[tokio::test]
    async fn missing_base_url_is_a_configuration_error() {
        let mut s = settings(AdapterKind::County, None);
        s.base_url = " ".into();
        let err = adapter_for_source(&s, http()).err().unwrap();
        assert!(matches!(
            err,
            ConfigurationError::MissingParameter { parameter: "base_url", .. }
        ));
    }

    #[test]
    fn fetch_errors_map_to_extraction_taxonomy() {
        let limited = ExtractionError::from_fetch(
            "zillow",
            "https://x/search",
            FetchError::HttpStatus {
                status: 429,
                url: "https://x/search".into(),
            },
        );
        assert!(matches!(limited, ExtractionError::RateLimited { .. }));

        let status = ExtractionError::from_fetch(
            "zillow",
            "https://x/search",
            FetchError::HttpStatus {
                status: 503,
                url: "https://x/search?page=2".into(),
            },
        );
        match status {
            ExtractionError::UpstreamStatus { status, url, .. } => {
                assert_eq!(status, 503);
                assert_eq!(url, "https://x/search?page=2");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(limited.source_id(), "zillow");
    }

    #[test]
    fn period_accepts_day_and_month_precision() {
        assert_eq!(parse_period("2024-02-01"), NaiveDate::from_ymd_opt(2024, 2, 1));
        assert_eq!(parse_period("2024-03"), NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(parse_period("March 2024"), None);
    }

    #[test]
    fn entry_numbers_accept_display_strings() {
        let value = serde_json::json!({
            "price": "$725,000",
            "blank": "",
            "bad": "call for price",
            "year": 1928,
            "odd_year": 19.5,
            "count": -3
        });
        let cursor = EntryCursor::new("zillow", &value);
        assert_eq!(cursor.number("price", &["price"]).unwrap(), Some(725_000.0));
        assert_eq!(cursor.number("blank", &["blank"]).unwrap(), None);
        assert_eq!(cursor.number("missing", &["missing"]).unwrap(), None);
        assert!(cursor.number("bad", &["bad"]).is_err());
        assert_eq!(cursor.year("year", &["year"]).unwrap(), Some(1928));
        assert!(cursor.year("odd_year", &["odd_year"]).is_err());
        assert!(cursor.count("count", &["count"]).is_err());
    }

    #[test]
    fn non_json_payload_yields_a_single_payload_error() {
        let payload = FetchedPayload {
            source_id: "mls".into(),
            kind: PayloadKind::Search {
                location: "seattle".into(),
                page: 1,
            },
            url: "https://x".into(),
            body: b"<html>gateway timeout</html>".to_vec(),
            fetched_at: Utc::now(),
            artifact: None,
        };
        let parsed = parse_entries(&payload, "results", |c| c.id("external_id"));
        assert_eq!(parsed.len(), 1);
        assert!(matches!(parsed[0], Err(TransformRecordError::Payload { .. })));
    }
}
