//! Dedup-rate alerting over the recent metric history of each source.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reag_core::DedupMetricSample;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

pub const DEFAULT_ALERT_WINDOW: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct AlertPolicy {
    pub window: usize,
    min_rates: HashMap<String, f64>,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            window: DEFAULT_ALERT_WINDOW,
            min_rates: HashMap::new(),
        }
    }
}

impl AlertPolicy {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            ..Self::default()
        }
    }

    pub fn with_min_rate(mut self, source_id: impl Into<String>, min_rate: f64) -> Self {
        self.set_min_rate(source_id, min_rate);
        self
    }

    pub fn set_min_rate(&mut self, source_id: impl Into<String>, min_rate: f64) {
        self.min_rates.insert(source_id.into(), min_rate.clamp(0.0, 1.0));
    }

    pub fn min_rate(&self, source_id: &str) -> Option<f64> {
        self.min_rates.get(source_id).copied()
    }

    /// Check the newest `window` samples (input is oldest first). Sources
    /// without a configured minimum never alert. Every call re-evaluates from
    /// scratch, so a persisting problem alerts again each time.
    pub fn evaluate(&self, source_id: &str, samples: &[DedupMetricSample]) -> Option<DedupAlert> {
        let min_rate = self.min_rate(source_id)?;
        let start = samples.len().saturating_sub(self.window);
        let offending = samples[start..]
            .iter()
            .filter(|s| s.source_id == source_id && s.ratio() < min_rate)
            .cloned()
            .collect::<Vec<_>>();
        if offending.is_empty() {
            return None;
        }
        Some(DedupAlert {
            source_id: source_id.to_string(),
            min_rate,
            window: self.window,
            offending,
            raised_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupAlert {
    pub source_id: String,
    pub min_rate: f64,
    pub window: usize,
    pub offending: Vec<DedupMetricSample>,
    pub raised_at: DateTime<Utc>,
}

impl DedupAlert {
    pub fn worst_ratio(&self) -> f64 {
        self.offending
            .iter()
            .map(DedupMetricSample::ratio)
            .fold(1.0, f64::min)
    }

    pub fn summary(&self) -> String {
        let ratios = self
            .offending
            .iter()
            .map(|s| format!("{:.2} at {}", s.ratio(), s.timestamp.format("%Y-%m-%d %H:%M")))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "dedup rate for {} fell below {:.2} in {} of the last {} runs: {}",
            self.source_id,
            self.min_rate,
            self.offending.len(),
            self.window,
            ratios
        )
    }
}

/// Where raised alerts go.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &DedupAlert) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &DedupAlert) -> anyhow::Result<()> {
        warn!(
            source_id = %alert.source_id,
            min_rate = alert.min_rate,
            worst_ratio = alert.worst_ratio(),
            offending = alert.offending.len(),
            "{}",
            alert.summary()
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAlertSink;

#[async_trait]
impl AlertSink for NoopAlertSink {
    async fn send(&self, _alert: &DedupAlert) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Slack-compatible incoming webhook.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    webhook_url: String,
    http: reqwest::Client,
}

impl WebhookAlertSink {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn payload(alert: &DedupAlert) -> serde_json::Value {
        json!({
            "text": format!(":warning: *REAG dedup alert: {}*\n{}", alert.source_id, alert.summary()),
            "unfurl_links": false,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: &DedupAlert) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(&self.webhook_url)
            .json(&Self::payload(alert))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "alert webhook returned non-success");
            anyhow::bail!("alert webhook returned {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn samples(source_id: &str, ratios: &[f64]) -> Vec<DedupMetricSample> {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        ratios
            .iter()
            .enumerate()
            .map(|(i, ratio)| DedupMetricSample {
                timestamp: start + Duration::hours(i as i64),
                source_id: source_id.to_string(),
                input_count: 120,
                strict_count: 100,
                fuzzy_count: (ratio * 100.0).round() as usize,
                threshold: 95,
            })
            .collect()
    }

    #[test]
    fn sources_without_min_rate_never_alert() {
        let policy = AlertPolicy::default().with_min_rate("mls", 0.9);
        assert!(policy.evaluate("zillow", &samples("zillow", &[0.1, 0.2])).is_none());
    }

    #[test]
    fn only_the_window_is_considered() {
        let policy = AlertPolicy::default().with_min_rate("zillow", 0.95);
        let history = samples("zillow", &[0.50, 0.96, 0.97, 0.98, 0.97, 0.96]);
        assert!(policy.evaluate("zillow", &history).is_none());

        let policy = AlertPolicy::new(6).with_min_rate("zillow", 0.95);
        let alert = policy.evaluate("zillow", &history).unwrap();
        assert_eq!(alert.offending.len(), 1);
        assert!((alert.worst_ratio() - 0.50).abs() < 1e-9);
    }

    #[test]
    fn alert_re_fires_on_every_evaluation() {
        let policy = AlertPolicy::default().with_min_rate("zillow", 0.95);
        let history = samples("zillow", &[0.90]);
        assert!(policy.evaluate("zillow", &history).is_some());
        assert!(policy.evaluate("zillow", &history).is_some());
    }

    #[test]
    fn fewer_samples_than_window_still_evaluates() {
        let policy = AlertPolicy::default().with_min_rate("county", 0.8);
        assert!(policy.evaluate("county", &[]).is_none());
        assert!(policy.evaluate("county", &samples("county", &[0.79])).is_some());
    }

    #[test]
    fn webhook_payload_is_slack_shaped() {
        let policy = AlertPolicy::default().with_min_rate("zillow", 0.95);
        let alert = policy
            .evaluate("zillow", &samples("zillow", &[0.96, 0.80]))
            .unwrap();
        let payload = WebhookAlertSink::payload(&alert);
        let text = payload["text"].as_str().unwrap();
        assert!(text.contains("zillow"));
        assert!(text.contains("0.80"));
        assert_eq!(payload["unfurl_links"], false);
    }

    #[tokio::test]
    async fn log_and_noop_sinks_accept_alerts() {
        let policy = AlertPolicy::default().with_min_rate("zillow", 0.95);
        let alert = policy.evaluate("zillow", &samples("zillow", &[0.5])).unwrap();
        LogAlertSink.send(&alert).await.unwrap();
        NoopAlertSink.send(&alert).await.unwrap();
    }
}
