//! Outbound delivery of findings and degraded-status records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::detect::{DetectError, Finding, Severity};
use crate::scheduler::Tier;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint rejected delivery with status {0}")]
    Rejected(u16),
}

/// A per-entity failure that was isolated instead of aborting a tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradedStatus {
    pub entity_id: String,
    pub tier: Tier,
    pub error_kind: &'static str,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl DegradedStatus {
    pub fn new(entity_id: &str, tier: Tier, error: &DetectError, timestamp: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            tier,
            error_kind: error.kind(),
            message: error.to_string(),
            timestamp,
        }
    }
}

#[async_trait]
pub trait FindingSink: Send + Sync {
    async fn emit_finding(&self, finding: &Finding) -> Result<(), SinkError>;

    async fn emit_degraded(&self, status: &DegradedStatus) -> Result<(), SinkError>;

    /// Short channel name for logs.
    fn name(&self) -> &str;
}

/// Writes findings to the tracing log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl FindingSink for LogSink {
    async fn emit_finding(&self, f: &Finding) -> Result<(), SinkError> {
        warn!(
            entity = %f.entity_id,
            tier = %f.tier,
            severity = %f.severity,
            score = f.score,
            observed = ?f.observed,
            baseline = %f.baseline_summary,
            id = %f.id,
            "anomaly detected"
        );
        Ok(())
    }

    async fn emit_degraded(&self, s: &DegradedStatus) -> Result<(), SinkError> {
        warn!(
            entity = %s.entity_id,
            tier = %s.tier,
            kind = s.error_kind,
            "entity degraded: {}",
            s.message
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WebhookPayload<'a> {
    Finding(&'a Finding),
    Degraded(&'a DegradedStatus),
}

/// POSTs findings as JSON to a configured endpoint.
#[derive(Debug)]
pub struct WebhookSink {
    url: String,
    headers: HashMap<String, String>,
    min_severity: Severity,
    include_degraded: bool,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(
        url: String,
        headers: HashMap<String, String>,
        min_severity: Severity,
        include_degraded: bool,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url,
            headers,
            min_severity,
            include_degraded,
            client,
        })
    }

    async fn post(&self, payload: &WebhookPayload<'_>) -> Result<(), SinkError> {
        let mut request = self.client.post(&self.url).json(payload);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(SinkError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl FindingSink for WebhookSink {
    async fn emit_finding(&self, finding: &Finding) -> Result<(), SinkError> {
        if finding.severity < self.min_severity {
            return Ok(());
        }
        self.post(&WebhookPayload::Finding(finding)).await?;
        info!(entity = %finding.entity_id, url = %self.url, "finding delivered to webhook");
        Ok(())
    }

    async fn emit_degraded(&self, status: &DegradedStatus) -> Result<(), SinkError> {
        if !self.include_degraded {
            return Ok(());
        }
        self.post(&WebhookPayload::Degraded(status)).await
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Delivers to every inner sink concurrently; one failing channel does not
/// stop the rest.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn FindingSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn FindingSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl FindingSink for FanoutSink {
    async fn emit_finding(&self, finding: &Finding) -> Result<(), SinkError> {
        let results = join_all(self.sinks.iter().map(|sink| sink.emit_finding(finding))).await;
        for (sink, result) in self.sinks.iter().zip(results) {
            if let Err(e) = result {
                warn!(channel = sink.name(), error = %e, "finding delivery failed");
            }
        }
        Ok(())
    }

    async fn emit_degraded(&self, status: &DegradedStatus) -> Result<(), SinkError> {
        let results = join_all(self.sinks.iter().map(|sink| sink.emit_degraded(status))).await;
        for (sink, result) in self.sinks.iter().zip(results) {
            if let Err(e) = result {
                warn!(channel = sink.name(), error = %e, "degraded-status delivery failed");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "fanout"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Observation, Verdict};
    use crate::entity::EntityKind;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        findings: Mutex<Vec<Finding>>,
    }

    #[async_trait]
    impl FindingSink for Recording {
        async fn emit_finding(&self, finding: &Finding) -> Result<(), SinkError> {
            self.findings.lock().unwrap().push(finding.clone());
            Ok(())
        }
        async fn emit_degraded(&self, _: &DegradedStatus) -> Result<(), SinkError> {
            Ok(())
        }
        fn name(&self) -> &str {
            "recording"
        }
    }

    fn finding() -> Finding {
        Finding::new(
            "sensor.t",
            EntityKind::Numeric,
            Tier::Standard,
            Utc::now(),
            Observation::Numeric(1.0),
            Verdict {
                severity: Severity::High,
                score: 5.0,
                baseline_summary: String::new(),
            },
            false,
        )
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let a = Arc::new(Recording::default());
        let b = Arc::new(Recording::default());
        let fanout = FanoutSink::new(vec![Arc::new(LogSink), a.clone(), b.clone()]);
        fanout.emit_finding(&finding()).await.unwrap();
        assert_eq!(a.findings.lock().unwrap().len(), 1);
        assert_eq!(b.findings.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_skips_below_min_severity() {
        // Unroutable URL: any attempted delivery would fail.
        let sink = WebhookSink::new(
            "http://127.0.0.1:9/hook".to_string(),
            HashMap::new(),
            Severity::High,
            false,
            Duration::from_millis(200),
        )
        .unwrap();
        let mut low = finding();
        low.severity = Severity::Medium;
        assert!(sink.emit_finding(&low).await.is_ok());
        assert!(sink
            .emit_degraded(&DegradedStatus::new(
                "sensor.t",
                Tier::Standard,
                &DetectError::SourceUnavailable("down".into()),
                Utc::now()
            ))
            .await
            .is_ok());
    }

    #[test]
    fn test_degraded_status_carries_error_kind() {
        let status = DegradedStatus::new(
            "sensor.t",
            Tier::Priority,
            &DetectError::InsufficientData { needed: 5, have: 2 },
            Utc::now(),
        );
        assert_eq!(status.error_kind, "insufficient_data");
        assert!(status.message.contains("need 5"));
    }
}
