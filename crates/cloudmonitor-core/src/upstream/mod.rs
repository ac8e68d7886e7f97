//! Upstream CloudMonitor API access.
//!
//! The collector only depends on the [`CloudMonitorApi`] trait, so it works
//! with both the real HTTP client and the in-memory mock used by tests.
//!
//! ```text
//!                ┌────────────────────┐
//!                │  CloudMonitorApi   │ (trait)
//!                └─────────┬──────────┘
//!              ┌───────────┴───────────┐
//!       ┌──────▼──────┐         ┌──────▼──────────┐
//!       │ AliyunClient│         │ MockCloudMonitor│
//!       │ (HTTPS RPC) │         │ (Testing)       │
//!       └─────────────┘         └─────────────────┘
//! ```

#[cfg(feature = "aliyun")]
pub mod aliyun;
pub mod mock;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[cfg(feature = "aliyun")]
pub use aliyun::{AliyunClient, AliyunConfig};
pub use mock::MockCloudMonitor;

/// Query window for a metric lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Window ending at `end` and reaching `lookback` into the past.
    ///
    /// A lookback reaching before the earliest representable instant is
    /// clamped to that instant.
    pub fn ending_at(end: DateTime<Utc>, lookback: Duration) -> Self {
        let start = chrono::Duration::from_std(lookback)
            .ok()
            .and_then(|lookback| end.checked_sub_signed(lookback))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { start, end }
    }

    /// Window ending now.
    pub fn last(lookback: Duration) -> Self {
        Self::ending_at(Utc::now(), lookback)
    }
}

/// One data point as returned by CloudMonitor, with every statistic the API
/// computed for it. Which statistic is republished is decided by the catalog.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct RawDataPoint {
    #[serde(rename = "instanceId", default)]
    pub instance_id: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "Average", default)]
    pub average: Option<f64>,
    #[serde(rename = "Maximum", default)]
    pub maximum: Option<f64>,
    #[serde(rename = "Minimum", default)]
    pub minimum: Option<f64>,
    #[serde(rename = "Value", default)]
    pub value: Option<f64>,
}

impl RawDataPoint {
    pub fn new(instance_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            instance_id: instance_id.into(),
            timestamp,
            ..Self::default()
        }
    }

    pub fn with_average(mut self, v: f64) -> Self {
        self.average = Some(v);
        self
    }

    pub fn with_maximum(mut self, v: f64) -> Self {
        self.maximum = Some(v);
        self
    }

    pub fn with_minimum(mut self, v: f64) -> Self {
        self.minimum = Some(v);
        self
    }

    pub fn with_value(mut self, v: f64) -> Self {
        self.value = Some(v);
        self
    }
}

/// Failure talking to CloudMonitor. All variants are transient from the
/// collector's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamError {
    /// Connection, TLS or timeout failure.
    Transport(String),
    /// Credentials rejected.
    Auth(String),
    /// Request rate limited.
    Throttled(String),
    /// API answered with a non-success code.
    Api { code: String, message: String },
    /// Response body could not be decoded.
    Decode(String),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::Transport(msg) => write!(f, "transport error: {}", msg),
            UpstreamError::Auth(msg) => write!(f, "authentication failed: {}", msg),
            UpstreamError::Throttled(msg) => write!(f, "throttled: {}", msg),
            UpstreamError::Api { code, message } => write!(f, "API error {}: {}", code, message),
            UpstreamError::Decode(msg) => write!(f, "malformed response: {}", msg),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Time-series query against one monitoring namespace.
#[async_trait]
pub trait CloudMonitorApi: Send + Sync {
    /// Returns the latest data points of `metric` in `namespace`, one or more
    /// per reporting instance.
    async fn query(
        &self,
        namespace: &str,
        metric: &str,
        range: TimeRange,
    ) -> Result<Vec<RawDataPoint>, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_range_ending_at() {
        let end = DateTime::from_timestamp(1_700_000_300, 0).unwrap();
        let range = TimeRange::ending_at(end, Duration::from_secs(300));
        assert_eq!(range.start.timestamp(), 1_700_000_000);
        assert_eq!(range.end, end);
    }

    #[test]
    fn time_range_clamps_oversized_lookback() {
        let end = DateTime::from_timestamp(1_700_000_300, 0).unwrap();

        // Fits a chrono duration, but subtracting it leaves the calendar.
        let range = TimeRange::ending_at(end, Duration::from_secs(1_000_000_000_000_000));
        assert_eq!(range.start, DateTime::<Utc>::MIN_UTC);
        assert_eq!(range.end, end);

        // Too large for a chrono duration at all.
        let range = TimeRange::ending_at(end, Duration::from_secs(u64::MAX));
        assert_eq!(range.start, DateTime::<Utc>::MIN_UTC);
        assert!(range.start < range.end);
    }

    #[test]
    fn raw_data_point_deserializes_cms_fields() {
        let json = r#"{"timestamp":1700000000000,"userId":"123","instanceId":"lb-1",
            "Average":120.5,"Maximum":300,"Minimum":2}"#;
        let point: RawDataPoint = serde_json::from_str(json).unwrap();
        assert_eq!(point.instance_id, "lb-1");
        assert_eq!(point.timestamp, 1_700_000_000_000);
        assert_eq!(point.average, Some(120.5));
        assert_eq!(point.maximum, Some(300.0));
        assert_eq!(point.minimum, Some(2.0));
        assert_eq!(point.value, None);
    }
}
