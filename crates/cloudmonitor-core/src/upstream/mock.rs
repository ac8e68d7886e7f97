//! In-memory CloudMonitor for testing collectors without network access.
//!
//! Responses are scripted per `(namespace, metric)` pair. Pairs without a
//! script answer with an empty data point list, as the real API does for
//! metrics nobody reports.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{CloudMonitorApi, RawDataPoint, TimeRange, UpstreamError};
use crate::catalog::Catalog;

type Key = (String, String);

/// Scripted CloudMonitor API.
#[derive(Debug, Default)]
pub struct MockCloudMonitor {
    responses: Mutex<HashMap<Key, Result<Vec<RawDataPoint>, UpstreamError>>>,
    calls: Mutex<Vec<Key>>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockCloudMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `(namespace, metric)` with `points`.
    pub fn with_points(self, namespace: &str, metric: &str, points: Vec<RawDataPoint>) -> Self {
        self.set_points(namespace, metric, points);
        self
    }

    /// Delays every answer by `latency`, so that concurrent queries overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fails every query for `(namespace, metric)` with `error`.
    pub fn with_error(self, namespace: &str, metric: &str, error: UpstreamError) -> Self {
        self.set_error(namespace, metric, error);
        self
    }

    /// Replaces the response for `(namespace, metric)`.
    pub fn set_points(&self, namespace: &str, metric: &str, points: Vec<RawDataPoint>) {
        self.responses
            .lock()
            .unwrap()
            .insert(key(namespace, metric), Ok(points));
    }

    pub fn set_error(&self, namespace: &str, metric: &str, error: UpstreamError) {
        self.responses
            .lock()
            .unwrap()
            .insert(key(namespace, metric), Err(error));
    }

    /// Every query received so far, in arrival order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of queries that were in progress at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Scripts every catalog entry with one point per instance.
    ///
    /// Values are deterministic: for the n-th entry overall and the i-th
    /// instance, `Average = n * 10 + i`, `Maximum = 2 * Average`,
    /// `Value = Average + 0.5`.
    pub fn populated(catalog: &Catalog, instances: &[&str]) -> Self {
        let mock = Self::new();
        let mut n = 0usize;
        for category in catalog.categories() {
            for entry in category.entries() {
                let points = instances
                    .iter()
                    .enumerate()
                    .map(|(i, id)| {
                        let avg = (n * 10 + i) as f64;
                        RawDataPoint::new(*id, 1_700_000_000_000)
                            .with_average(avg)
                            .with_maximum(avg * 2.0)
                            .with_minimum(0.0)
                            .with_value(avg + 0.5)
                    })
                    .collect();
                mock.set_points(&category.namespace, &entry.upstream_name, points);
                n += 1;
            }
        }
        mock
    }
}

fn key(namespace: &str, metric: &str) -> Key {
    (namespace.to_string(), metric.to_string())
}

#[async_trait]
impl CloudMonitorApi for MockCloudMonitor {
    async fn query(
        &self,
        namespace: &str,
        metric: &str,
        _range: TimeRange,
    ) -> Result<Vec<RawDataPoint>, UpstreamError> {
        let key = key(namespace, metric);
        self.calls.lock().unwrap().push(key.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.responses
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn scripted_points_and_errors() {
        let mock = MockCloudMonitor::new()
            .with_points("ns", "A", vec![RawDataPoint::new("i-1", 1).with_average(1.0)])
            .with_error("ns", "B", UpstreamError::Throttled("slow down".into()));
        let range = TimeRange::last(Duration::from_secs(60));

        let points = mock.query("ns", "A", range).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(
            mock.query("ns", "B", range).await.unwrap_err(),
            UpstreamError::Throttled("slow down".into())
        );
        assert!(mock.query("ns", "C", range).await.unwrap().is_empty());
        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.calls()[1], ("ns".to_string(), "B".to_string()));
    }

    #[tokio::test]
    async fn populated_covers_catalog() {
        let catalog = Catalog::builtin().unwrap();
        let mock = MockCloudMonitor::populated(&catalog, &["a", "b"]);
        let range = TimeRange::last(Duration::from_secs(60));

        for category in catalog.categories() {
            for entry in category.entries() {
                let points = mock
                    .query(&category.namespace, &entry.upstream_name, range)
                    .await
                    .unwrap();
                assert_eq!(points.len(), 2);
            }
        }
    }
}
