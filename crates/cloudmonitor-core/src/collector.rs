//! Collection pass: fan retrievals out over every catalog entry and gather
//! the results into ordered samples.
//!
//! A pass keeps no state once it returns. Retrievals run as one tokio task per
//! (category, metric), bounded by a semaphore, and are joined before any
//! sample is emitted. A failed retrieval only costs the samples of its own
//! metric.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::adapter::{DataPoint, ResourceAdapter, RetrievalError};
use crate::catalog::{Catalog, CategoryId};
use crate::upstream::CloudMonitorApi;

/// Tuning for collection passes.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// How far back the "most recent interval" reaches.
    pub lookback: Duration,
    /// Maximum retrievals in flight at once.
    pub concurrency: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(300),
            concurrency: 8,
        }
    }
}

/// One exported gauge value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Exported metric name.
    pub metric: String,
    pub instance_id: String,
    pub value: f64,
    /// Upstream timestamp, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// A retrieval that produced no samples this pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalFailure {
    pub category: CategoryId,
    pub namespace: String,
    pub metric: String,
    pub error: RetrievalError,
}

/// Outcome of one collection pass.
#[derive(Debug, Clone, Default)]
pub struct CollectionReport {
    /// Category order, then entry order, then instance id ascending.
    pub samples: Vec<Sample>,
    pub failures: Vec<RetrievalFailure>,
    pub elapsed: Duration,
}

impl CollectionReport {
    /// Samples of one exported metric.
    pub fn samples_for<'a>(&'a self, metric: &'a str) -> impl Iterator<Item = &'a Sample> + 'a {
        self.samples.iter().filter(move |s| s.metric == metric)
    }
}

struct Job {
    category: CategoryId,
    namespace: String,
    metric: String,
    output_name: String,
}

/// Runs collection passes against a shared upstream client.
pub struct Collector {
    catalog: Arc<Catalog>,
    client: Arc<dyn CloudMonitorApi>,
    config: CollectorConfig,
}

impl Collector {
    pub fn new(
        catalog: Arc<Catalog>,
        client: Arc<dyn CloudMonitorApi>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            catalog,
            client,
            config,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Runs one pass over every entry of every enabled category.
    pub async fn collect(&self) -> CollectionReport {
        let start = Instant::now();
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut jobs: Vec<Job> = Vec::with_capacity(self.catalog.len());
        let mut tasks = JoinSet::new();
        let mut failures = Vec::new();

        for category in self.catalog.categories() {
            let adapter = match ResourceAdapter::new(
                self.catalog.clone(),
                category.id,
                self.client.clone(),
                self.config.lookback,
            ) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(category = %category.id, error = %e, "skipping category");
                    continue;
                }
            };

            for entry in category.entries() {
                let idx = jobs.len();
                jobs.push(Job {
                    category: adapter.category(),
                    namespace: adapter.namespace().to_string(),
                    metric: entry.upstream_name.clone(),
                    output_name: entry.definition.output_name.clone(),
                });

                let adapter = adapter.clone();
                let metric = entry.upstream_name.clone();
                let permits = permits.clone();
                tasks.spawn(async move {
                    let _permit = permits.acquire_owned().await.ok();
                    (idx, adapter.retrieve(&metric).await)
                });
            }
        }

        let mut results: Vec<Option<Result<Vec<DataPoint>, RetrievalError>>> =
            (0..jobs.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(e) => warn!(error = %e, "retrieval task failed to complete"),
            }
        }

        let mut samples = Vec::new();
        for (job, result) in jobs.into_iter().zip(results) {
            let result = result
                .unwrap_or_else(|| Err(RetrievalError::Aborted("task did not complete".into())));
            match result {
                Ok(points) => {
                    samples.extend(points.into_iter().map(|p| Sample {
                        metric: job.output_name.clone(),
                        instance_id: p.instance_id,
                        value: p.value,
                        timestamp: p.timestamp,
                    }));
                }
                Err(error) => {
                    warn!(
                        namespace = %job.namespace,
                        metric = %job.metric,
                        error = %error,
                        "retrieval failed"
                    );
                    failures.push(RetrievalFailure {
                        category: job.category,
                        namespace: job.namespace,
                        metric: job.metric,
                        error,
                    });
                }
            }
        }

        let elapsed = start.elapsed();
        let oldest_sample_age_secs = samples
            .iter()
            .map(|s| s.timestamp)
            .min()
            .map(|ts| (Utc::now().timestamp_millis() - ts).max(0) / 1000);
        debug!(
            samples = samples.len(),
            failures = failures.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            oldest_sample_age_secs,
            "collection pass finished"
        );

        CollectionReport {
            samples,
            failures,
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ValueSelector;
    use crate::upstream::{MockCloudMonitor, RawDataPoint, UpstreamError};

    fn collector(mock: Arc<MockCloudMonitor>, catalog: Catalog) -> Collector {
        Collector::new(Arc::new(catalog), mock, CollectorConfig::default())
    }

    #[tokio::test]
    async fn end_to_end_instance_qps() {
        let mock = Arc::new(MockCloudMonitor::new().with_points(
            "acs_slb_dashboard",
            "InstanceQps",
            vec![RawDataPoint::new("lb-1", 1_700_000_000_000).with_average(120.5)],
        ));
        let report = collector(mock, Catalog::builtin().unwrap()).collect().await;

        assert!(report.failures.is_empty());
        assert_eq!(
            report.samples,
            vec![Sample {
                metric: "cloudmonitor_slb_instance_qps".to_string(),
                instance_id: "lb-1".to_string(),
                value: 120.5,
                timestamp: 1_700_000_000_000,
            }]
        );
    }

    #[tokio::test]
    async fn every_entry_yields_one_sample_per_instance() {
        let catalog = Catalog::builtin().unwrap();
        let instances = ["i-a", "i-b", "i-c"];
        let mock = Arc::new(MockCloudMonitor::populated(&catalog, &instances));
        let report = collector(mock.clone(), catalog.clone()).collect().await;

        assert!(report.failures.is_empty());
        assert_eq!(report.samples.len(), catalog.len() * instances.len());
        assert_eq!(mock.call_count(), catalog.len());

        let mut n = 0usize;
        for category in catalog.categories() {
            for entry in category.entries() {
                let def = &entry.definition;
                let samples: Vec<_> = report.samples_for(&def.output_name).collect();
                assert_eq!(samples.len(), instances.len(), "{}", def.output_name);
                for (i, sample) in samples.iter().enumerate() {
                    assert_eq!(sample.instance_id, instances[i]);
                    let avg = (n * 10 + i) as f64;
                    let expected = match def.selector {
                        ValueSelector::Average => avg,
                        ValueSelector::Maximum => avg * 2.0,
                        ValueSelector::Value => avg + 0.5,
                    };
                    assert_eq!(sample.value, expected, "{}", def.output_name);
                }
                n += 1;
            }
        }
    }

    #[tokio::test]
    async fn samples_follow_catalog_then_instance_order() {
        let catalog = Catalog::builtin().unwrap();
        let mock = Arc::new(MockCloudMonitor::populated(&catalog, &["z", "a", "m"]));
        let report = collector(mock, catalog.clone()).collect().await;

        let expected: Vec<(String, String)> = catalog
            .definitions()
            .flat_map(|d| {
                ["a", "m", "z"]
                    .into_iter()
                    .map(move |id| (d.output_name.clone(), id.to_string()))
            })
            .collect();
        let actual: Vec<(String, String)> = report
            .samples
            .iter()
            .map(|s| (s.metric.clone(), s.instance_id.clone()))
            .collect();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn failed_metric_is_isolated() {
        let catalog = Catalog::builtin().unwrap();
        let mock = Arc::new(MockCloudMonitor::populated(&catalog, &["i-1"]));
        mock.set_error(
            "acs_slb_dashboard",
            "InstanceRt",
            UpstreamError::Transport("connection reset".into()),
        );
        let report = collector(mock, catalog.clone()).collect().await;

        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(failure.category, CategoryId::LoadBalancer);
        assert_eq!(failure.namespace, "acs_slb_dashboard");
        assert_eq!(failure.metric, "InstanceRt");
        assert_eq!(
            failure.error,
            RetrievalError::Upstream(UpstreamError::Transport("connection reset".into()))
        );

        assert_eq!(report.samples.len(), catalog.len() - 1);
        assert_eq!(report.samples_for("cloudmonitor_slb_request_time").count(), 0);
        assert_eq!(report.samples_for("cloudmonitor_slb_instance_qps").count(), 1);
        assert_eq!(report.samples_for("cloudmonitor_rds_connection_usage").count(), 1);
    }

    #[tokio::test]
    async fn whole_namespace_outage_keeps_other_categories() {
        let catalog = Catalog::builtin().unwrap();
        let mock = Arc::new(MockCloudMonitor::populated(&catalog, &["i-1"]));
        let nat = catalog.category(CategoryId::NatGateway).unwrap();
        for entry in nat.entries() {
            mock.set_error(
                &nat.namespace,
                &entry.upstream_name,
                UpstreamError::Auth("Forbidden.RAM".into()),
            );
        }
        let report = collector(mock, catalog.clone()).collect().await;

        assert_eq!(report.failures.len(), nat.entries().len());
        assert!(report.failures.iter().all(|f| f.category == CategoryId::NatGateway));
        assert_eq!(report.samples.len(), catalog.len() - nat.entries().len());
    }

    #[tokio::test]
    async fn consecutive_passes_are_identical() {
        let catalog = Catalog::builtin().unwrap();
        let mock = Arc::new(MockCloudMonitor::populated(&catalog, &["x", "y"]));
        let collector = collector(mock.clone(), catalog.clone());

        let first = collector.collect().await;
        let second = collector.collect().await;
        assert_eq!(first.samples, second.samples);
        assert_eq!(mock.call_count(), catalog.len() * 2);
    }

    #[tokio::test]
    async fn restricted_catalog_only_queries_enabled_categories() {
        let catalog = Catalog::builtin()
            .unwrap()
            .restrict_to(&[CategoryId::Database]);
        let full = Catalog::builtin().unwrap();
        let mock = Arc::new(MockCloudMonitor::populated(&full, &["rm-1"]));
        let report = collector(mock.clone(), catalog).collect().await;

        assert_eq!(report.samples.len(), 3);
        assert!(mock.calls().iter().all(|(ns, _)| ns == "acs_rds_dashboard"));
    }

    fn with_concurrency(mock: Arc<MockCloudMonitor>, catalog: &Catalog, n: usize) -> Collector {
        Collector::new(
            Arc::new(catalog.clone()),
            mock,
            CollectorConfig {
                concurrency: n,
                ..CollectorConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn concurrency_bounds_in_flight_queries() {
        let catalog = Catalog::builtin().unwrap();
        for limit in [1, 3] {
            let mock = Arc::new(
                MockCloudMonitor::populated(&catalog, &["i-1"])
                    .with_latency(Duration::from_millis(20)),
            );
            let report = with_concurrency(mock.clone(), &catalog, limit)
                .collect()
                .await;

            assert_eq!(report.samples.len(), catalog.len());
            assert_eq!(mock.call_count(), catalog.len());
            assert!(
                mock.peak_in_flight() <= limit,
                "limit {limit}, peak {}",
                mock.peak_in_flight()
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_allows_overlap() {
        let catalog = Catalog::builtin().unwrap();
        let mock = Arc::new(
            MockCloudMonitor::populated(&catalog, &["i-1"]).with_latency(Duration::from_millis(50)),
        );
        with_concurrency(mock.clone(), &catalog, 4).collect().await;

        assert!(mock.peak_in_flight() > 1);
        assert!(mock.peak_in_flight() <= 4);
    }

    #[tokio::test]
    async fn oversized_lookback_still_collects() {
        let catalog = Catalog::builtin().unwrap();
        let mock = Arc::new(MockCloudMonitor::populated(&catalog, &["i-1"]));
        let collector = Collector::new(
            Arc::new(catalog.clone()),
            mock,
            CollectorConfig {
                lookback: Duration::from_secs(u64::MAX),
                ..CollectorConfig::default()
            },
        );
        let report = collector.collect().await;

        assert!(report.failures.is_empty());
        assert_eq!(report.samples.len(), catalog.len());
    }
}
