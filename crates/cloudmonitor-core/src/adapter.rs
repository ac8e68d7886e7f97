//! Resource category adapters.
//!
//! One adapter per monitoring namespace. Instead of a hand-written method per
//! metric, every catalog entry goes through the same [`ResourceAdapter::retrieve`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::catalog::{Catalog, CatalogError, CategoryId, ValueSelector};
use crate::upstream::{CloudMonitorApi, RawDataPoint, TimeRange, UpstreamError};

/// Latest value of one metric for one resource instance.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub instance_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub value: f64,
}

/// Why a retrieval produced no data.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalError {
    Catalog(CatalogError),
    Upstream(UpstreamError),
    /// The retrieval task ended without a result.
    Aborted(String),
}

impl fmt::Display for RetrievalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalError::Catalog(e) => write!(f, "{}", e),
            RetrievalError::Upstream(e) => write!(f, "{}", e),
            RetrievalError::Aborted(msg) => write!(f, "retrieval aborted: {}", msg),
        }
    }
}

impl std::error::Error for RetrievalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetrievalError::Catalog(e) => Some(e),
            RetrievalError::Upstream(e) => Some(e),
            RetrievalError::Aborted(_) => None,
        }
    }
}

impl From<CatalogError> for RetrievalError {
    fn from(e: CatalogError) -> Self {
        RetrievalError::Catalog(e)
    }
}

impl From<UpstreamError> for RetrievalError {
    fn from(e: UpstreamError) -> Self {
        RetrievalError::Upstream(e)
    }
}

/// Upstream client bound to the namespace of one resource category.
///
/// Construction is cheap: the client handle and catalog are shared.
#[derive(Clone)]
pub struct ResourceAdapter {
    catalog: Arc<Catalog>,
    category: CategoryId,
    namespace: String,
    client: Arc<dyn CloudMonitorApi>,
    lookback: Duration,
}

impl fmt::Debug for ResourceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceAdapter")
            .field("category", &self.category)
            .field("namespace", &self.namespace)
            .field("lookback", &self.lookback)
            .finish()
    }
}

impl ResourceAdapter {
    pub fn new(
        catalog: Arc<Catalog>,
        category: CategoryId,
        client: Arc<dyn CloudMonitorApi>,
        lookback: Duration,
    ) -> Result<Self, CatalogError> {
        let namespace = catalog.category(category)?.namespace.clone();
        Ok(Self {
            catalog,
            category,
            namespace,
            client,
            lookback,
        })
    }

    pub fn category(&self) -> CategoryId {
        self.category
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Fetches the most recent data points of `metric`, one per instance,
    /// sorted by instance id. Every call queries the upstream afresh.
    pub async fn retrieve(&self, metric: &str) -> Result<Vec<DataPoint>, RetrievalError> {
        let definition = self.catalog.lookup(self.category, metric)?;
        let range = TimeRange::last(self.lookback);
        let raw = self.client.query(&self.namespace, metric, range).await?;

        let total = raw.len();
        let points = latest_per_instance(raw, definition.selector);
        if points.len() != total {
            debug!(
                namespace = %self.namespace,
                metric,
                received = total,
                kept = points.len(),
                "dropped superseded or incomplete data points"
            );
        }
        Ok(points)
    }
}

/// Picks the statistic named by `selector`, if the API reported it.
pub fn select_value(point: &RawDataPoint, selector: ValueSelector) -> Option<f64> {
    match selector {
        ValueSelector::Average => point.average,
        ValueSelector::Maximum => point.maximum,
        ValueSelector::Value => point.value,
    }
}

/// Keeps the newest point per instance that carries the selected statistic.
fn latest_per_instance(raw: Vec<RawDataPoint>, selector: ValueSelector) -> Vec<DataPoint> {
    let mut latest: BTreeMap<String, DataPoint> = BTreeMap::new();
    for point in raw {
        let Some(value) = select_value(&point, selector) else {
            continue;
        };
        if point.instance_id.is_empty() {
            continue;
        }
        let newer = latest
            .get(&point.instance_id)
            .is_none_or(|existing| existing.timestamp <= point.timestamp);
        if newer {
            latest.insert(
                point.instance_id.clone(),
                DataPoint {
                    instance_id: point.instance_id,
                    timestamp: point.timestamp,
                    value,
                },
            );
        }
    }
    latest.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::MockCloudMonitor;

    fn adapter(mock: MockCloudMonitor, category: CategoryId) -> ResourceAdapter {
        let catalog = Arc::new(Catalog::builtin().unwrap());
        ResourceAdapter::new(catalog, category, Arc::new(mock), Duration::from_secs(300)).unwrap()
    }

    #[test]
    fn selector_picks_statistic() {
        let point = RawDataPoint::new("i-1", 0)
            .with_average(5.0)
            .with_maximum(9.0)
            .with_value(7.0);
        assert_eq!(select_value(&point, ValueSelector::Average), Some(5.0));
        assert_eq!(select_value(&point, ValueSelector::Maximum), Some(9.0));
        assert_eq!(select_value(&point, ValueSelector::Value), Some(7.0));
        assert_eq!(
            select_value(&RawDataPoint::new("i-1", 0), ValueSelector::Average),
            None
        );
    }

    #[tokio::test]
    async fn retrieve_selects_and_sorts() {
        let mock = MockCloudMonitor::new().with_points(
            "acs_nat_gateway",
            "SnatConnection",
            vec![
                RawDataPoint::new("ngw-b", 10).with_average(5.0).with_maximum(9.0),
                RawDataPoint::new("ngw-a", 10).with_average(1.0).with_maximum(3.0),
            ],
        );
        let adapter = adapter(mock, CategoryId::NatGateway);
        assert_eq!(adapter.namespace(), "acs_nat_gateway");

        let points = adapter.retrieve("SnatConnection").await.unwrap();
        assert_eq!(
            points,
            vec![
                DataPoint {
                    instance_id: "ngw-a".into(),
                    timestamp: 10,
                    value: 3.0
                },
                DataPoint {
                    instance_id: "ngw-b".into(),
                    timestamp: 10,
                    value: 9.0
                },
            ]
        );
    }

    #[tokio::test]
    async fn retrieve_keeps_latest_point_per_instance() {
        let mock = MockCloudMonitor::new().with_points(
            "acs_rds_dashboard",
            "CpuUsage",
            vec![
                RawDataPoint::new("rm-1", 2000).with_average(40.0),
                RawDataPoint::new("rm-1", 1000).with_average(10.0),
                RawDataPoint::new("rm-2", 1000).with_maximum(99.0),
            ],
        );
        let points = adapter(mock, CategoryId::Database)
            .retrieve("CpuUsage")
            .await
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].instance_id, "rm-1");
        assert_eq!(points[0].value, 40.0);
    }

    #[tokio::test]
    async fn retrieve_unknown_metric_skips_upstream() {
        let mock = Arc::new(MockCloudMonitor::new());
        let catalog = Arc::new(Catalog::builtin().unwrap());
        let adapter = ResourceAdapter::new(
            catalog,
            CategoryId::Database,
            mock.clone(),
            Duration::from_secs(60),
        )
        .unwrap();

        let err = adapter.retrieve("NoSuchMetric").await.unwrap_err();
        assert!(matches!(err, RetrievalError::Catalog(CatalogError::NotFound { .. })));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn retrieve_surfaces_upstream_error() {
        let mock = MockCloudMonitor::new().with_error(
            "acs_slb_dashboard",
            "Qps",
            UpstreamError::Auth("InvalidAccessKeyId.NotFound".into()),
        );
        let err = adapter(mock, CategoryId::LoadBalancer)
            .retrieve("Qps")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RetrievalError::Upstream(UpstreamError::Auth("InvalidAccessKeyId.NotFound".into()))
        );
    }

    #[test]
    fn adapter_requires_enabled_category() {
        let catalog = Arc::new(
            Catalog::builtin()
                .unwrap()
                .restrict_to(&[CategoryId::NatGateway]),
        );
        let err = ResourceAdapter::new(
            catalog,
            CategoryId::Database,
            Arc::new(MockCloudMonitor::new()),
            Duration::from_secs(60),
        )
        .unwrap_err();
        assert_eq!(err, CatalogError::CategoryNotFound(CategoryId::Database));
    }
}
