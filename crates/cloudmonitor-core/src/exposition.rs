//! Prometheus exposition of collection reports.
//!
//! Descriptors are registered once at startup from the catalog; a clash there
//! is fatal. Each render then builds a throwaway registry holding one `GaugeVec`
//! per definition, fills it from the report and encodes it in text format,
//! followed by the exporter's own scrape metrics.

use std::collections::{HashMap, HashSet};
use std::fmt;

use prometheus::{Encoder, Gauge, GaugeVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::debug;

use crate::catalog::{Catalog, CatalogError, METRIC_NAMESPACE, fq_name};
use crate::collector::CollectionReport;

/// Label carrying the resource instance id.
pub const INSTANCE_LABEL: &str = "id";

/// Content type of the text exposition format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Clone, PartialEq)]
pub enum ExpositionError {
    /// Descriptor set is inconsistent (duplicate names).
    Catalog(CatalogError),
    /// The Prometheus library rejected a descriptor.
    Descriptor { name: String, reason: String },
    /// Text encoding failed.
    Encode(String),
}

impl fmt::Display for ExpositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpositionError::Catalog(e) => write!(f, "{}", e),
            ExpositionError::Descriptor { name, reason } => {
                write!(f, "cannot register {}: {}", name, reason)
            }
            ExpositionError::Encode(msg) => write!(f, "encoding failed: {}", msg),
        }
    }
}

impl std::error::Error for ExpositionError {}

impl From<CatalogError> for ExpositionError {
    fn from(e: CatalogError) -> Self {
        ExpositionError::Catalog(e)
    }
}

/// Exporter self-metrics, kept across scrapes.
struct ScrapeMetrics {
    registry: Registry,
    duration: Gauge,
    samples: IntGauge,
    retrieval_errors: IntCounterVec,
}

impl ScrapeMetrics {
    fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let duration = Gauge::with_opts(Opts::new(
            fq_name(METRIC_NAMESPACE, "exporter", "scrape_duration_seconds"),
            "Duration of the last collection pass",
        ))?;
        let samples = IntGauge::with_opts(Opts::new(
            fq_name(METRIC_NAMESPACE, "exporter", "scrape_samples"),
            "Samples produced by the last collection pass",
        ))?;
        let retrieval_errors = IntCounterVec::new(
            Opts::new(
                fq_name(METRIC_NAMESPACE, "exporter", "retrieval_errors_total"),
                "Failed metric retrievals grouped by namespace and metric",
            ),
            &["namespace", "metric"],
        )?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(samples.clone()))?;
        registry.register(Box::new(retrieval_errors.clone()))?;
        Ok(Self {
            registry,
            duration,
            samples,
            retrieval_errors,
        })
    }

    fn names() -> [String; 3] {
        [
            fq_name(METRIC_NAMESPACE, "exporter", "scrape_duration_seconds"),
            fq_name(METRIC_NAMESPACE, "exporter", "scrape_samples"),
            fq_name(METRIC_NAMESPACE, "exporter", "retrieval_errors_total"),
        ]
    }
}

/// Registered descriptor set plus self-metrics.
pub struct Exposition {
    descriptors: Vec<Opts>,
    index: HashMap<String, usize>,
    scrape: ScrapeMetrics,
}

impl fmt::Debug for Exposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exposition")
            .field("descriptors", &self.descriptors.len())
            .finish()
    }
}

impl Exposition {
    /// Registers one gauge descriptor per catalog definition.
    pub fn new(catalog: &Catalog) -> Result<Self, ExpositionError> {
        let scratch = Registry::new();
        let mut names: HashSet<String> = ScrapeMetrics::names().into_iter().collect();
        let mut descriptors = Vec::with_capacity(catalog.len());
        let mut index = HashMap::with_capacity(catalog.len());

        for def in catalog.definitions() {
            if !names.insert(def.output_name.clone()) {
                return Err(CatalogError::DuplicateOutputName(def.output_name.clone()).into());
            }
            let opts = Opts::new(def.output_name.clone(), def.help.clone());
            let descriptor_error = |e: prometheus::Error| ExpositionError::Descriptor {
                name: def.output_name.clone(),
                reason: e.to_string(),
            };
            let gauge = GaugeVec::new(opts.clone(), &[INSTANCE_LABEL]).map_err(descriptor_error)?;
            scratch.register(Box::new(gauge)).map_err(descriptor_error)?;

            index.insert(def.output_name.clone(), descriptors.len());
            descriptors.push(opts);
        }

        let scrape = ScrapeMetrics::new().map_err(|e| ExpositionError::Descriptor {
            name: "exporter self-metrics".to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            descriptors,
            index,
            scrape,
        })
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Encodes a report in the Prometheus text format and updates the
    /// self-metrics.
    pub fn render(&self, report: &CollectionReport) -> Result<String, ExpositionError> {
        let registry = Registry::new();
        let mut gauges = Vec::with_capacity(self.descriptors.len());
        for opts in &self.descriptors {
            let descriptor_error = |e: prometheus::Error| ExpositionError::Descriptor {
                name: opts.name.clone(),
                reason: e.to_string(),
            };
            let gauge = GaugeVec::new(opts.clone(), &[INSTANCE_LABEL]).map_err(descriptor_error)?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(descriptor_error)?;
            gauges.push(gauge);
        }

        for sample in &report.samples {
            match self.index.get(&sample.metric) {
                Some(&i) => gauges[i]
                    .with_label_values(&[sample.instance_id.as_str()])
                    .set(sample.value),
                None => debug!(metric = %sample.metric, "sample without registered descriptor"),
            }
        }

        self.scrape.duration.set(report.elapsed.as_secs_f64());
        self.scrape.samples.set(report.samples.len() as i64);
        for failure in &report.failures {
            self.scrape
                .retrieval_errors
                .with_label_values(&[failure.namespace.as_str(), failure.metric.as_str()])
                .inc();
        }

        let mut families = registry.gather();
        families.extend(self.scrape.registry.gather());

        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buf)
            .map_err(|e| ExpositionError::Encode(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| ExpositionError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RetrievalError;
    use crate::catalog::CategoryId;
    use crate::collector::{RetrievalFailure, Sample};
    use crate::upstream::UpstreamError;
    use std::time::Duration;

    fn sample(metric: &str, id: &str, value: f64) -> Sample {
        Sample {
            metric: metric.to_string(),
            instance_id: id.to_string(),
            value,
            timestamp: 0,
        }
    }

    #[test]
    fn registers_full_descriptor_set() {
        let catalog = Catalog::builtin().unwrap();
        let exposition = Exposition::new(&catalog).unwrap();
        assert_eq!(exposition.descriptor_count(), catalog.len());
    }

    #[test]
    fn renders_instance_qps() {
        let exposition = Exposition::new(&Catalog::builtin().unwrap()).unwrap();
        let report = CollectionReport {
            samples: vec![sample("cloudmonitor_slb_instance_qps", "lb-1", 120.5)],
            failures: Vec::new(),
            elapsed: Duration::from_millis(250),
        };
        let text = exposition.render(&report).unwrap();

        assert!(text.contains(
            "# HELP cloudmonitor_slb_instance_qps Seven-layer protocol instance Queries-per-second\n"
        ));
        assert!(text.contains("# TYPE cloudmonitor_slb_instance_qps gauge\n"));
        assert!(text.contains("cloudmonitor_slb_instance_qps{id=\"lb-1\"} 120.5\n"));
        assert!(text.contains("cloudmonitor_exporter_scrape_duration_seconds 0.25\n"));
        assert!(text.contains("cloudmonitor_exporter_scrape_samples 1\n"));
    }

    #[test]
    fn metrics_without_samples_are_omitted() {
        let exposition = Exposition::new(&Catalog::builtin().unwrap()).unwrap();
        let report = CollectionReport {
            samples: vec![sample("cloudmonitor_rds_cpu_usage_average", "rm-1", 12.0)],
            ..CollectionReport::default()
        };
        let text = exposition.render(&report).unwrap();
        assert!(text.contains("cloudmonitor_rds_cpu_usage_average{id=\"rm-1\"} 12\n"));
        assert!(!text.contains("cloudmonitor_slb_instance_qps"));
    }

    #[test]
    fn render_does_not_leak_between_scrapes() {
        let exposition = Exposition::new(&Catalog::builtin().unwrap()).unwrap();
        let first = CollectionReport {
            samples: vec![sample("cloudmonitor_snat_connections", "ngw-old", 5.0)],
            ..CollectionReport::default()
        };
        let second = CollectionReport {
            samples: vec![sample("cloudmonitor_snat_connections", "ngw-new", 7.0)],
            ..CollectionReport::default()
        };
        exposition.render(&first).unwrap();
        let text = exposition.render(&second).unwrap();
        assert!(!text.contains("ngw-old"));
        assert!(text.contains("cloudmonitor_snat_connections{id=\"ngw-new\"} 7\n"));
    }

    #[test]
    fn failures_are_counted() {
        let exposition = Exposition::new(&Catalog::builtin().unwrap()).unwrap();
        let report = CollectionReport {
            failures: vec![RetrievalFailure {
                category: CategoryId::LoadBalancer,
                namespace: "acs_slb_dashboard".to_string(),
                metric: "Qps".to_string(),
                error: RetrievalError::Upstream(UpstreamError::Throttled("Throttling.User".into())),
            }],
            ..CollectionReport::default()
        };
        exposition.render(&report).unwrap();
        let text = exposition.render(&report).unwrap();
        assert!(text.contains(
            "cloudmonitor_exporter_retrieval_errors_total{metric=\"Qps\",namespace=\"acs_slb_dashboard\"} 2\n"
        ));
    }
}
