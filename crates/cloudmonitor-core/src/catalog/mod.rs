//! Metric catalog: which upstream metrics exist per resource category and how
//! each one is republished.
//!
//! The catalog is built once at startup from the static tables in [`tables`]
//! and validated before anything is registered with the exposition layer.
//! Lookups afterwards are pure.
//!
//! ```
//! use cloudmonitor_core::catalog::{Catalog, CategoryId, ValueSelector};
//!
//! let catalog = Catalog::builtin().unwrap();
//! let def = catalog.lookup(CategoryId::LoadBalancer, "InstanceQps").unwrap();
//! assert_eq!(def.output_name, "cloudmonitor_slb_instance_qps");
//! assert_eq!(def.selector, ValueSelector::Average);
//! ```

mod tables;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

pub(crate) use tables::{BUILTIN, CategorySpec, EntrySpec};

/// Prefix shared by every exported metric name.
pub const METRIC_NAMESPACE: &str = "cloudmonitor";

/// Monitored resource type. Declaration order is collection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum CategoryId {
    NatGateway,
    LoadBalancer,
    Database,
}

impl CategoryId {
    pub const ALL: [CategoryId; 3] = [
        CategoryId::NatGateway,
        CategoryId::LoadBalancer,
        CategoryId::Database,
    ];

    /// Short name used on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryId::NatGateway => "nat",
            CategoryId::LoadBalancer => "slb",
            CategoryId::Database => "rds",
        }
    }
}

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CategoryId {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nat" | "nat_gateway" => Ok(CategoryId::NatGateway),
            "slb" | "load_balancer" => Ok(CategoryId::LoadBalancer),
            "rds" | "database" => Ok(CategoryId::Database),
            other => Err(CatalogError::UnknownCategory(other.to_string())),
        }
    }
}

/// Unit of the republished value. Informational; values are not rescaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Bytes,
    Percent,
    Count,
    Seconds,
    None,
}

/// Which statistic of an upstream data point becomes the sample value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub enum ValueSelector {
    Average,
    Maximum,
    Value,
}

/// How one upstream metric is republished.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct MetricDefinition {
    /// Fully-qualified exported name, e.g. `cloudmonitor_slb_instance_qps`.
    pub output_name: String,
    pub help: String,
    pub unit: Unit,
    pub selector: ValueSelector,
}

/// Upstream metric name paired with its definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct CatalogEntry {
    pub upstream_name: String,
    pub definition: MetricDefinition,
}

/// All entries of one monitoring namespace, in collection order.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct ResourceCategory {
    pub id: CategoryId,
    /// CloudMonitor namespace, e.g. `acs_slb_dashboard`.
    pub namespace: String,
    entries: Vec<CatalogEntry>,
}

impl ResourceCategory {
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn definition(&self, upstream_name: &str) -> Option<&MetricDefinition> {
        self.entries
            .iter()
            .find(|e| e.upstream_name == upstream_name)
            .map(|e| &e.definition)
    }
}

/// Errors raised while building or querying the catalog.
///
/// Construction errors are programmer errors and abort startup.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogError {
    /// No definition for this metric in this category.
    NotFound { category: CategoryId, metric: String },
    /// Category not present (disabled or unknown).
    CategoryNotFound(CategoryId),
    /// Category name could not be parsed.
    UnknownCategory(String),
    /// Two definitions export the same name.
    DuplicateOutputName(String),
    /// A category lists the same upstream metric twice.
    DuplicateUpstreamName { namespace: String, metric: String },
    /// Output name is not a valid Prometheus metric name.
    InvalidOutputName(String),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::NotFound { category, metric } => {
                write!(f, "no definition for metric {} in category {}", metric, category)
            }
            CatalogError::CategoryNotFound(id) => write!(f, "category {} is not enabled", id),
            CatalogError::UnknownCategory(name) => {
                write!(f, "unknown category '{}' (expected nat, slb or rds)", name)
            }
            CatalogError::DuplicateOutputName(name) => {
                write!(f, "duplicate output metric name {}", name)
            }
            CatalogError::DuplicateUpstreamName { namespace, metric } => {
                write!(f, "metric {} listed twice in namespace {}", metric, namespace)
            }
            CatalogError::InvalidOutputName(name) => {
                write!(f, "invalid metric name '{}'", name)
            }
        }
    }
}

impl std::error::Error for CatalogError {}

/// Validated set of resource categories.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct Catalog {
    categories: Vec<ResourceCategory>,
}

impl Catalog {
    /// Builds the catalog of NAT gateway, load balancer and database metrics.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_specs(BUILTIN)
    }

    pub(crate) fn from_specs(specs: &[CategorySpec]) -> Result<Self, CatalogError> {
        let mut output_names = HashSet::new();
        let mut categories = Vec::with_capacity(specs.len());

        for spec in specs {
            let mut upstream_names = HashSet::new();
            let mut entries = Vec::with_capacity(spec.entries.len());

            for entry in spec.entries {
                if !upstream_names.insert(entry.upstream) {
                    return Err(CatalogError::DuplicateUpstreamName {
                        namespace: spec.namespace.to_string(),
                        metric: entry.upstream.to_string(),
                    });
                }

                let output_name = fq_name(METRIC_NAMESPACE, spec.subsystem, entry.name);
                if !is_valid_metric_name(&output_name) {
                    return Err(CatalogError::InvalidOutputName(output_name));
                }
                if !output_names.insert(output_name.clone()) {
                    return Err(CatalogError::DuplicateOutputName(output_name));
                }

                entries.push(CatalogEntry {
                    upstream_name: entry.upstream.to_string(),
                    definition: MetricDefinition {
                        output_name,
                        help: entry.help.to_string(),
                        unit: entry.unit,
                        selector: entry.selector,
                    },
                });
            }

            categories.push(ResourceCategory {
                id: spec.id,
                namespace: spec.namespace.to_string(),
                entries,
            });
        }

        Ok(Self { categories })
    }

    /// Keeps only the listed categories, preserving catalog order.
    pub fn restrict_to(mut self, enabled: &[CategoryId]) -> Self {
        self.categories.retain(|c| enabled.contains(&c.id));
        self
    }

    pub fn categories(&self) -> &[ResourceCategory] {
        &self.categories
    }

    pub fn category(&self, id: CategoryId) -> Result<&ResourceCategory, CatalogError> {
        self.categories
            .iter()
            .find(|c| c.id == id)
            .ok_or(CatalogError::CategoryNotFound(id))
    }

    pub fn lookup(&self, id: CategoryId, metric: &str) -> Result<&MetricDefinition, CatalogError> {
        self.category(id)?
            .definition(metric)
            .ok_or_else(|| CatalogError::NotFound {
                category: id,
                metric: metric.to_string(),
            })
    }

    /// Every definition, in collection order.
    pub fn definitions(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.categories
            .iter()
            .flat_map(|c| c.entries.iter().map(|e| &e.definition))
    }

    /// Total number of entries across categories.
    pub fn len(&self) -> usize {
        self.categories.iter().map(|c| c.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Joins non-empty name parts with `_`, like Prometheus client libraries do.
pub fn fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
