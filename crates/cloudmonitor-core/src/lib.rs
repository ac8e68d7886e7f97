//! cloudmonitor-core: Aliyun CloudMonitor to Prometheus bridge.
//!
//! Provides:
//! - `catalog`: which upstream metrics are exported, under which names
//! - `upstream`: CloudMonitor API trait, HTTPS client and test mock
//! - `adapter`: per-namespace retrieval and value selection
//! - `collector`: collection pass with task-per-metric fan-out
//! - `exposition`: Prometheus text encoding of collection reports
//!
//! With `aliyun` feature (default):
//! - `upstream::aliyun`: signed `DescribeMetricLast` client
//!
//! With `api` feature:
//! - OpenAPI schemas for the catalog types

pub mod adapter;
pub mod catalog;
pub mod collector;
pub mod exposition;
pub mod upstream;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
