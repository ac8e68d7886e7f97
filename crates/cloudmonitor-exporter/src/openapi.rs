//! OpenAPI documentation definition.

use cloudmonitor_core::catalog::{
    Catalog, CatalogEntry, CategoryId, MetricDefinition, ResourceCategory, Unit, ValueSelector,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(crate::handlers::handle_health, crate::handlers::handle_catalog),
    components(schemas(
        Catalog,
        ResourceCategory,
        CatalogEntry,
        MetricDefinition,
        CategoryId,
        Unit,
        ValueSelector,
    )),
    info(title = "cloudmonitor-exporter", description = "CloudMonitor to Prometheus exporter")
)]
pub(crate) struct ApiDoc;
