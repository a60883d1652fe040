use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;

use crate::billing::{self, BillingService};

async fn root() -> &'static str {
    "Booking API"
}

pub fn api_routes() -> Router {
    Router::new().merge(billing::routes())
}

/// Full HTTP surface: health root, Prometheus scrape endpoint and the API routes.
///
/// Installs the global metrics recorder, so call it once per process.
pub fn app(billing: BillingService) -> Router {
    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(billing))
}
