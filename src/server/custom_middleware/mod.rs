pub mod api_metrics_layer;
pub mod auth_layer;
pub mod logging_layer;
pub mod rate_limit_layer;
pub mod timeout_layer;
