use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ServiceError;
use crate::server::error::Error;

/// Bounds every request by the configured serve timeout. Side effects
/// already committed by the handler are preserved; only the response is
/// abandoned.
pub async fn middleware(
    State(serve_timeout): State<Duration>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    match tokio::time::timeout(serve_timeout, next.run(request)).await {
        Ok(response) => Ok(response),
        Err(_) => Err(Error(ServiceError::timeout(format!(
            "request exceeded {}s",
            serve_timeout.as_secs()
        )))),
    }
}
