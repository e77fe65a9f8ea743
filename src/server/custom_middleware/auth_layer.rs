use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::app::App;
use crate::error::{ErrorKind, ServiceError};
use crate::server::data::AuthUser;
use crate::server::error::Error;

/// Resolves the caller's identity from `Authorization: Bearer <key>` or
/// `X-API-Key` and injects an [`AuthUser`] into request extensions. The
/// token itself never travels further into the application.
pub async fn middleware(
    State(app): State<Arc<App>>,
    mut request: Request,
    next: Next,
) -> Result<Response, Error> {
    let api_key = extract_api_key(&request).ok_or_else(|| {
        Error(ServiceError::new(
            ErrorKind::Unauthorized,
            "missing api key",
        ))
    })?;

    let user = app.resolve_api_key(&api_key).await?;

    request.extensions_mut().insert(AuthUser {
        user_id: user.id,
        handle: user.handle,
    });

    Ok(next.run(request).await)
}

fn extract_api_key(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get("authorization") {
        let value = value.to_str().ok()?;
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
}
