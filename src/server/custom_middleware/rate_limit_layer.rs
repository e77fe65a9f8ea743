use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::error::{ErrorKind, ServiceError};
use crate::server::data::AuthUser;
use crate::server::error::Error;

const WINDOW_SECS: u64 = 60;

/// Fixed-window throttle keyed by resolved identity. Runs after the auth
/// layer so the key is the user, not the socket.
pub struct RateLimiter {
    per_minute: u32,
    windows: Mutex<HashMap<Uuid, (Instant, u32)>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(per_minute: u32) -> Arc<Self> {
        Arc::new(Self {
            per_minute,
            windows: Mutex::new(HashMap::new()),
        })
    }

    /// Accounts one request; returns the remaining budget or None when
    /// the window is exhausted.
    fn check(&self, user_id: Uuid) -> Option<u32> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();

        let entry = windows.entry(user_id).or_insert((now, 0));
        if now.duration_since(entry.0).as_secs() >= WINDOW_SECS {
            *entry = (now, 0);
        }

        if entry.1 >= self.per_minute {
            return None;
        }

        entry.1 += 1;
        Some(self.per_minute - entry.1)
    }
}

pub async fn middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let Some(user) = request.extensions().get::<AuthUser>().cloned() else {
        // Unauthenticated routes are not throttled here.
        return Ok(next.run(request).await);
    };

    let Some(remaining) = limiter.check(user.user_id) else {
        return Err(Error(ServiceError::new(
            ErrorKind::RateLimited,
            format!("limit of {} requests per minute exceeded", limiter.per_minute),
        )));
    };

    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert(
        "x-ratelimit-limit",
        HeaderValue::from_str(&limiter.per_minute.to_string()).unwrap(),
    );
    headers.insert(
        "x-ratelimit-remaining",
        HeaderValue::from_str(&remaining.to_string()).unwrap(),
    );

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_exhausts_and_replenishes_per_user() {
        let limiter = RateLimiter::new(2);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        assert_eq!(limiter.check(alice), Some(1));
        assert_eq!(limiter.check(alice), Some(0));
        assert_eq!(limiter.check(alice), None);

        // Other identities have their own window.
        assert_eq!(limiter.check(bob), Some(1));
    }
}
