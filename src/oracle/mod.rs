//! Oracle data sources: named HTTP endpoints with a JSON-path extraction
//! and an optional transform. Consumed synchronously by the sandbox's
//! `oracle.fetch` capability and asynchronously through the public
//! request/callback API.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::config::OracleConfig;
use crate::database::methods::DbMethods as _;
use crate::database::types::{OracleRequestRow, OracleRequestStatus, OracleSourceRow};
use crate::database::Database;
use crate::error::{ServiceError, ServiceResult};

const WORKER_BATCH: i64 = 16;
const WORKER_IDLE: Duration = Duration::from_secs(2);

/// How the extracted value is shaped before it is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// The extracted JSON value as-is.
    None,
    /// The raw response body as a string, extraction skipped.
    Raw,
    /// Coerced to a number (strings are parsed).
    Number,
    /// Coerced to a string.
    String,
}

impl FromStr for Transform {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "raw" => Ok(Self::Raw),
            "number" => Ok(Self::Number),
            "string" => Ok(Self::String),
            other => Err(ServiceError::invalid(format!("unknown transform {other:?}"))),
        }
    }
}

pub struct OracleService {
    database: Arc<Database>,
    http: reqwest::Client,
    config: OracleConfig,
}

impl OracleService {
    pub fn new(database: Arc<Database>, config: OracleConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()?;

        Ok(Self {
            database,
            http,
            config,
        })
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(level = "debug", skip(self, headers))]
    pub async fn create_source(
        &self,
        owner_id: Option<Uuid>,
        name: &str,
        url: &str,
        method: &str,
        headers: Value,
        json_path: &str,
        transform: &str,
    ) -> ServiceResult<OracleSourceRow> {
        validate_source(name, url, method, transform)?;

        self.database
            .pool
            .insert_oracle_source(
                Uuid::new_v4(),
                owner_id,
                name,
                url,
                method,
                &headers,
                json_path,
                transform,
            )
            .await
            .map_err(|err| {
                if err.is_unique_violation() {
                    ServiceError::conflict(format!("oracle source {name:?} already exists"))
                } else {
                    err.into()
                }
            })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_source(
        &self,
        id: Uuid,
        url: &str,
        method: &str,
        headers: Value,
        json_path: &str,
        transform: &str,
        active: bool,
    ) -> ServiceResult<OracleSourceRow> {
        validate_source("x", url, method, transform)?;

        self.database
            .pool
            .update_oracle_source(id, url, method, &headers, json_path, transform, active)
            .await?
            .ok_or_else(|| ServiceError::not_found("oracle source does not exist"))
    }

    pub async fn delete_source(&self, id: Uuid) -> ServiceResult<()> {
        if self.database.pool.delete_oracle_source(id).await? {
            Ok(())
        } else {
            Err(ServiceError::not_found("oracle source does not exist"))
        }
    }

    pub async fn get_source(&self, id: Uuid) -> ServiceResult<OracleSourceRow> {
        self.database
            .pool
            .get_oracle_source(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("oracle source does not exist"))
    }

    pub async fn list_sources(&self, offset: i64, limit: i64) -> ServiceResult<Vec<OracleSourceRow>> {
        Ok(self.database.pool.list_oracle_sources(offset, limit).await?)
    }

    /// Synchronous fetch on behalf of the sandbox runtime.
    #[instrument(level = "debug", skip(self))]
    pub async fn fetch_by_name(&self, name: &str) -> ServiceResult<Value> {
        let source = self
            .database
            .pool
            .get_oracle_source_by_name(name)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("oracle source {name:?} does not exist")))?;

        if !source.active {
            return Err(ServiceError::unavailable(format!(
                "oracle source {name:?} is disabled"
            )));
        }

        self.fetch_source(&source).await
    }

    /// Enqueues an asynchronous oracle request.
    pub async fn request(
        &self,
        source_name: &str,
        requester_id: Option<Uuid>,
        callback_url: Option<&str>,
    ) -> ServiceResult<OracleRequestRow> {
        let source = self
            .database
            .pool
            .get_oracle_source_by_name(source_name)
            .await?
            .ok_or_else(|| {
                ServiceError::not_found(format!("oracle source {source_name:?} does not exist"))
            })?;

        if let Some(callback) = callback_url {
            let url = Url::parse(callback)
                .map_err(|_| ServiceError::invalid("callback_url is not a valid url"))?;
            if url.scheme() != "https" && url.scheme() != "http" {
                return Err(ServiceError::invalid("callback_url must be http(s)"));
            }
        }

        Ok(self
            .database
            .pool
            .insert_oracle_request(Uuid::new_v4(), source.id, requester_id, callback_url)
            .await?)
    }

    pub async fn get_request(&self, id: Uuid) -> ServiceResult<OracleRequestRow> {
        self.database
            .pool
            .get_oracle_request(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("oracle request does not exist"))
    }

    /// Drains pending requests. Runs until cancelled by the task monitor.
    pub async fn run_request_worker(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            let claimed = self
                .database
                .pool
                .claim_pending_oracle_requests(WORKER_BATCH)
                .await?;

            if claimed.is_empty() {
                tokio::time::sleep(WORKER_IDLE).await;
                continue;
            }

            for request in claimed {
                self.process_request(request).await?;
            }
        }
    }

    #[instrument(level = "debug", skip(self, request), fields(request_id = %request.id))]
    async fn process_request(&self, request: OracleRequestRow) -> anyhow::Result<()> {
        let source = self
            .database
            .pool
            .get_oracle_source(request.source_id)
            .await?;

        let outcome = match source {
            Some(source) if source.active => self.fetch_source(&source).await,
            Some(_) => Err(ServiceError::unavailable("oracle source is disabled")),
            None => Err(ServiceError::not_found("oracle source was deleted")),
        };

        let (status, result, error) = match &outcome {
            Ok(value) => (OracleRequestStatus::Completed, Some(value.clone()), None),
            Err(err) => (
                OracleRequestStatus::Failed,
                None,
                Some(err.to_string()),
            ),
        };

        self.database
            .pool
            .complete_oracle_request(request.id, status, result.as_ref(), error.as_deref())
            .await?;

        if let Some(callback_url) = &request.callback_url {
            self.deliver_callback(request.id, callback_url, status, result.as_ref())
                .await;
        }

        Ok(())
    }

    async fn deliver_callback(
        &self,
        request_id: Uuid,
        callback_url: &str,
        status: OracleRequestStatus,
        result: Option<&Value>,
    ) {
        let body = serde_json::json!({
            "request_id": request_id,
            "status": status,
            "result": result,
        });

        match self.http.post(callback_url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                info!(%request_id, callback_url, "Delivered oracle callback");
            }
            Ok(response) => {
                warn!(%request_id, callback_url, status = %response.status(),
                    "Oracle callback rejected");
            }
            Err(err) => {
                warn!(%request_id, callback_url, ?err, "Oracle callback failed");
            }
        }
    }

    async fn fetch_source(&self, source: &OracleSourceRow) -> ServiceResult<Value> {
        let mut request = match source.method.as_str() {
            "GET" => self.http.get(&source.url),
            "POST" => self.http.post(&source.url),
            other => {
                return Err(ServiceError::invalid(format!(
                    "oracle source method {other:?} is not supported"
                )))
            }
        };

        if let Some(headers) = source.headers.as_object() {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }

        let response = request
            .send()
            .await
            .map_err(|err| ServiceError::unavailable(format!("oracle fetch failed: {err}")))?;

        if !response.status().is_success() {
            return Err(ServiceError::unavailable(format!(
                "oracle source returned {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| ServiceError::unavailable(format!("oracle fetch failed: {err}")))?;

        if body.len() > self.config.max_response_bytes {
            return Err(ServiceError::new(
                crate::error::ErrorKind::ResourceExceeded,
                format!("oracle response exceeds {} bytes", self.config.max_response_bytes),
            ));
        }

        let transform: Transform = source.transform.parse()?;

        if transform == Transform::Raw {
            let text = String::from_utf8_lossy(&body).into_owned();
            return Ok(Value::String(text));
        }

        let parsed: Value = serde_json::from_slice(&body)
            .map_err(|_| ServiceError::invalid("oracle response is not valid JSON"))?;

        let extracted = extract_json_path(&parsed, &source.json_path).ok_or_else(|| {
            ServiceError::invalid(format!(
                "json path {:?} not present in oracle response",
                source.json_path
            ))
        })?;

        apply_transform(extracted, transform)
    }
}

fn validate_source(name: &str, url: &str, method: &str, transform: &str) -> ServiceResult<()> {
    if name.is_empty() || name.len() > 256 {
        return Err(ServiceError::invalid("source name must be 1-256 characters"));
    }

    let parsed = Url::parse(url).map_err(|_| ServiceError::invalid("source url is invalid"))?;
    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        return Err(ServiceError::invalid("source url must be http(s)"));
    }

    if method != "GET" && method != "POST" {
        return Err(ServiceError::invalid("source method must be GET or POST"));
    }

    Transform::from_str(transform)?;

    Ok(())
}

/// Walks a dotted path ("data.quotes.0.price") through a JSON value. An
/// empty path selects the whole document.
fn extract_json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

fn apply_transform(value: &Value, transform: Transform) -> ServiceResult<Value> {
    match transform {
        Transform::None => Ok(value.clone()),
        Transform::Raw => Ok(value.clone()),
        Transform::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| ServiceError::invalid("oracle value is not numeric")),
            _ => Err(ServiceError::invalid("oracle value is not numeric")),
        },
        Transform::String => match value {
            Value::String(_) => Ok(value.clone()),
            other => Ok(Value::String(other.to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test]
    fn extracts_nested_paths() {
        let doc = json!({
            "data": {
                "quotes": [
                    { "pair": "NEO/GAS", "price": 10.5 },
                    { "pair": "NEO/USD", "price": 12.1 },
                ]
            }
        });

        assert_eq!(
            extract_json_path(&doc, "data.quotes.1.price"),
            Some(&json!(12.1))
        );
        assert_eq!(extract_json_path(&doc, ""), Some(&doc));
        assert_eq!(extract_json_path(&doc, "data.missing"), None);
        assert_eq!(extract_json_path(&doc, "data.quotes.7"), None);
    }

    #[test]
    fn number_transform_parses_strings() {
        let value = apply_transform(&json!("10.25"), Transform::Number).unwrap();
        assert_eq!(value, json!(10.25));

        assert!(apply_transform(&json!({"a": 1}), Transform::Number).is_err());
    }

    #[test]
    fn string_transform_stringifies() {
        assert_eq!(
            apply_transform(&json!(10.25), Transform::String).unwrap(),
            json!("10.25")
        );
        assert_eq!(
            apply_transform(&json!("already"), Transform::String).unwrap(),
            json!("already")
        );
    }

    #[test_case("prices", "https://api.example.com/v1", "GET", "none" => true)]
    #[test_case("prices", "ftp://api.example.com", "GET", "none" => false)]
    #[test_case("prices", "https://api.example.com", "PATCH", "none" => false)]
    #[test_case("prices", "https://api.example.com", "GET", "bogus" => false)]
    #[test_case("", "https://api.example.com", "GET", "none" => false)]
    fn source_validation(name: &str, url: &str, method: &str, transform: &str) -> bool {
        validate_source(name, url, method, transform).is_ok()
    }
}
