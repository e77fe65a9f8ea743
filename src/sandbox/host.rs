//! Host capabilities exposed to sandboxed functions.
//!
//! Everything a function can observe outside its own memory goes through
//! the single `env.host_call` import. Requests and responses are JSON; a
//! failed capability returns `{ok: false, kind, message}` with a stable
//! namespaced kind (`secrets.not_authorized`, `chain.insufficient_funds`)
//! so user code can catch and branch on it.

use std::sync::Arc;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::runtime::Handle;
use url::Url;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::database::methods::DbMethods as _;
use crate::database::Database;
use crate::error::{ErrorKind, ServiceError, ServiceResult};
use crate::gas_bank::GasBank;
use crate::oracle::OracleService;
use crate::secrets::{Actor, SecretsService};
use crate::transactions::{TransactionManager, TxIntent};

const MAX_RANDOM_BYTES: usize = 1024;

/// Shared service handles reachable from host calls. One per runtime;
/// cheap to clone into each execution's store.
pub struct HostCapabilities {
    pub database: Arc<Database>,
    pub secrets: Arc<SecretsService>,
    pub oracle: Arc<OracleService>,
    pub transactions: Arc<TransactionManager>,
    pub gas_bank: Arc<GasBank>,
    pub http: reqwest::Client,
    pub config: SandboxConfig,
}

/// Identity and grants of the execution a host call arrives from.
#[derive(Clone)]
pub struct ExecutionIdentity {
    pub execution_id: Uuid,
    pub owner_id: Uuid,
    pub declared_secrets: Vec<String>,
}

/// Dispatches one capability call. Runs on the sandbox's blocking thread;
/// async service calls are entered through the runtime handle.
pub fn dispatch(
    caps: &HostCapabilities,
    identity: &ExecutionIdentity,
    handle: &Handle,
    cap: &str,
    request: &Value,
) -> Value {
    let outcome = match cap {
        "secrets.get" => secrets_get(caps, identity, handle, request),
        "http.fetch" => http_fetch(caps, handle, request),
        "crypto.sha256" => crypto_sha256(request),
        "crypto.random_bytes" => crypto_random_bytes(request),
        "oracle.fetch" => oracle_fetch(caps, handle, request),
        "chain.invoke" => chain_invoke(caps, identity, handle, request),
        "random.request" => random_request(caps, identity, handle, request),
        other => Err(ServiceError::invalid(format!(
            "unknown capability {other:?}"
        ))),
    };

    match outcome {
        Ok(value) => json!({ "ok": true, "value": value }),
        Err(err) => json!({
            "ok": false,
            "kind": capability_kind(cap, err.kind),
            "message": err.message,
        }),
    }
}

/// `<namespace>.<kind>`, with `forbidden` surfaced as the historical
/// `not_authorized`.
fn capability_kind(cap: &str, kind: ErrorKind) -> String {
    let namespace = cap.split('.').next().unwrap_or(cap);
    let kind = match kind {
        ErrorKind::Forbidden => "not_authorized",
        other => other.as_str(),
    };

    format!("{namespace}.{kind}")
}

fn str_field<'a>(request: &'a Value, key: &str) -> ServiceResult<&'a str> {
    request
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::invalid(format!("missing field {key:?}")))
}

fn secrets_get(
    caps: &HostCapabilities,
    identity: &ExecutionIdentity,
    handle: &Handle,
    request: &Value,
) -> ServiceResult<Value> {
    let name = str_field(request, "name")?;
    let actor = Actor::execution(identity.execution_id);

    let plaintext = handle.block_on(caps.secrets.brokered_fetch(
        identity.owner_id,
        name,
        &identity.declared_secrets,
        &actor,
    ))?;

    Ok(Value::String(plaintext.to_string()))
}

fn http_fetch(caps: &HostCapabilities, handle: &Handle, request: &Value) -> ServiceResult<Value> {
    let url = str_field(request, "url")?;
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET");

    let parsed = Url::parse(url).map_err(|_| ServiceError::invalid("invalid url"))?;

    if parsed.scheme() != "https" {
        return Err(ServiceError::forbidden("only https urls are allowed"));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| ServiceError::invalid("url has no host"))?;

    let allowed = caps
        .config
        .http_allow_list
        .0
        .iter()
        .any(|entry| entry == host);
    if !allowed {
        return Err(ServiceError::forbidden(format!(
            "host {host:?} is not in the allow list"
        )));
    }

    let builder = match method {
        "GET" => caps.http.get(parsed.clone()),
        "POST" => caps.http.post(parsed.clone()),
        "PUT" => caps.http.put(parsed.clone()),
        "DELETE" => caps.http.delete(parsed.clone()),
        other => {
            return Err(ServiceError::invalid(format!(
                "method {other:?} is not allowed"
            )))
        }
    };

    let mut builder = builder.timeout(caps.config.fetch_timeout);

    if let Some(headers) = request.get("headers").and_then(Value::as_object) {
        for (name, value) in headers {
            if let Some(value) = value.as_str() {
                builder = builder.header(name, value);
            }
        }
    }

    if let Some(body) = request.get("body").and_then(Value::as_str) {
        builder = builder.body(body.to_string());
    }

    let max_bytes = caps.config.max_fetch_response_bytes;

    handle.block_on(async move {
        let response = builder
            .send()
            .await
            .map_err(|err| ServiceError::unavailable(format!("fetch failed: {err}")))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| ServiceError::unavailable(format!("fetch failed: {err}")))?;

        if body.len() > max_bytes {
            return Err(ServiceError::new(
                ErrorKind::ResourceExceeded,
                format!("response exceeds {max_bytes} bytes"),
            ));
        }

        Ok(json!({
            "status": status,
            "body": String::from_utf8_lossy(&body).into_owned(),
        }))
    })
}

fn crypto_sha256(request: &Value) -> ServiceResult<Value> {
    let digest = if let Some(data) = request.get("data").and_then(Value::as_str) {
        Sha256::digest(data.as_bytes())
    } else if let Some(hex_data) = request.get("hex").and_then(Value::as_str) {
        let bytes = hex::decode(hex_data)
            .map_err(|_| ServiceError::invalid("field \"hex\" is not valid hex"))?;
        Sha256::digest(&bytes)
    } else {
        return Err(ServiceError::invalid("missing field \"data\" or \"hex\""));
    };

    Ok(Value::String(hex::encode(digest)))
}

fn crypto_random_bytes(request: &Value) -> ServiceResult<Value> {
    let n = request
        .get("n")
        .and_then(Value::as_u64)
        .ok_or_else(|| ServiceError::invalid("missing field \"n\""))? as usize;

    if n == 0 || n > MAX_RANDOM_BYTES {
        return Err(ServiceError::invalid(format!(
            "n must be between 1 and {MAX_RANDOM_BYTES}"
        )));
    }

    let mut bytes = vec![0u8; n];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);

    Ok(Value::String(hex::encode(bytes)))
}

fn oracle_fetch(caps: &HostCapabilities, handle: &Handle, request: &Value) -> ServiceResult<Value> {
    let source = str_field(request, "source")?;

    handle.block_on(caps.oracle.fetch_by_name(source))
}

/// Reserves the network fee, registers the intent with the transaction
/// manager and hands the id back. The function cannot wait for
/// confirmation inside the same execution.
fn chain_invoke(
    caps: &HostCapabilities,
    identity: &ExecutionIdentity,
    handle: &Handle,
    request: &Value,
) -> ServiceResult<Value> {
    if !request.is_object() {
        return Err(ServiceError::invalid("intent must be an object"));
    }

    str_field(request, "contract")?;
    str_field(request, "method")?;

    handle.block_on(async {
        let account = caps
            .gas_bank
            .primary_account(identity.owner_id)
            .await?
            .ok_or_else(|| {
                ServiceError::insufficient_funds("no gas account for this user")
            })?;

        let reservation = caps
            .gas_bank
            .reserve(
                identity.owner_id,
                &account.address,
                caps.gas_bank.config().tx_fee_reserve,
                &format!("chain.invoke:{}", identity.execution_id),
            )
            .await?;

        let row = caps
            .transactions
            .create(TxIntent {
                service: "functions".to_string(),
                owner: identity.owner_id,
                entity_ref: Some(format!("execution:{}", identity.execution_id)),
                payload: request.clone(),
                gas_reservation: Some(reservation.id),
            })
            .await?;

        Ok(json!({ "transaction_id": row.id }))
    })
}

fn random_request(
    caps: &HostCapabilities,
    identity: &ExecutionIdentity,
    handle: &Handle,
    request: &Value,
) -> ServiceResult<Value> {
    let contract = str_field(request, "contract")?;
    let request_id = str_field(request, "request_id")?;
    let seed = str_field(request, "seed")?;
    let num_words = request
        .get("num_words")
        .and_then(Value::as_u64)
        .ok_or_else(|| ServiceError::invalid("missing field \"num_words\""))?;

    if num_words == 0 || num_words > 64 {
        return Err(ServiceError::invalid("num_words must be between 1 and 64"));
    }

    handle.block_on(async {
        let row = caps
            .database
            .pool
            .insert_random_request(
                Uuid::new_v4(),
                identity.owner_id,
                contract,
                request_id,
                num_words as i64,
                seed,
            )
            .await
            .map_err(|err| {
                if err.is_unique_violation() {
                    ServiceError::conflict(format!(
                        "request {request_id:?} already exists for this contract"
                    ))
                } else {
                    err.into()
                }
            })?;

        Ok(json!({ "request_id": row.id }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_kinds_are_namespaced() {
        assert_eq!(
            capability_kind("secrets.get", ErrorKind::Forbidden),
            "secrets.not_authorized"
        );
        assert_eq!(
            capability_kind("oracle.fetch", ErrorKind::Unavailable),
            "oracle.unavailable"
        );
        assert_eq!(
            capability_kind("chain.invoke", ErrorKind::InsufficientFunds),
            "chain.insufficient_funds"
        );
    }

    #[test]
    fn sha256_of_utf8_data() {
        let value = crypto_sha256(&json!({ "data": "abc" })).unwrap();
        assert_eq!(
            value,
            json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn sha256_rejects_bad_hex() {
        assert!(crypto_sha256(&json!({ "hex": "zz" })).is_err());
        assert!(crypto_sha256(&json!({})).is_err());
    }

    #[test]
    fn random_bytes_bounds() {
        assert!(crypto_random_bytes(&json!({ "n": 0 })).is_err());
        assert!(crypto_random_bytes(&json!({ "n": 2000 })).is_err());

        let value = crypto_random_bytes(&json!({ "n": 16 })).unwrap();
        assert_eq!(value.as_str().unwrap().len(), 32);
    }
}
