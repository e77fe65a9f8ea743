use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use crate::config::ChainConfig;
use crate::error::{ServiceError, ServiceResult};

pub mod dev;
pub mod scanner;

/// A transaction as seen by the chain. `block_height` is set once the
/// transaction has been included in a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxInfo {
    pub hash: String,
    pub block_height: Option<u64>,
    pub fee_paid: Option<i64>,
}

/// A decoded contract notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub contract: String,
    pub event_name: String,
    pub block_height: u64,
    pub tx_hash: String,
    pub state: serde_json::Value,
}

/// The narrow blockchain-client contract the core depends on. The node,
/// its transaction encoding and its event indexing all live behind this
/// seam.
#[async_trait]
pub trait NeoRpc: Send + Sync {
    async fn get_block_height(&self) -> ServiceResult<u64>;

    async fn get_transaction(&self, hash: &str) -> ServiceResult<Option<TxInfo>>;

    /// Broadcasts signed bytes, returning the assigned transaction hash.
    async fn send_raw(&self, bytes: &[u8]) -> ServiceResult<String>;

    async fn is_in_mempool(&self, hash: &str) -> ServiceResult<bool>;

    /// Contract notifications for a closed block range.
    async fn get_events(
        &self,
        contract: &str,
        event_name: &str,
        from_block: u64,
        to_block: u64,
    ) -> ServiceResult<Vec<ChainEvent>>;
}

/// JSON-RPC client for a Neo-N3 node (with the ApplicationLogs plugin for
/// event queries).
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct RpcEnvelope {
    result: Option<serde_json::Value>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcClient {
    pub fn new(config: &ChainConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()?;

        Ok(Self {
            http,
            url: config.rpc_url.expose().to_string(),
        })
    }

    #[instrument(skip(self, params), level = "debug")]
    async fn call(&self, method: &str, params: serde_json::Value) -> ServiceResult<serde_json::Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| ServiceError::unavailable(format!("rpc {method}: {err}")))?;

        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|err| ServiceError::unavailable(format!("rpc {method}: {err}")))?;

        if let Some(err) = envelope.error {
            debug!(method, code = err.code, message = %err.message, "rpc error");
            return Err(ServiceError::unavailable(format!(
                "rpc {method} failed ({}): {}",
                err.code, err.message
            )));
        }

        envelope
            .result
            .ok_or_else(|| ServiceError::unavailable(format!("rpc {method}: empty result")))
    }
}

#[async_trait]
impl NeoRpc for RpcClient {
    async fn get_block_height(&self) -> ServiceResult<u64> {
        let result = self.call("getblockcount", json!([])).await?;

        let count = result
            .as_u64()
            .ok_or_else(|| ServiceError::internal("getblockcount returned a non-integer"))?;

        // Block count is one past the index of the latest block.
        Ok(count.saturating_sub(1))
    }

    async fn get_transaction(&self, hash: &str) -> ServiceResult<Option<TxInfo>> {
        let result = match self.call("getrawtransaction", json!([hash, true])).await {
            Ok(result) => result,
            // The node reports unknown transactions as an error.
            Err(err) if err.message.contains("Unknown transaction") => return Ok(None),
            Err(err) => return Err(err),
        };

        let block_height = result.get("blockindex").and_then(serde_json::Value::as_u64);
        let net_fee = fee_field(&result, "netfee");
        let sys_fee = fee_field(&result, "sysfee");
        let fee_paid = match (net_fee, sys_fee) {
            (None, None) => None,
            (net, sys) => Some(net.unwrap_or(0) + sys.unwrap_or(0)),
        };

        Ok(Some(TxInfo {
            hash: hash.to_string(),
            block_height,
            fee_paid,
        }))
    }

    async fn send_raw(&self, bytes: &[u8]) -> ServiceResult<String> {
        use base64::Engine as _;

        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        let result = self.call("sendrawtransaction", json!([encoded])).await?;

        result
            .get("hash")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ServiceError::internal("sendrawtransaction returned no hash"))
    }

    async fn is_in_mempool(&self, hash: &str) -> ServiceResult<bool> {
        let result = self.call("getrawmempool", json!([])).await?;

        let hashes = result
            .as_array()
            .ok_or_else(|| ServiceError::internal("getrawmempool returned a non-array"))?;

        Ok(hashes.iter().any(|h| h.as_str() == Some(hash)))
    }

    async fn get_events(
        &self,
        contract: &str,
        event_name: &str,
        from_block: u64,
        to_block: u64,
    ) -> ServiceResult<Vec<ChainEvent>> {
        let mut events = Vec::new();

        for block in from_block..=to_block {
            let result = self.call("getblocknotifications", json!([block])).await?;

            let Some(notifications) = result.get("notifications").and_then(|n| n.as_array())
            else {
                continue;
            };

            for notification in notifications {
                let n_contract = notification
                    .get("contract")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                let n_event = notification
                    .get("eventname")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();

                if !n_contract.eq_ignore_ascii_case(contract) || n_event != event_name {
                    continue;
                }

                events.push(ChainEvent {
                    contract: n_contract.to_string(),
                    event_name: n_event.to_string(),
                    block_height: block,
                    tx_hash: notification
                        .get("txhash")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    state: notification
                        .get("state")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null),
                });
            }
        }

        Ok(events)
    }
}

/// Neo reports fees as decimal strings of GAS fractions.
fn fee_field(value: &serde_json::Value, key: &str) -> Option<i64> {
    value
        .get(key)
        .and_then(serde_json::Value::as_str)
        .and_then(|s| s.parse::<i64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_fields_parse_from_strings() {
        let value = json!({ "netfee": "123", "sysfee": "1000000" });

        assert_eq!(fee_field(&value, "netfee"), Some(123));
        assert_eq!(fee_field(&value, "sysfee"), Some(1_000_000));
        assert_eq!(fee_field(&value, "missing"), None);
    }
}
