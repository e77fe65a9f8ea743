//! Chain-event triggers: a scanning task walks the chain in bounded
//! windows and fires matching triggers with the decoded notification as
//! `params.event`.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

use super::{ChainEventTriggerConfig, FireCause, KindState, TriggerEngine};
use crate::chain::{ChainEvent, NeoRpc};
use crate::config::ChainConfig;
use crate::database::types::TriggerStatus;

/// Scanning loop; runs until cancelled by the task monitor.
pub async fn run_chain_event_scanner(
    engine: Arc<TriggerEngine>,
    rpc: Arc<dyn NeoRpc>,
    config: ChainConfig,
) -> anyhow::Result<()> {
    loop {
        if let Err(err) = scan_round(&engine, rpc.as_ref(), &config).await {
            warn!(?err, "Chain event scan round failed");
        }

        sleep(config.time_between_scans).await;
    }
}

struct ScanTarget {
    trigger_id: Uuid,
    config: ChainEventTriggerConfig,
    from_block: u64,
    to_block: u64,
}

async fn scan_round(
    engine: &TriggerEngine,
    rpc: &dyn NeoRpc,
    config: &ChainConfig,
) -> anyhow::Result<()> {
    let head = match rpc.get_block_height().await {
        Ok(head) => head,
        Err(err) => {
            warn!(?err, "Chain unreachable, skipping event scan");
            return Ok(());
        }
    };

    let effective_head = head.saturating_sub(config.scanning_chain_head_offset);

    // Plan the windows under the lock, fetch outside of it.
    let targets: Vec<ScanTarget> = {
        let mut index = engine.index.lock().await;
        let mut targets = Vec::new();

        for active in index.values_mut() {
            if active.status != TriggerStatus::Active {
                continue;
            }

            let KindState::ChainEvent {
                config: trigger_config,
                next_block,
            } = &mut active.state
            else {
                continue;
            };

            // A fresh trigger without an explicit start begins at the
            // current head; history is not replayed.
            let from_block = next_block.unwrap_or(effective_head);

            let mut to_block = effective_head.min(from_block + config.scanning_window_size);
            if let Some(end_block) = trigger_config.end_block {
                to_block = to_block.min(end_block);
            }

            if to_block < from_block {
                continue;
            }

            targets.push(ScanTarget {
                trigger_id: active.id,
                config: trigger_config.clone(),
                from_block,
                to_block,
            });

            *next_block = Some(to_block + 1);
        }

        targets
    };

    for target in targets {
        let events = match rpc
            .get_events(
                &target.config.contract_address,
                &target.config.event_name,
                target.from_block,
                target.to_block,
            )
            .await
        {
            Ok(events) => events,
            Err(err) => {
                warn!(trigger = %target.trigger_id, ?err, "Event query failed");
                // Walk the window back so it is retried next round.
                let mut index = engine.index.lock().await;
                if let Some(active) = index.get_mut(&target.trigger_id) {
                    if let KindState::ChainEvent { next_block, .. } = &mut active.state {
                        *next_block = Some(target.from_block);
                    }
                }
                continue;
            }
        };

        for event in events {
            if !matches_filters(&event.state, target.config.parameter_filters.as_ref()) {
                continue;
            }

            let params = event_params(&target.config.params, &event);

            if let Err(err) = engine
                .fire(target.trigger_id, params, FireCause::ChainEvent)
                .await
            {
                warn!(trigger = %target.trigger_id, ?err, "Chain event fire failed");
            }
        }
    }

    Ok(())
}

/// Every filter key must be present and equal in the event state. Object
/// states match by key; array states match numeric-string keys as
/// indices.
fn matches_filters(state: &Value, filters: Option<&Value>) -> bool {
    let Some(filters) = filters.and_then(Value::as_object) else {
        return true;
    };

    filters.iter().all(|(key, expected)| {
        let actual = match state {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };

        actual == Some(expected)
    })
}

/// The function's params: the configured base object with the decoded
/// event under `event`.
fn event_params(base: &Value, event: &ChainEvent) -> Value {
    let event_value = json!({
        "contract": event.contract,
        "event_name": event.event_name,
        "block_height": event.block_height,
        "tx_hash": event.tx_hash,
        "state": event.state,
    });

    match base {
        Value::Object(map) => {
            let mut merged = map.clone();
            merged.insert("event".to_string(), event_value);
            Value::Object(merged)
        }
        _ => json!({ "event": event_value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_match_object_and_array_states() {
        let object_state = json!({ "from": "NXy", "amount": 5 });
        let array_state = json!(["NXy", 5]);

        assert!(matches_filters(&object_state, None));
        assert!(matches_filters(
            &object_state,
            Some(&json!({ "from": "NXy" }))
        ));
        assert!(!matches_filters(
            &object_state,
            Some(&json!({ "from": "NOther" }))
        ));
        assert!(matches_filters(&array_state, Some(&json!({ "0": "NXy" }))));
        assert!(!matches_filters(&array_state, Some(&json!({ "7": "NXy" }))));
    }

    #[test]
    fn event_lands_under_the_event_key() {
        let event = ChainEvent {
            contract: "0xabc".to_string(),
            event_name: "Transfer".to_string(),
            block_height: 42,
            tx_hash: "0xdead".to_string(),
            state: json!([1, 2]),
        };

        let params = event_params(&json!({ "mode": "fast" }), &event);
        assert_eq!(params["mode"], json!("fast"));
        assert_eq!(params["event"]["block_height"], json!(42));

        let params = event_params(&Value::Null, &event);
        assert_eq!(params["event"]["event_name"], json!("Transfer"));
    }
}
