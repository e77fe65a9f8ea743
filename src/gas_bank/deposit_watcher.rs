//! Watches the GAS token contract for transfers into the deposit wallet
//! and books them as confirmed deposits. The transfer's data argument
//! must carry the depositing user's id; transfers without it cannot be
//! attributed and are left alone.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::sleep;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::GasBank;
use crate::chain::scanner::BlockScanner;
use crate::chain::{ChainEvent, NeoRpc};
use crate::config::ChainConfig;
use crate::error::ErrorKind;

const TRANSFER_EVENT: &str = "Transfer";

/// One attributed deposit decoded from a transfer notification.
#[derive(Debug, PartialEq)]
pub struct AttributedDeposit {
    pub owner_id: Uuid,
    pub from_address: String,
    pub amount: i64,
}

/// Scanning loop; runs until cancelled by the task monitor.
pub async fn run_deposit_watcher(
    gas_bank: Arc<GasBank>,
    rpc: Arc<dyn NeoRpc>,
    config: ChainConfig,
    deposit_address: String,
) -> anyhow::Result<()> {
    let mut scanner = BlockScanner::new_latest(rpc.clone(), config.scanning_window_size)
        .await
        .map_err(|err| anyhow::anyhow!("deposit watcher start: {err}"))?
        .with_offset(config.scanning_chain_head_offset);

    loop {
        match scanner.next(&config.gas_token_hash, TRANSFER_EVENT).await {
            Ok(events) => {
                for event in events {
                    process_transfer(&gas_bank, &deposit_address, &event).await;
                }
            }
            Err(err) => {
                warn!(?err, "Deposit scan failed");
            }
        }

        sleep(config.time_between_scans).await;
    }
}

#[instrument(level = "debug", skip_all, fields(tx_hash = %event.tx_hash))]
async fn process_transfer(gas_bank: &GasBank, deposit_address: &str, event: &ChainEvent) {
    let Some(deposit) = attribute_transfer(&event.state, deposit_address) else {
        return;
    };

    let booked = gas_bank
        .deposit(
            deposit.owner_id,
            &deposit.from_address,
            deposit.amount,
            &event.tx_hash,
            "on-chain deposit",
        )
        .await;

    match booked {
        Ok(_) => {}
        // Seen in an earlier scan round; confirmation below is still
        // idempotent.
        Err(err) if err.kind == ErrorKind::Conflict => {}
        Err(err) => {
            warn!(?err, "Failed to record deposit");
            return;
        }
    }

    match gas_bank.confirm_deposit(&event.tx_hash).await {
        Ok(row) => {
            info!(
                owner = %deposit.owner_id,
                amount = deposit.amount,
                tx_hash = %event.tx_hash,
                deposit = %row.id,
                "Deposit credited"
            );
        }
        Err(err) => {
            warn!(?err, "Failed to confirm deposit");
        }
    }
}

/// Decodes a NEP-17 transfer state `[from, to, amount, data?]` into an
/// attributed deposit. `data` must be the depositing user's UUID.
fn attribute_transfer(state: &Value, deposit_address: &str) -> Option<AttributedDeposit> {
    let items = state.as_array()?;

    let from = items.first()?.as_str()?;
    let to = items.get(1)?.as_str()?;
    let amount = match items.get(2)? {
        Value::Number(number) => number.as_i64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };

    if to != deposit_address || amount <= 0 {
        return None;
    }

    let owner_id: Uuid = items.get(3)?.as_str()?.parse().ok()?;

    Some(AttributedDeposit {
        owner_id,
        from_address: from.to_string(),
        amount,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const DEPOSIT_ADDR: &str = "Nd2a4cff31913016155e38e474a2c06d0";

    #[test]
    fn attributes_transfers_to_the_deposit_wallet() {
        let user = Uuid::new_v4();
        let state = json!(["NSender", DEPOSIT_ADDR, 500000000, user.to_string()]);

        let deposit = attribute_transfer(&state, DEPOSIT_ADDR).unwrap();
        assert_eq!(deposit.owner_id, user);
        assert_eq!(deposit.from_address, "NSender");
        assert_eq!(deposit.amount, 500_000_000);
    }

    #[test]
    fn string_amounts_are_accepted() {
        let user = Uuid::new_v4();
        let state = json!(["NSender", DEPOSIT_ADDR, "123", user.to_string()]);

        assert_eq!(
            attribute_transfer(&state, DEPOSIT_ADDR).unwrap().amount,
            123
        );
    }

    #[test]
    fn unattributable_transfers_are_ignored() {
        let user = Uuid::new_v4().to_string();

        // Wrong recipient
        let state = json!(["NSender", "NOther", 5, user]);
        assert_eq!(attribute_transfer(&state, DEPOSIT_ADDR), None);

        // Missing data argument
        let state = json!(["NSender", DEPOSIT_ADDR, 5]);
        assert_eq!(attribute_transfer(&state, DEPOSIT_ADDR), None);

        // Data is not a user id
        let state = json!(["NSender", DEPOSIT_ADDR, 5, "not-a-uuid"]);
        assert_eq!(attribute_transfer(&state, DEPOSIT_ADDR), None);

        // Negative amount
        let state = json!(["NSender", DEPOSIT_ADDR, -5, Uuid::new_v4().to_string()]);
        assert_eq!(attribute_transfer(&state, DEPOSIT_ADDR), None);
    }
}
