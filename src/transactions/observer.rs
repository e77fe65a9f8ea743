//! The confirmation observer. Polls the chain for every submitted hash,
//! finalises transactions once they are buried deep enough, and walks
//! confirmations back when a reorg drops them below the threshold.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use super::{TransactionManager, WITHDRAWAL_SERVICE};
use crate::chain::NeoRpc;
use crate::config::ChainConfig;
use crate::database::methods::DbMethods as _;
use crate::database::types::{TransactionRow, TransactionState};
use crate::database::Database;
use crate::error::ErrorKind;
use crate::gas_bank::GasBank;

/// A submitted hash absent from both chain and mempool is only declared
/// lost after this grace period, so freshly broadcast transactions are
/// not misread as dropped.
const MEMPOOL_MISS_GRACE_SECS: i64 = 30;

pub struct ConfirmationObserver {
    database: Arc<Database>,
    manager: Arc<TransactionManager>,
    gas_bank: Arc<GasBank>,
    rpc: Arc<dyn NeoRpc>,
    config: ChainConfig,
}

impl ConfirmationObserver {
    pub fn new(
        database: Arc<Database>,
        manager: Arc<TransactionManager>,
        gas_bank: Arc<GasBank>,
        rpc: Arc<dyn NeoRpc>,
        config: ChainConfig,
    ) -> Self {
        Self {
            database,
            manager,
            gas_bank,
            rpc,
            config,
        }
    }

    /// Polling loop; runs until cancelled by the task monitor.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            self.poll_round().await?;
            sleep(self.config.poll_interval).await;
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn poll_round(&self) -> anyhow::Result<()> {
        let height = match self.rpc.get_block_height().await {
            Ok(height) => height,
            Err(err) => {
                warn!(?err, "Chain unreachable, skipping confirmation round");
                return Ok(());
            }
        };

        let submitted = self
            .database
            .pool
            .list_transactions_in_state(TransactionState::Submitted, self.config.poll_batch_size as i64)
            .await?;

        for row in submitted {
            self.check_submitted(&row, height).await?;
        }

        let confirmed = self
            .database
            .pool
            .list_transactions_in_state(TransactionState::Confirmed, self.config.poll_batch_size as i64)
            .await?;

        for row in confirmed {
            self.recheck_confirmed(&row, height).await?;
        }

        Ok(())
    }

    async fn check_submitted(&self, row: &TransactionRow, height: u64) -> anyhow::Result<()> {
        let Some(hash) = row.chain_tx_hash.as_deref() else {
            return Ok(());
        };

        let info = match self.rpc.get_transaction(hash).await {
            Ok(info) => info,
            Err(err) => {
                warn!(transaction = %row.id, ?err, "Failed to query transaction");
                return Ok(());
            }
        };

        match info {
            Some(info) => {
                let Some(block_height) = info.block_height else {
                    // Still waiting in the mempool.
                    return Ok(());
                };

                let depth = height.saturating_sub(block_height) + 1;
                if depth < self.config.confirmations {
                    return Ok(());
                }

                self.finalize_confirmed(row, block_height, info.fee_paid.unwrap_or(0))
                    .await?;
            }
            None => {
                if self.rpc.is_in_mempool(hash).await.unwrap_or(true) {
                    return Ok(());
                }

                let age = row
                    .submitted_at
                    .map(|at| (Utc::now() - at).num_seconds())
                    .unwrap_or(0);

                if age < MEMPOOL_MISS_GRACE_SECS {
                    return Ok(());
                }

                warn!(transaction = %row.id, hash, "Transaction lost from chain and mempool");

                // error_kind=reorg: the chain dropped the transaction
                // entirely.
                self.manager
                    .finalize_failed(row, "reorg: transaction dropped from chain")
                    .await?;
            }
        }

        Ok(())
    }

    async fn finalize_confirmed(
        &self,
        row: &TransactionRow,
        block_height: u64,
        fee_paid: i64,
    ) -> anyhow::Result<()> {
        let transitioned = self
            .database
            .pool
            .mark_transaction_confirmed(row.id, block_height as i64, fee_paid)
            .await?;

        if !transitioned {
            return Ok(());
        }

        self.database
            .pool
            .insert_transaction_event(
                row.id,
                TransactionState::Confirmed,
                &format!("included at height {block_height}, fee {fee_paid}"),
            )
            .await?;

        info!(transaction = %row.id, block_height, fee_paid, "Transaction confirmed");

        if let Some(reservation_id) = row.gas_reservation_id {
            self.settle_confirmed_reservation(row, reservation_id, fee_paid)
                .await;
        }

        Ok(())
    }

    async fn settle_confirmed_reservation(
        &self,
        row: &TransactionRow,
        reservation_id: uuid::Uuid,
        fee_paid: i64,
    ) {
        let result = if row.service == WITHDRAWAL_SERVICE {
            self.gas_bank
                .settle_withdrawal(reservation_id, row.chain_tx_hash.as_deref().unwrap_or(""))
                .await
        } else {
            match self.gas_bank.get_reservation(reservation_id).await {
                Ok(Some(reservation)) => {
                    let actual = fee_paid.clamp(0, reservation.amount);
                    self.gas_bank.commit(reservation_id, actual).await.map(|_| ())
                }
                Ok(None) => Ok(()),
                Err(err) => Err(err),
            }
        };

        match result {
            Ok(()) => {}
            Err(err) if err.kind == ErrorKind::Conflict => {
                // A reorg confirmed this transaction twice; the first
                // settlement stands.
            }
            Err(err) => {
                warn!(transaction = %row.id, %reservation_id, ?err,
                    "Failed to settle gas reservation");
            }
        }
    }

    /// Recently confirmed transactions are re-checked so a reorg below the
    /// threshold walks them back to submitted.
    async fn recheck_confirmed(&self, row: &TransactionRow, height: u64) -> anyhow::Result<()> {
        let Some(hash) = row.chain_tx_hash.as_deref() else {
            return Ok(());
        };

        let Some(recorded_height) = row.block_height else {
            return Ok(());
        };

        // Deep enough that a reorg is no longer a practical concern.
        let settled_depth = self.config.confirmations * 2 + 8;
        if height.saturating_sub(recorded_height as u64) + 1 >= settled_depth {
            return Ok(());
        }

        let info = match self.rpc.get_transaction(hash).await {
            Ok(info) => info,
            Err(_) => return Ok(()),
        };

        let still_confirmed = info
            .as_ref()
            .and_then(|i| i.block_height)
            .map(|h| height.saturating_sub(h) + 1 >= self.config.confirmations)
            .unwrap_or(false);

        if still_confirmed {
            return Ok(());
        }

        let reverted = self
            .database
            .pool
            .revert_transaction_to_submitted(row.id)
            .await?;

        if reverted {
            warn!(transaction = %row.id, hash, "Reorg: confirmation lost, watching again");

            self.database
                .pool
                .insert_transaction_event(
                    row.id,
                    TransactionState::Submitted,
                    "reorg: confirmation fell below threshold",
                )
                .await?;
        }

        Ok(())
    }
}
