//! The gas ledger. Every balance mutation runs inside one database
//! transaction holding the account's row lock, so per-account operations
//! are serialised and the invariants (`reserved <= balance`, ledger
//! conservation) hold at every commit point.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::GasBankConfig;
use crate::database::methods::DbMethods as _;
use crate::database::types::{
    GasAccountRow, GasReservationRow, GasTransactionRow, GasTransactionStatus, GasTransactionType,
    ReservationState,
};
use crate::database::{Database, IsolationLevel};
use crate::error::{ErrorKind, ServiceError, ServiceResult};

pub mod deposit_watcher;
pub mod reaper;

const CONTENTION_BACKOFF_BASE_MS: u64 = 10;
const CONTENTION_BACKOFF_CAP_MS: u64 = 500;

/// The ledger effect of settling a hold into a spend of `actual`: the
/// account deltas and the confirmed rows to write. The fee row debits the
/// full held amount and the refund row credits the unused part back, so
/// the confirmed ledger keeps summing to the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CommitSettlement {
    pub balance_delta: i64,
    pub reserved_delta: i64,
    pub fee_row: i64,
    pub refund_row: Option<i64>,
}

pub(crate) fn commit_settlement(held: i64, actual: i64) -> CommitSettlement {
    let excess = held - actual;

    CommitSettlement {
        balance_delta: -actual,
        reserved_delta: -held,
        fee_row: held,
        refund_row: (excess > 0).then_some(excess),
    }
}

pub struct GasBank {
    database: Arc<Database>,
    config: GasBankConfig,
}

impl GasBank {
    #[must_use]
    pub fn new(database: Arc<Database>, config: GasBankConfig) -> Self {
        Self { database, config }
    }

    #[must_use]
    pub fn config(&self) -> &GasBankConfig {
        &self.config
    }

    /// The fee charged for an execution of the given duration, capped at
    /// the reserved amount.
    #[must_use]
    pub fn execution_fee(&self, duration_ms: i64) -> i64 {
        let fee = (self.config.gas_per_second as i128 * duration_ms.max(0) as i128) / 1000;
        (fee as i64).clamp(0, self.config.execution_reserve)
    }

    pub async fn get_or_create_account(
        &self,
        owner_id: Uuid,
        address: &str,
    ) -> ServiceResult<GasAccountRow> {
        Ok(self
            .database
            .pool
            .get_or_create_gas_account(owner_id, address)
            .await?)
    }

    pub async fn get_account(
        &self,
        owner_id: Uuid,
        address: &str,
    ) -> ServiceResult<Option<GasAccountRow>> {
        Ok(self.database.pool.get_gas_account(owner_id, address).await?)
    }

    pub async fn primary_account(&self, owner_id: Uuid) -> ServiceResult<Option<GasAccountRow>> {
        Ok(self.database.pool.get_primary_gas_account(owner_id).await?)
    }

    pub async fn list_transactions(
        &self,
        account_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> ServiceResult<Vec<GasTransactionRow>> {
        Ok(self
            .database
            .pool
            .list_gas_transactions(account_id, offset, limit)
            .await?)
    }

    pub async fn get_transaction(&self, id: Uuid) -> ServiceResult<Option<GasTransactionRow>> {
        Ok(self.database.pool.get_gas_transaction(id).await?)
    }

    pub async fn get_reservation(&self, id: Uuid) -> ServiceResult<Option<GasReservationRow>> {
        Ok(self.database.pool.get_gas_reservation(id).await?)
    }

    /// Records an observed on-chain deposit as pending. Fails with
    /// `conflict` when the chain hash has been recorded before.
    #[instrument(level = "debug", skip(self))]
    pub async fn deposit(
        &self,
        owner_id: Uuid,
        address: &str,
        amount: i64,
        chain_tx_hash: &str,
        memo: &str,
    ) -> ServiceResult<GasTransactionRow> {
        if amount < self.config.min_deposit {
            return Err(ServiceError::invalid(format!(
                "deposit of {amount} is below the minimum of {}",
                self.config.min_deposit
            )));
        }

        self.with_contention_retries(|| async move {
            let mut tx = self.database.begin_tx(IsolationLevel::ReadCommitted).await?;

            let account = (&mut tx).get_or_create_gas_account(owner_id, address).await?;

            let row = (&mut tx)
                .insert_gas_transaction(
                    Uuid::new_v4(),
                    account.id,
                    GasTransactionType::Deposit,
                    amount,
                    GasTransactionStatus::Pending,
                    Some(chain_tx_hash),
                    memo,
                )
                .await
                .map_err(|err| {
                    if err.is_unique_violation() {
                        ServiceError::conflict(format!(
                            "deposit {chain_tx_hash} has already been recorded"
                        ))
                    } else {
                        err.into()
                    }
                })?;

            tx.commit().await.map_err(crate::database::Error::from)?;

            Ok(row)
        })
        .await
    }

    /// Confirms a pending deposit and credits the balance. Idempotent: a
    /// deposit is credited exactly once no matter how often the
    /// confirmation is observed.
    #[instrument(level = "debug", skip(self))]
    pub async fn confirm_deposit(&self, chain_tx_hash: &str) -> ServiceResult<GasTransactionRow> {
        self.with_contention_retries(|| async move {
            let mut tx = self.database.begin_tx(IsolationLevel::ReadCommitted).await?;

            let deposit = (&mut tx)
                .get_deposit_by_chain_hash(chain_tx_hash)
                .await?
                .ok_or_else(|| {
                    ServiceError::not_found(format!("no deposit recorded for {chain_tx_hash}"))
                })?;

            let account = (&mut tx)
                .lock_gas_account(deposit.account_id)
                .await?
                .ok_or_else(|| ServiceError::internal("deposit references a missing account"))?;

            let transitioned = (&mut tx)
                .update_gas_transaction_status(deposit.id, GasTransactionStatus::Confirmed)
                .await?;

            if !transitioned {
                // Already settled by a previous observation.
                tx.commit().await.map_err(crate::database::Error::from)?;
                return Ok(deposit);
            }

            (&mut tx)
                .update_gas_account(
                    account.id,
                    account.balance + deposit.amount,
                    account.reserved,
                )
                .await?;

            tx.commit().await.map_err(crate::database::Error::from)?;

            info!(
                account = %account.id,
                amount = deposit.amount,
                chain_tx_hash,
                "Deposit confirmed"
            );

            Ok(deposit)
        })
        .await
    }

    /// Places a hold on the account. Fails with `insufficient_funds` when
    /// the available balance does not cover the amount.
    #[instrument(level = "debug", skip(self))]
    pub async fn reserve(
        &self,
        owner_id: Uuid,
        address: &str,
        amount: i64,
        purpose_ref: &str,
    ) -> ServiceResult<GasReservationRow> {
        if amount <= 0 {
            return Err(ServiceError::invalid("reservation amount must be positive"));
        }

        self.with_contention_retries(|| async move {
            let mut tx = self.database.begin_tx(IsolationLevel::ReadCommitted).await?;

            let account = (&mut tx)
                .get_gas_account(owner_id, address)
                .await?
                .ok_or_else(|| {
                    ServiceError::insufficient_funds(format!("no gas account for {address}"))
                })?;

            let account = (&mut tx)
                .lock_gas_account(account.id)
                .await?
                .expect("account row disappeared while locked");

            if account.available() < amount {
                return Err(ServiceError::insufficient_funds(format!(
                    "available balance {} does not cover {amount}",
                    account.available()
                )));
            }

            let reservation = (&mut tx)
                .insert_gas_reservation(Uuid::new_v4(), account.id, amount, purpose_ref)
                .await?;

            (&mut tx)
                .update_gas_account(account.id, account.balance, account.reserved + amount)
                .await?;

            tx.commit().await.map_err(crate::database::Error::from)?;

            Ok(reservation)
        })
        .await
    }

    /// Settles a hold into a spend of `actual_amount`, refunding the rest.
    #[instrument(level = "debug", skip(self))]
    pub async fn commit(
        &self,
        reservation_id: Uuid,
        actual_amount: i64,
    ) -> ServiceResult<GasReservationRow> {
        self.with_contention_retries(|| async move {
            let mut tx = self.database.begin_tx(IsolationLevel::ReadCommitted).await?;

            let reservation = (&mut tx)
                .get_gas_reservation(reservation_id)
                .await?
                .ok_or_else(|| ServiceError::not_found("unknown reservation"))?;

            if actual_amount < 0 || actual_amount > reservation.amount {
                return Err(ServiceError::invalid(format!(
                    "actual amount {actual_amount} exceeds the reserved {}",
                    reservation.amount
                )));
            }

            let account = (&mut tx)
                .lock_gas_account(reservation.account_id)
                .await?
                .ok_or_else(|| ServiceError::internal("reservation references a missing account"))?;

            let settled = (&mut tx)
                .settle_gas_reservation(reservation_id, ReservationState::Committed)
                .await?;

            if !settled {
                return Err(ServiceError::conflict(format!(
                    "reservation is already {}",
                    reservation.state
                )));
            }

            let settlement = commit_settlement(reservation.amount, actual_amount);

            (&mut tx)
                .update_gas_account(
                    account.id,
                    account.balance + settlement.balance_delta,
                    account.reserved + settlement.reserved_delta,
                )
                .await?;

            (&mut tx)
                .insert_gas_transaction(
                    Uuid::new_v4(),
                    account.id,
                    GasTransactionType::ServiceFee,
                    settlement.fee_row,
                    GasTransactionStatus::Confirmed,
                    None,
                    &reservation.purpose_ref,
                )
                .await?;

            if let Some(refund_row) = settlement.refund_row {
                (&mut tx)
                    .insert_gas_transaction(
                        Uuid::new_v4(),
                        account.id,
                        GasTransactionType::Refund,
                        refund_row,
                        GasTransactionStatus::Confirmed,
                        None,
                        &reservation.purpose_ref,
                    )
                    .await?;
            }

            tx.commit().await.map_err(crate::database::Error::from)?;

            Ok(GasReservationRow {
                state: ReservationState::Committed,
                ..reservation
            })
        })
        .await
    }

    /// Releases a hold without spending. No ledger row is written: the
    /// funds never left the account.
    #[instrument(level = "debug", skip(self))]
    pub async fn refund(&self, reservation_id: Uuid) -> ServiceResult<GasReservationRow> {
        self.with_contention_retries(|| async move {
            let mut tx = self.database.begin_tx(IsolationLevel::ReadCommitted).await?;

            let reservation = (&mut tx)
                .get_gas_reservation(reservation_id)
                .await?
                .ok_or_else(|| ServiceError::not_found("unknown reservation"))?;

            let account = (&mut tx)
                .lock_gas_account(reservation.account_id)
                .await?
                .ok_or_else(|| ServiceError::internal("reservation references a missing account"))?;

            let settled = (&mut tx)
                .settle_gas_reservation(reservation_id, ReservationState::Refunded)
                .await?;

            if !settled {
                return Err(ServiceError::conflict(format!(
                    "reservation is already {}",
                    reservation.state
                )));
            }

            (&mut tx)
                .update_gas_account(
                    account.id,
                    account.balance,
                    account.reserved - reservation.amount,
                )
                .await?;

            tx.commit().await.map_err(crate::database::Error::from)?;

            Ok(GasReservationRow {
                state: ReservationState::Refunded,
                ..reservation
            })
        })
        .await
    }

    /// Settles a withdrawal whose chain transaction confirmed: the full
    /// reserved amount leaves the balance and a confirmed withdrawal row
    /// is written.
    #[instrument(level = "debug", skip(self))]
    pub async fn settle_withdrawal(
        &self,
        reservation_id: Uuid,
        chain_tx_hash: &str,
    ) -> ServiceResult<()> {
        self.with_contention_retries(|| async move {
            let mut tx = self.database.begin_tx(IsolationLevel::ReadCommitted).await?;

            let reservation = (&mut tx)
                .get_gas_reservation(reservation_id)
                .await?
                .ok_or_else(|| ServiceError::not_found("unknown reservation"))?;

            let account = (&mut tx)
                .lock_gas_account(reservation.account_id)
                .await?
                .ok_or_else(|| ServiceError::internal("reservation references a missing account"))?;

            let settled = (&mut tx)
                .settle_gas_reservation(reservation_id, ReservationState::Committed)
                .await?;

            if !settled {
                return Err(ServiceError::conflict(format!(
                    "reservation is already {}",
                    reservation.state
                )));
            }

            (&mut tx)
                .update_gas_account(
                    account.id,
                    account.balance - reservation.amount,
                    account.reserved - reservation.amount,
                )
                .await?;

            (&mut tx)
                .insert_gas_transaction(
                    Uuid::new_v4(),
                    account.id,
                    GasTransactionType::Withdrawal,
                    reservation.amount,
                    GasTransactionStatus::Confirmed,
                    Some(chain_tx_hash),
                    &reservation.purpose_ref,
                )
                .await?;

            tx.commit().await.map_err(crate::database::Error::from)?;

            Ok(())
        })
        .await
    }

    /// Records a failed withdrawal for audit and releases the hold.
    #[instrument(level = "debug", skip(self))]
    pub async fn fail_withdrawal(&self, reservation_id: Uuid, detail: &str) -> ServiceResult<()> {
        let reservation = self.refund(reservation_id).await?;

        self.database
            .pool
            .insert_gas_transaction(
                Uuid::new_v4(),
                reservation.account_id,
                GasTransactionType::Withdrawal,
                reservation.amount,
                GasTransactionStatus::Failed,
                None,
                detail,
            )
            .await?;

        Ok(())
    }

    /// Checks ledger conservation for an account at rest. Returns the
    /// account, the signed sum of its confirmed ledger rows and the sum of
    /// held reservations.
    pub async fn conservation(&self, account_id: Uuid) -> ServiceResult<(GasAccountRow, i64, i64)> {
        let mut tx = self.database.begin_tx(IsolationLevel::RepeatableRead).await?;

        let account = (&mut tx)
            .lock_gas_account(account_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("unknown gas account"))?;

        let ledger_total = (&mut tx).confirmed_ledger_total(account_id).await?;
        let held_total = (&mut tx).held_reservation_total(account_id).await?;

        tx.commit().await.map_err(crate::database::Error::from)?;

        Ok((account, ledger_total, held_total))
    }

    /// Retries an operation when the database reports a transient failure
    /// (lock contention, serialization aborts, pool exhaustion). Losers of
    /// a conflict back off exponentially with jitter.
    async fn with_contention_retries<T, F, Fut>(&self, mut op: F) -> ServiceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ServiceResult<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Err(err)
                    if err.kind == ErrorKind::Unavailable
                        && attempt < self.config.contention_retries =>
                {
                    attempt += 1;
                    let backoff = contention_backoff(attempt);
                    warn!(?err, attempt, ?backoff, "Gas ledger contention, retrying");
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }
}

fn contention_backoff(attempt: u32) -> Duration {
    let exp = CONTENTION_BACKOFF_BASE_MS
        .saturating_mul(1 << attempt.min(8))
        .min(CONTENTION_BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=exp / 2);

    Duration::from_millis(exp + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn bank_config() -> GasBankConfig {
        GasBankConfig {
            min_deposit: config::default::min_deposit(),
            reservation_ttl: config::default::reservation_ttl(),
            reaper_interval: config::default::reaper_interval(),
            execution_reserve: config::default::execution_reserve(),
            tx_fee_reserve: config::default::tx_fee_reserve(),
            gas_per_second: config::default::gas_per_second(),
            contention_retries: config::default::contention_retries(),
        }
    }

    #[test]
    fn execution_fee_is_duration_proportional_and_capped() {
        let config = bank_config();

        // 0.1 GAS per second
        let fee_1s = (config.gas_per_second as i128 * 1000 / 1000) as i64;
        assert_eq!(fee_for(&config, 1000), fee_1s);
        assert_eq!(fee_for(&config, 0), 0);
        assert_eq!(fee_for(&config, -5), 0);

        // A very long run never exceeds the reserve.
        assert_eq!(fee_for(&config, 1_000_000_000), config.execution_reserve);
    }

    fn fee_for(config: &GasBankConfig, duration_ms: i64) -> i64 {
        let fee = (config.gas_per_second as i128 * duration_ms.max(0) as i128) / 1000;
        (fee as i64).clamp(0, config.execution_reserve)
    }

    #[test]
    fn contention_backoff_is_bounded() {
        for attempt in 1..20 {
            let backoff = contention_backoff(attempt);
            assert!(backoff >= Duration::from_millis(CONTENTION_BACKOFF_BASE_MS));
            assert!(backoff <= Duration::from_millis(CONTENTION_BACKOFF_CAP_MS * 2));
        }
    }

    #[test]
    fn commit_settlement_rows_sum_to_the_balance_delta() {
        // Partial spend: fee debits the hold, refund credits the excess.
        let settlement = commit_settlement(100, 30);
        assert_eq!(settlement.balance_delta, -30);
        assert_eq!(settlement.reserved_delta, -100);
        assert_eq!(settlement.fee_row, 100);
        assert_eq!(settlement.refund_row, Some(70));

        // Full spend: no refund row.
        let settlement = commit_settlement(100, 100);
        assert_eq!(settlement.refund_row, None);

        // Zero spend: the whole hold flows back.
        let settlement = commit_settlement(100, 0);
        assert_eq!(settlement.balance_delta, 0);
        assert_eq!(settlement.refund_row, Some(100));

        for (held, actual) in [(1, 0), (1, 1), (100, 30), (50_000_000, 123)] {
            let s = commit_settlement(held, actual);
            assert_eq!(
                s.balance_delta,
                -(s.fee_row - s.refund_row.unwrap_or(0)),
                "signed row sum must equal the balance delta for held={held} actual={actual}"
            );
        }
    }

    /// One account driven through the ledger state machine in memory,
    /// with the settlement arithmetic the service applies. Confirmed rows
    /// are recorded exactly as `commit`/`confirm_deposit` write them.
    struct ModelAccount {
        balance: i64,
        reserved: i64,
        confirmed_rows: Vec<(GasTransactionType, i64)>,
        held: Vec<i64>,
    }

    impl ModelAccount {
        fn new() -> Self {
            Self {
                balance: 0,
                reserved: 0,
                confirmed_rows: Vec::new(),
                held: Vec::new(),
            }
        }

        fn available(&self) -> i64 {
            self.balance - self.reserved
        }

        fn deposit(&mut self, amount: i64) {
            self.balance += amount;
            self.confirmed_rows.push((GasTransactionType::Deposit, amount));
        }

        fn reserve(&mut self, amount: i64) -> bool {
            if self.available() < amount {
                return false;
            }
            self.reserved += amount;
            self.held.push(amount);
            true
        }

        fn commit(&mut self, index: usize, actual: i64) {
            let held = self.held.remove(index);
            let settlement = commit_settlement(held, actual);

            self.balance += settlement.balance_delta;
            self.reserved += settlement.reserved_delta;
            self.confirmed_rows
                .push((GasTransactionType::ServiceFee, settlement.fee_row));
            if let Some(refund_row) = settlement.refund_row {
                self.confirmed_rows
                    .push((GasTransactionType::Refund, refund_row));
            }
        }

        fn refund(&mut self, index: usize) {
            // No ledger row: the funds never left the account.
            let held = self.held.remove(index);
            self.reserved -= held;
        }

        /// Invariant 1: balance equals the signed sum of confirmed rows.
        fn conservation_total(&self) -> i64 {
            self.confirmed_rows
                .iter()
                .map(|(tx_type, amount)| match tx_type {
                    GasTransactionType::Deposit | GasTransactionType::Refund => *amount,
                    GasTransactionType::Withdrawal | GasTransactionType::ServiceFee => -*amount,
                })
                .sum()
        }

        fn assert_invariants(&self, step: usize) {
            assert!(self.balance >= 0, "balance went negative at step {step}");
            assert!(self.reserved >= 0, "reserved went negative at step {step}");
            assert!(
                self.reserved <= self.balance,
                "over-reservation at step {step}: reserved {} > balance {}",
                self.reserved,
                self.balance
            );
            assert_eq!(
                self.reserved,
                self.held.iter().sum::<i64>(),
                "reserved diverged from held reservations at step {step}"
            );
            assert_eq!(
                self.balance,
                self.conservation_total(),
                "ledger conservation broken at step {step}"
            );
        }
    }

    /// For every sequence of reserve/commit/refund operations with
    /// non-negative amounts, conservation and no-over-reservation hold
    /// after every operation.
    #[test]
    fn ledger_laws_hold_over_random_settlement_sequences() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        for seed in 0..8u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut account = ModelAccount::new();

            account.deposit(rng.gen_range(0..=1_000));
            account.assert_invariants(0);

            for step in 1..=500 {
                match rng.gen_range(0..4u8) {
                    0 => {
                        account.deposit(rng.gen_range(1..=500));
                    }
                    1 => {
                        let amount = rng.gen_range(1..=600);
                        let available_before = account.available();
                        let accepted = account.reserve(amount);
                        assert_eq!(accepted, amount <= available_before);
                    }
                    2 if !account.held.is_empty() => {
                        let index = rng.gen_range(0..account.held.len());
                        let actual = rng.gen_range(0..=account.held[index]);
                        account.commit(index, actual);
                    }
                    3 if !account.held.is_empty() => {
                        let index = rng.gen_range(0..account.held.len());
                        account.refund(index);
                    }
                    _ => {}
                }

                account.assert_invariants(step);
            }

            // Settle everything; at quiescence the reserved column drains
            // to zero and conservation still holds.
            while !account.held.is_empty() {
                account.commit(0, account.held[0]);
            }
            account.assert_invariants(501);
            assert_eq!(account.reserved, 0);
        }
    }
}
