use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Acquire, Postgres, Row};
use uuid::Uuid;

use super::types::{
    ExecutionRow, ExecutionStatus, FunctionRow, GasAccountRow, GasReservationRow,
    GasTransactionRow, GasTransactionStatus, GasTransactionType, OracleRequestRow,
    OracleRequestStatus, OracleSourceRow, RandomRequestRow, RandomRequestStatus, ReservationState,
    SecretAction, SecretAuditRow, SecretRow, TransactionEventRow, TransactionRow,
    TransactionState, TriggerEventRow, TriggerEventStatus, TriggerKind, TriggerRow, TriggerStatus,
    UserRow, WalletRow,
};
use super::Error;

/// The individual, composable queries. Each method is a single atomic
/// query (or a tightly-coupled pair) and can run against the pool or
/// inside a transaction handle.
#[async_trait]
pub trait DbMethods<'c>: Acquire<'c, Database = Postgres> + Sized + Send {
    // ------------------------------------------------------------------
    // Users and api keys
    // ------------------------------------------------------------------

    async fn get_user(self, id: Uuid) -> Result<Option<UserRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, UserRow>(
            r#"
            SELECT * FROM users WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?)
    }

    async fn insert_user(self, id: Uuid, handle: &str) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO users (id, handle) VALUES ($1, $2)
            "#,
        )
        .bind(id)
        .bind(handle)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn insert_api_key(self, id: Uuid, user_id: Uuid, key_hash: &str, label: &str) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO api_keys (id, user_id, key_hash, label) VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(key_hash)
        .bind(label)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn get_user_by_api_key_hash(self, key_hash: &str) -> Result<Option<UserRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, UserRow>(
            r#"
            SELECT u.*
            FROM users u
            JOIN api_keys k ON k.user_id = u.id
            WHERE k.key_hash = $1 AND k.active AND u.active
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&mut *conn)
        .await?)
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    async fn insert_function(
        self,
        id: Uuid,
        owner_id: Uuid,
        name: &str,
        source_code: &str,
        timeout_ms: i64,
        memory_mb: i64,
        secret_names: &[String],
    ) -> Result<FunctionRow, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, FunctionRow>(
            r#"
            INSERT INTO functions (id, owner_id, name, source_code, timeout_ms, memory_mb, secret_names)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .bind(name)
        .bind(source_code)
        .bind(timeout_ms)
        .bind(memory_mb)
        .bind(secret_names)
        .fetch_one(&mut *conn)
        .await?)
    }

    async fn update_function(
        self,
        id: Uuid,
        source_code: &str,
        timeout_ms: i64,
        memory_mb: i64,
        secret_names: &[String],
    ) -> Result<Option<FunctionRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, FunctionRow>(
            r#"
            UPDATE functions
            SET    source_code = $2,
                   timeout_ms = $3,
                   memory_mb = $4,
                   secret_names = $5,
                   version = version + 1,
                   updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(source_code)
        .bind(timeout_ms)
        .bind(memory_mb)
        .bind(secret_names)
        .fetch_optional(&mut *conn)
        .await?)
    }

    async fn delete_function(self, id: Uuid) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query(
            r#"
            DELETE FROM functions WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn get_function(self, id: Uuid) -> Result<Option<FunctionRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, FunctionRow>("SELECT * FROM functions WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    async fn get_function_by_name(
        self,
        owner_id: Uuid,
        name: &str,
    ) -> Result<Option<FunctionRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, FunctionRow>(
            "SELECT * FROM functions WHERE owner_id = $1 AND name = $2",
        )
        .bind(owner_id)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?)
    }

    async fn list_functions(
        self,
        owner_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<FunctionRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, FunctionRow>(
            r#"
            SELECT * FROM functions
            WHERE owner_id = $1
            ORDER BY created_at DESC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(owner_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    async fn count_functions(self, owner_id: Uuid) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query("SELECT COUNT(*) FROM functions WHERE owner_id = $1")
            .bind(owner_id)
            .fetch_one(&mut *conn)
            .await?;

        Ok(row.get::<i64, _>(0))
    }

    /// Cascade guard: a function may only be deleted once every execution
    /// belonging to it has reached a terminal state.
    async fn count_active_executions(self, function_id: Uuid) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FROM executions
            WHERE function_id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(function_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<i64, _>(0))
    }

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    async fn insert_execution(
        self,
        id: Uuid,
        function_id: Uuid,
        trigger_event_id: Option<Uuid>,
        params_hash: &str,
        gas_reservation_id: Option<Uuid>,
    ) -> Result<ExecutionRow, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, ExecutionRow>(
            r#"
            INSERT INTO executions (id, function_id, trigger_event_id, status, params_hash, gas_reservation_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(function_id)
        .bind(trigger_event_id)
        .bind(ExecutionStatus::Queued)
        .bind(params_hash)
        .bind(gas_reservation_id)
        .fetch_one(&mut *conn)
        .await?)
    }

    /// Transitions queued -> running. Returns false when the execution was
    /// not in the queued state (cancelled in the meantime, or duplicated
    /// delivery from the queue).
    async fn mark_execution_running(self, id: Uuid) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query(
            r#"
            UPDATE executions
            SET    status = $2, started_at = CURRENT_TIMESTAMP
            WHERE  id = $1 AND status = $3
            "#,
        )
        .bind(id)
        .bind(ExecutionStatus::Running)
        .bind(ExecutionStatus::Queued)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    /// Records the terminal state of an execution. The state filter keeps
    /// terminal rows immutable: a second finish is a no-op returning false.
    #[allow(clippy::too_many_arguments)]
    async fn finish_execution(
        self,
        id: Uuid,
        status: ExecutionStatus,
        duration_ms: i64,
        result_json: Option<&serde_json::Value>,
        error_kind: Option<&str>,
        error_message: Option<&str>,
        logs: &[String],
    ) -> Result<bool, Error> {
        debug_assert!(status.is_terminal());

        let mut conn = self.acquire().await?;

        let res = sqlx::query(
            r#"
            UPDATE executions
            SET    status = $2,
                   finished_at = CURRENT_TIMESTAMP,
                   duration_ms = $3,
                   result_json = $4,
                   error_kind = $5,
                   error_message = $6,
                   logs = $7
            WHERE  id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(duration_ms)
        .bind(result_json)
        .bind(error_kind)
        .bind(error_message)
        .bind(logs)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    /// Executions that never reached a terminal state (found at startup
    /// after an unclean stop).
    async fn list_unsettled_executions(self, limit: i64) -> Result<Vec<ExecutionRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT * FROM executions
            WHERE status IN ('queued', 'running')
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    async fn get_execution(self, id: Uuid) -> Result<Option<ExecutionRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, ExecutionRow>("SELECT * FROM executions WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    async fn list_executions(
        self,
        function_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ExecutionRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT * FROM executions
            WHERE function_id = $1
            ORDER BY created_at DESC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(function_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    // ------------------------------------------------------------------
    // Secrets
    // ------------------------------------------------------------------

    async fn insert_secret(
        self,
        id: Uuid,
        owner_id: Uuid,
        name: &str,
        wrapped_blob: &[u8],
        wrap_scheme: &str,
        description: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<SecretRow, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, SecretRow>(
            r#"
            INSERT INTO secrets (id, owner_id, name, wrapped_blob, wrap_scheme, description, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .bind(name)
        .bind(wrapped_blob)
        .bind(wrap_scheme)
        .bind(description)
        .bind(expires_at)
        .fetch_one(&mut *conn)
        .await?)
    }

    async fn update_secret_blob(
        self,
        id: Uuid,
        wrapped_blob: &[u8],
        wrap_scheme: &str,
        description: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query(
            r#"
            UPDATE secrets
            SET    wrapped_blob = $2, wrap_scheme = $3, description = $4,
                   expires_at = $5, updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1
            "#,
        )
        .bind(id)
        .bind(wrapped_blob)
        .bind(wrap_scheme)
        .bind(description)
        .bind(expires_at)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn delete_secret(self, id: Uuid) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query("DELETE FROM secrets WHERE id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn get_secret(self, id: Uuid) -> Result<Option<SecretRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, SecretRow>("SELECT * FROM secrets WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    async fn get_secret_by_name(
        self,
        owner_id: Uuid,
        name: &str,
    ) -> Result<Option<SecretRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, SecretRow>(
            "SELECT * FROM secrets WHERE owner_id = $1 AND name = $2",
        )
        .bind(owner_id)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?)
    }

    async fn list_secrets(
        self,
        owner_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<SecretRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, SecretRow>(
            r#"
            SELECT * FROM secrets
            WHERE owner_id = $1
            ORDER BY name
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(owner_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Secrets still wrapped under an older scheme, for batched rotation.
    async fn list_secrets_not_on_scheme(
        self,
        current_scheme: &str,
        limit: i64,
    ) -> Result<Vec<SecretRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, SecretRow>(
            r#"
            SELECT * FROM secrets
            WHERE wrap_scheme <> $1
            ORDER BY updated_at
            LIMIT $2
            "#,
        )
        .bind(current_scheme)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    async fn insert_secret_audit(
        self,
        secret_id: Uuid,
        actor: &str,
        action: SecretAction,
        source_ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO secret_audit (secret_id, actor, action, source_ip, user_agent)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(secret_id)
        .bind(actor)
        .bind(action)
        .bind(source_ip)
        .bind(user_agent)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn list_secret_audit(
        self,
        owner_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<SecretAuditRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, SecretAuditRow>(
            r#"
            SELECT a.*
            FROM secret_audit a
            JOIN secrets s ON s.id = a.secret_id
            WHERE s.owner_id = $1
            ORDER BY a.id DESC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(owner_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    // ------------------------------------------------------------------
    // Gas bank
    // ------------------------------------------------------------------

    async fn get_or_create_gas_account(
        self,
        owner_id: Uuid,
        address: &str,
    ) -> Result<GasAccountRow, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, GasAccountRow>(
            r#"
            INSERT INTO gas_accounts (id, owner_id, address)
            VALUES ($1, $2, $3)
            ON CONFLICT (owner_id, address) DO UPDATE SET owner_id = EXCLUDED.owner_id
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(address)
        .fetch_one(&mut *conn)
        .await?)
    }

    /// The account executions are charged against: the user's oldest one.
    async fn get_primary_gas_account(self, owner_id: Uuid) -> Result<Option<GasAccountRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, GasAccountRow>(
            r#"
            SELECT ga.* FROM gas_accounts ga
            WHERE owner_id = $1
            ORDER BY (SELECT MIN(created_at) FROM gas_transactions WHERE account_id = ga.id) NULLS LAST, id
            LIMIT 1
            "#,
        )
        .bind(owner_id)
        .fetch_optional(&mut *conn)
        .await?)
    }

    async fn get_gas_account(
        self,
        owner_id: Uuid,
        address: &str,
    ) -> Result<Option<GasAccountRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, GasAccountRow>(
            "SELECT * FROM gas_accounts WHERE owner_id = $1 AND address = $2",
        )
        .bind(owner_id)
        .bind(address)
        .fetch_optional(&mut *conn)
        .await?)
    }

    /// Row-locks the account for the remainder of the transaction. All
    /// multi-step ledger mutations go through this.
    async fn lock_gas_account(self, id: Uuid) -> Result<Option<GasAccountRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, GasAccountRow>(
            "SELECT * FROM gas_accounts WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?)
    }

    async fn update_gas_account(self, id: Uuid, balance: i64, reserved: i64) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE gas_accounts
            SET    balance = $2, reserved = $3, updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1
            "#,
        )
        .bind(id)
        .bind(balance)
        .bind(reserved)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn insert_gas_transaction(
        self,
        id: Uuid,
        account_id: Uuid,
        tx_type: GasTransactionType,
        amount: i64,
        status: GasTransactionStatus,
        chain_tx_hash: Option<&str>,
        memo: &str,
    ) -> Result<GasTransactionRow, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, GasTransactionRow>(
            r#"
            INSERT INTO gas_transactions (id, account_id, tx_type, amount, status, chain_tx_hash, memo)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(account_id)
        .bind(tx_type)
        .bind(amount)
        .bind(status)
        .bind(chain_tx_hash)
        .bind(memo)
        .fetch_one(&mut *conn)
        .await?)
    }

    async fn update_gas_transaction_status(
        self,
        id: Uuid,
        status: GasTransactionStatus,
    ) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query(
            r#"
            UPDATE gas_transactions
            SET    status = $2, updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(status)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn get_gas_transaction(self, id: Uuid) -> Result<Option<GasTransactionRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, GasTransactionRow>("SELECT * FROM gas_transactions WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    async fn get_deposit_by_chain_hash(
        self,
        chain_tx_hash: &str,
    ) -> Result<Option<GasTransactionRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, GasTransactionRow>(
            r#"
            SELECT * FROM gas_transactions
            WHERE tx_type = 'deposit' AND chain_tx_hash = $1
            "#,
        )
        .bind(chain_tx_hash)
        .fetch_optional(&mut *conn)
        .await?)
    }

    async fn list_gas_transactions(
        self,
        account_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<GasTransactionRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, GasTransactionRow>(
            r#"
            SELECT * FROM gas_transactions
            WHERE account_id = $1
            ORDER BY created_at DESC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(account_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    async fn insert_gas_reservation(
        self,
        id: Uuid,
        account_id: Uuid,
        amount: i64,
        purpose_ref: &str,
    ) -> Result<GasReservationRow, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, GasReservationRow>(
            r#"
            INSERT INTO gas_reservations (id, account_id, amount, purpose_ref, state)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(account_id)
        .bind(amount)
        .bind(purpose_ref)
        .bind(ReservationState::Held)
        .fetch_one(&mut *conn)
        .await?)
    }

    async fn get_gas_reservation(self, id: Uuid) -> Result<Option<GasReservationRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, GasReservationRow>("SELECT * FROM gas_reservations WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    /// Marks the exactly-once terminal transition of a reservation.
    /// Returns false when the reservation was already settled.
    async fn settle_gas_reservation(
        self,
        id: Uuid,
        state: ReservationState,
    ) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query(
            r#"
            UPDATE gas_reservations
            SET    state = $2, settled_at = CURRENT_TIMESTAMP
            WHERE  id = $1 AND state = 'held'
            "#,
        )
        .bind(id)
        .bind(state)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn list_expired_held_reservations(
        self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<GasReservationRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, GasReservationRow>(
            r#"
            SELECT * FROM gas_reservations
            WHERE state = 'held' AND created_at < $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Sum of confirmed ledger rows, signed per type. At quiescence this
    /// equals the account balance.
    async fn confirmed_ledger_total(self, account_id: Uuid) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(
                CASE tx_type
                    WHEN 'deposit' THEN amount
                    WHEN 'refund' THEN amount
                    WHEN 'withdrawal' THEN -amount
                    WHEN 'service_fee' THEN -amount
                END
            ), 0)::BIGINT
            FROM gas_transactions
            WHERE account_id = $1 AND status = 'confirmed'
            "#,
        )
        .bind(account_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<i64, _>(0))
    }

    async fn held_reservation_total(self, account_id: Uuid) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT
            FROM gas_reservations
            WHERE account_id = $1 AND state = 'held'
            "#,
        )
        .bind(account_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<i64, _>(0))
    }

    // ------------------------------------------------------------------
    // Wallets and transactions
    // ------------------------------------------------------------------

    async fn insert_wallet(
        self,
        id: Uuid,
        service: &str,
        address: &str,
        encrypted_private_key: &[u8],
        public_key: &str,
        is_primary: bool,
    ) -> Result<WalletRow, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, WalletRow>(
            r#"
            INSERT INTO wallets (id, service, address, encrypted_private_key, public_key, is_primary)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(service)
        .bind(address)
        .bind(encrypted_private_key)
        .bind(public_key)
        .bind(is_primary)
        .fetch_one(&mut *conn)
        .await?)
    }

    /// Demotes the current primary wallet of a service. Called before
    /// inserting a replacement inside the same transaction.
    async fn demote_primary_wallet(self, service: &str) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query("UPDATE wallets SET is_primary = FALSE WHERE service = $1 AND is_primary")
            .bind(service)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    async fn get_wallet(self, id: Uuid) -> Result<Option<WalletRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, WalletRow>("SELECT * FROM wallets WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    async fn get_primary_wallet(self, service: &str) -> Result<Option<WalletRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, WalletRow>(
                "SELECT * FROM wallets WHERE service = $1 AND is_primary",
            )
            .bind(service)
            .fetch_optional(&mut *conn)
            .await?,
        )
    }

    async fn list_wallets(self, service: Option<&str>) -> Result<Vec<WalletRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, WalletRow>(
            r#"
            SELECT * FROM wallets
            WHERE ($1::text IS NULL OR service = $1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(service)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Locks the wallet row and returns it; used by the nonce allocator.
    async fn lock_wallet(self, id: Uuid) -> Result<Option<WalletRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, WalletRow>("SELECT * FROM wallets WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    async fn set_wallet_next_nonce(self, id: Uuid, next_nonce: i64) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query("UPDATE wallets SET next_nonce = $2 WHERE id = $1")
            .bind(id)
            .bind(next_nonce)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    async fn insert_transaction(
        self,
        id: Uuid,
        owner_id: Uuid,
        service: &str,
        entity_ref: Option<&str>,
        payload: &serde_json::Value,
        gas_reservation_id: Option<Uuid>,
    ) -> Result<TransactionRow, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, TransactionRow>(
            r#"
            INSERT INTO transactions (id, owner_id, service, entity_ref, state, payload, gas_reservation_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .bind(service)
        .bind(entity_ref)
        .bind(TransactionState::Created)
        .bind(payload)
        .bind(gas_reservation_id)
        .fetch_one(&mut *conn)
        .await?)
    }

    async fn get_transaction(self, id: Uuid) -> Result<Option<TransactionRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, TransactionRow>("SELECT * FROM transactions WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    async fn list_transactions(
        self,
        owner_id: Option<Uuid>,
        service: Option<&str>,
        state: Option<TransactionState>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TransactionRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM transactions
            WHERE ($1::uuid IS NULL OR owner_id = $1)
            AND   ($2::text IS NULL OR service = $2)
            AND   ($3::text IS NULL OR state = $3)
            ORDER BY created_at DESC
            OFFSET $4 LIMIT $5
            "#,
        )
        .bind(owner_id)
        .bind(service)
        .bind(state)
        .bind(offset)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    async fn list_transactions_in_state(
        self,
        state: TransactionState,
        limit: i64,
    ) -> Result<Vec<TransactionRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM transactions
            WHERE state = $1
            ORDER BY updated_at
            LIMIT $2
            "#,
        )
        .bind(state)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Guarded state transition. Returns the updated row, or None when the
    /// transaction was not in one of `from` anymore.
    async fn transition_transaction(
        self,
        id: Uuid,
        from: &[TransactionState],
        to: TransactionState,
    ) -> Result<Option<TransactionRow>, Error> {
        let mut conn = self.acquire().await?;

        let from: Vec<&'static str> = from.iter().map(|s| <&str>::from(*s)).collect();
        let from: Vec<String> = from.into_iter().map(String::from).collect();

        Ok(sqlx::query_as::<_, TransactionRow>(
            r#"
            UPDATE transactions
            SET    state = $2, updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1 AND state = ANY($3)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(to)
        .bind(&from)
        .fetch_optional(&mut *conn)
        .await?)
    }

    async fn mark_transaction_signed(
        self,
        id: Uuid,
        wallet_id: Uuid,
        nonce: i64,
        raw_signed: &[u8],
    ) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query(
            r#"
            UPDATE transactions
            SET    state = 'signed', wallet_id = $2, nonce = $3, raw_signed = $4,
                   updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1 AND state IN ('created', 'signed', 'submitted')
            "#,
        )
        .bind(id)
        .bind(wallet_id)
        .bind(nonce)
        .bind(raw_signed)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn mark_transaction_submitted(self, id: Uuid, chain_tx_hash: &str) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query(
            r#"
            UPDATE transactions
            SET    state = 'submitted', chain_tx_hash = $2,
                   submitted_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1 AND state = 'signed'
            "#,
        )
        .bind(id)
        .bind(chain_tx_hash)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn mark_transaction_confirmed(
        self,
        id: Uuid,
        block_height: i64,
        fee_paid: i64,
    ) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query(
            r#"
            UPDATE transactions
            SET    state = 'confirmed', block_height = $2, fee_paid = $3,
                   confirmed_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1 AND state = 'submitted'
            "#,
        )
        .bind(id)
        .bind(block_height)
        .bind(fee_paid)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    /// A reorg dropped the hash below the confirmation threshold.
    async fn revert_transaction_to_submitted(self, id: Uuid) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query(
            r#"
            UPDATE transactions
            SET    state = 'submitted', block_height = NULL, fee_paid = NULL,
                   confirmed_at = NULL, updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1 AND state = 'confirmed'
            "#,
        )
        .bind(id)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn mark_transaction_failed(self, id: Uuid, last_error: &str) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query(
            r#"
            UPDATE transactions
            SET    state = 'failed', last_error = $2, updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1 AND state IN ('created', 'signed', 'submitted', 'confirmed')
            "#,
        )
        .bind(id)
        .bind(last_error)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn mark_transaction_cancelled(self, id: Uuid) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query(
            r#"
            UPDATE transactions
            SET    state = 'cancelled', updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1 AND state IN ('created', 'signed')
            "#,
        )
        .bind(id)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn bump_transaction_retry(self, id: Uuid, last_error: &str) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            UPDATE transactions
            SET    retry_count = retry_count + 1, last_error = $2,
                   updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .bind(last_error)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<i64, _>(0))
    }

    async fn insert_transaction_event(
        self,
        transaction_id: Uuid,
        state: TransactionState,
        detail: &str,
    ) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO transaction_events (transaction_id, state, detail)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(transaction_id)
        .bind(state)
        .bind(detail)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn list_transaction_events(
        self,
        transaction_id: Uuid,
    ) -> Result<Vec<TransactionEventRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, TransactionEventRow>(
            r#"
            SELECT * FROM transaction_events
            WHERE transaction_id = $1
            ORDER BY id
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&mut *conn)
        .await?)
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    async fn insert_trigger(
        self,
        id: Uuid,
        owner_id: Uuid,
        function_id: Uuid,
        kind: TriggerKind,
        trigger_config: &serde_json::Value,
        enabled: bool,
    ) -> Result<TriggerRow, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, TriggerRow>(
            r#"
            INSERT INTO triggers (id, owner_id, function_id, kind, config, enabled)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .bind(function_id)
        .bind(kind)
        .bind(trigger_config)
        .bind(enabled)
        .fetch_one(&mut *conn)
        .await?)
    }

    async fn update_trigger(
        self,
        id: Uuid,
        trigger_config: &serde_json::Value,
        enabled: bool,
    ) -> Result<Option<TriggerRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, TriggerRow>(
            r#"
            UPDATE triggers
            SET    config = $2, enabled = $3, updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(trigger_config)
        .bind(enabled)
        .fetch_optional(&mut *conn)
        .await?)
    }

    async fn set_trigger_status(
        self,
        id: Uuid,
        status: TriggerStatus,
        consecutive_failures: i64,
    ) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query(
            r#"
            UPDATE triggers
            SET    status = $2, consecutive_failures = $3, updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(consecutive_failures)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn record_trigger_fire(
        self,
        id: Uuid,
        fired_at: DateTime<Utc>,
        last_status: TriggerEventStatus,
        consecutive_failures: i64,
        status: TriggerStatus,
    ) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE triggers
            SET    last_fired_at = $2, last_status = $3, consecutive_failures = $4,
                   status = $5, updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1
            "#,
        )
        .bind(id)
        .bind(fired_at)
        .bind(last_status)
        .bind(consecutive_failures)
        .bind(status)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn delete_trigger(self, id: Uuid) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query("DELETE FROM triggers WHERE id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn get_trigger(self, id: Uuid) -> Result<Option<TriggerRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, TriggerRow>("SELECT * FROM triggers WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    async fn list_triggers(
        self,
        owner_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TriggerRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, TriggerRow>(
            r#"
            SELECT * FROM triggers
            WHERE owner_id = $1
            ORDER BY created_at DESC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(owner_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    async fn list_enabled_triggers(self) -> Result<Vec<TriggerRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, TriggerRow>("SELECT * FROM triggers WHERE enabled ORDER BY id")
                .fetch_all(&mut *conn)
                .await?,
        )
    }

    async fn insert_trigger_event(
        self,
        id: Uuid,
        trigger_id: Uuid,
        fired_at: DateTime<Utc>,
        execution_id: Option<Uuid>,
        status: TriggerEventStatus,
        detail: &str,
    ) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO trigger_events (id, trigger_id, fired_at, execution_id, status, detail)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(trigger_id)
        .bind(fired_at)
        .bind(execution_id)
        .bind(status)
        .bind(detail)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn list_trigger_events(
        self,
        trigger_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TriggerEventRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, TriggerEventRow>(
            r#"
            SELECT * FROM trigger_events
            WHERE trigger_id = $1
            ORDER BY fired_at DESC, seq DESC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(trigger_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    // ------------------------------------------------------------------
    // Oracle
    // ------------------------------------------------------------------

    async fn insert_oracle_source(
        self,
        id: Uuid,
        owner_id: Option<Uuid>,
        name: &str,
        url: &str,
        method: &str,
        headers: &serde_json::Value,
        json_path: &str,
        transform: &str,
    ) -> Result<OracleSourceRow, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, OracleSourceRow>(
            r#"
            INSERT INTO oracle_sources (id, owner_id, name, url, method, headers, json_path, transform)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .bind(name)
        .bind(url)
        .bind(method)
        .bind(headers)
        .bind(json_path)
        .bind(transform)
        .fetch_one(&mut *conn)
        .await?)
    }

    async fn update_oracle_source(
        self,
        id: Uuid,
        url: &str,
        method: &str,
        headers: &serde_json::Value,
        json_path: &str,
        transform: &str,
        active: bool,
    ) -> Result<Option<OracleSourceRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, OracleSourceRow>(
            r#"
            UPDATE oracle_sources
            SET    url = $2, method = $3, headers = $4, json_path = $5,
                   transform = $6, active = $7, updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(url)
        .bind(method)
        .bind(headers)
        .bind(json_path)
        .bind(transform)
        .bind(active)
        .fetch_optional(&mut *conn)
        .await?)
    }

    async fn delete_oracle_source(self, id: Uuid) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query("DELETE FROM oracle_sources WHERE id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn get_oracle_source(self, id: Uuid) -> Result<Option<OracleSourceRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, OracleSourceRow>("SELECT * FROM oracle_sources WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    async fn get_oracle_source_by_name(self, name: &str) -> Result<Option<OracleSourceRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, OracleSourceRow>("SELECT * FROM oracle_sources WHERE name = $1")
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    async fn list_oracle_sources(self, offset: i64, limit: i64) -> Result<Vec<OracleSourceRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, OracleSourceRow>(
            r#"
            SELECT * FROM oracle_sources
            ORDER BY name
            OFFSET $1 LIMIT $2
            "#,
        )
        .bind(offset)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    async fn insert_oracle_request(
        self,
        id: Uuid,
        source_id: Uuid,
        requester_id: Option<Uuid>,
        callback_url: Option<&str>,
    ) -> Result<OracleRequestRow, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, OracleRequestRow>(
            r#"
            INSERT INTO oracle_requests (id, source_id, requester_id, status, callback_url)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(source_id)
        .bind(requester_id)
        .bind(OracleRequestStatus::Pending)
        .bind(callback_url)
        .fetch_one(&mut *conn)
        .await?)
    }

    async fn get_oracle_request(self, id: Uuid) -> Result<Option<OracleRequestRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, OracleRequestRow>("SELECT * FROM oracle_requests WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    /// Atomically claims up to `limit` pending requests for the worker.
    async fn claim_pending_oracle_requests(
        self,
        limit: i64,
    ) -> Result<Vec<OracleRequestRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, OracleRequestRow>(
            r#"
            UPDATE oracle_requests
            SET    status = 'running'
            WHERE  id IN (
                SELECT id FROM oracle_requests
                WHERE status = 'pending'
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    async fn complete_oracle_request(
        self,
        id: Uuid,
        status: OracleRequestStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query(
            r#"
            UPDATE oracle_requests
            SET    status = $2, result = $3, error = $4, completed_at = CURRENT_TIMESTAMP
            WHERE  id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(result)
        .bind(error)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Random requests
    // ------------------------------------------------------------------

    async fn insert_random_request(
        self,
        id: Uuid,
        owner_id: Uuid,
        contract: &str,
        request_id: &str,
        num_words: i64,
        seed: &str,
    ) -> Result<RandomRequestRow, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, RandomRequestRow>(
            r#"
            INSERT INTO random_requests (id, owner_id, contract, request_id, num_words, seed, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .bind(contract)
        .bind(request_id)
        .bind(num_words)
        .bind(seed)
        .bind(RandomRequestStatus::Pending)
        .fetch_one(&mut *conn)
        .await?)
    }

    async fn update_random_request(
        self,
        id: Uuid,
        status: RandomRequestStatus,
        transaction_id: Option<Uuid>,
    ) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let res = sqlx::query(
            r#"
            UPDATE random_requests
            SET    status = $2, transaction_id = $3
            WHERE  id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(transaction_id)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn get_random_request(self, id: Uuid) -> Result<Option<RandomRequestRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, RandomRequestRow>("SELECT * FROM random_requests WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }
}

impl<'c, T> DbMethods<'c> for T where T: Acquire<'c, Database = Postgres> + Sized + Send {}
