use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::Executor as _;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::chain::{dev::DevChain, NeoRpc, RpcClient};
use crate::config::Config;
use crate::database::methods::DbMethods as _;
use crate::database::types::{
    ExecutionRow, FunctionRow, GasAccountRow, GasTransactionRow, TransactionRow, UserRow,
};
use crate::database::{clamp_limit, Database};
use crate::error::{ServiceError, ServiceResult};
use crate::gas_bank::GasBank;
use crate::oracle::OracleService;
use crate::sandbox::host::HostCapabilities;
use crate::sandbox::{ExecutionPipeline, SandboxRuntime};
use crate::secrets::SecretsService;
use crate::transactions::signer::LocalSigner;
use crate::transactions::{TransactionManager, TxIntent, WITHDRAWAL_SERVICE};
use crate::triggers::price::{ChannelPriceFeed, HttpPriceFeed, PriceFeed};
use crate::triggers::TriggerEngine;

/// The service wallet whose address users deposit GAS to.
pub const GASBANK_SERVICE: &str = "gasbank";

pub struct App {
    pub config: Config,
    pub database: Arc<Database>,
    pub rpc: Arc<dyn NeoRpc>,
    pub gas_bank: Arc<GasBank>,
    pub secrets: Arc<SecretsService>,
    pub oracle: Arc<OracleService>,
    pub transactions: Arc<TransactionManager>,
    pub pipeline: Arc<ExecutionPipeline>,
    pub triggers: Arc<TriggerEngine>,
    pub price_feed: Arc<dyn PriceFeed>,
    /// Set when the price feed is the polling implementation; the task
    /// monitor owns its loop.
    pub http_price_feed: Option<Arc<HttpPriceFeed>>,
}

impl App {
    /// Wires every component. `rpc` and `price_feed` default to the
    /// configured node and an in-process feed; tests inject their own.
    #[instrument(name = "App::new", level = "debug", skip_all)]
    pub async fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let rpc: Arc<dyn NeoRpc> = if config.chain.dev_mode {
            warn!("Using the in-memory dev chain; transactions never leave this process");
            Arc::new(DevChain::new())
        } else {
            Arc::new(RpcClient::new(&config.chain)?)
        };

        let http_price_feed = match &config.triggers.price_feed_url {
            Some(url) => Some(Arc::new(HttpPriceFeed::new(
                url.expose().to_string(),
                config.triggers.price_feed_interval,
            )?)),
            None => None,
        };

        let price_feed: Arc<dyn PriceFeed> = match &http_price_feed {
            Some(feed) => feed.clone(),
            None => Arc::new(ChannelPriceFeed::new(256)),
        };

        Self::build(config, rpc, price_feed, http_price_feed).await
    }

    /// Wiring with injected collaborators, used by tests.
    pub async fn with_collaborators(
        config: Config,
        rpc: Arc<dyn NeoRpc>,
        price_feed: Arc<dyn PriceFeed>,
    ) -> anyhow::Result<Arc<Self>> {
        Self::build(config, rpc, price_feed, None).await
    }

    async fn build(
        config: Config,
        rpc: Arc<dyn NeoRpc>,
        price_feed: Arc<dyn PriceFeed>,
        http_price_feed: Option<Arc<HttpPriceFeed>>,
    ) -> anyhow::Result<Arc<Self>> {
        let database = Arc::new(Database::new(&config.database).await?);

        let gas_bank = Arc::new(GasBank::new(database.clone(), config.gas_bank.clone()));
        let secrets = Arc::new(SecretsService::new(database.clone(), &config.secrets)?);
        let oracle = Arc::new(OracleService::new(database.clone(), config.oracle.clone())?);

        let signer = LocalSigner::new(config.secrets.master_key.expose())?;
        let transactions = Arc::new(TransactionManager::new(
            database.clone(),
            gas_bank.clone(),
            rpc.clone(),
            Arc::new(LocalSigner::new(config.secrets.master_key.expose())?),
            signer,
            config.transactions.clone(),
        ));

        let caps = Arc::new(HostCapabilities {
            database: database.clone(),
            secrets: secrets.clone(),
            oracle: oracle.clone(),
            transactions: transactions.clone(),
            gas_bank: gas_bank.clone(),
            http: reqwest::Client::builder()
                .timeout(config.sandbox.fetch_timeout)
                .build()?,
            config: config.sandbox.clone(),
        });

        let runtime = SandboxRuntime::new(caps)?;

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(ExecutionPipeline::new(
            database.clone(),
            gas_bank.clone(),
            runtime,
            completions_tx,
        ));

        let triggers = Arc::new(TriggerEngine::new(
            database.clone(),
            pipeline.clone(),
            config.triggers.clone(),
            completions_rx,
        ));

        let app = Arc::new(Self {
            config,
            database,
            rpc,
            gas_bank,
            secrets,
            oracle,
            transactions,
            pipeline,
            triggers,
            price_feed,
            http_price_feed,
        });

        Ok(app)
    }

    /// Loads persistent state the background tasks depend on and settles
    /// work orphaned by an unclean stop. Called once before the task
    /// monitor starts.
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        self.triggers.load().await?;
        self.settle_orphaned_executions().await?;
        self.transactions.requeue_pending().await?;

        // Make sure the deposit wallet exists so the deposit address is
        // stable from the first request on.
        if self
            .transactions
            .primary_wallet(GASBANK_SERVICE)
            .await?
            .is_none()
        {
            self.transactions.create_wallet(GASBANK_SERVICE).await?;
        }

        Ok(())
    }

    /// Queued and running rows found at startup belong to a previous
    /// process; their jobs are gone, so they terminate as errors and
    /// their holds are released.
    async fn settle_orphaned_executions(&self) -> anyhow::Result<()> {
        let orphans = self.database.pool.list_unsettled_executions(1000).await?;

        for row in &orphans {
            self.database
                .pool
                .finish_execution(
                    row.id,
                    crate::database::types::ExecutionStatus::Error,
                    0,
                    None,
                    Some("internal"),
                    Some("interrupted by service restart"),
                    &[],
                )
                .await?;

            if let Some(reservation_id) = row.gas_reservation_id {
                if let Err(err) = self.gas_bank.refund(reservation_id).await {
                    if err.kind != crate::error::ErrorKind::Conflict {
                        warn!(execution = %row.id, ?err, "Failed to release orphaned hold");
                    }
                }
            }
        }

        if !orphans.is_empty() {
            warn!(count = orphans.len(), "Settled executions orphaned by restart");
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub async fn resolve_api_key(&self, api_key: &str) -> ServiceResult<UserRow> {
        use sha2::{Digest, Sha256};

        let key_hash = hex::encode(Sha256::digest(api_key.as_bytes()));

        self.database
            .pool
            .get_user_by_api_key_hash(&key_hash)
            .await?
            .ok_or_else(|| ServiceError::new(crate::error::ErrorKind::Unauthorized, "invalid api key"))
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    #[instrument(level = "debug", skip(self, source_code))]
    pub async fn create_function(
        &self,
        owner_id: Uuid,
        name: &str,
        source_code: &str,
        timeout_ms: Option<i64>,
        memory_mb: Option<i64>,
        secret_names: Vec<String>,
    ) -> ServiceResult<FunctionRow> {
        if name.is_empty() || name.len() > 256 {
            return Err(ServiceError::invalid("function name must be 1-256 characters"));
        }

        let (timeout_ms, memory_mb) = self.validated_limits(timeout_ms, memory_mb)?;

        self.pipeline.runtime().validate_source(source_code)?;

        self.database
            .pool
            .insert_function(
                Uuid::new_v4(),
                owner_id,
                name,
                source_code,
                timeout_ms,
                memory_mb,
                &secret_names,
            )
            .await
            .map_err(|err| {
                if err.is_unique_violation() {
                    ServiceError::conflict(format!("function {name:?} already exists"))
                } else {
                    err.into()
                }
            })
    }

    #[instrument(level = "debug", skip(self, source_code))]
    pub async fn update_function(
        &self,
        owner_id: Uuid,
        id: Uuid,
        source_code: &str,
        timeout_ms: Option<i64>,
        memory_mb: Option<i64>,
        secret_names: Vec<String>,
    ) -> ServiceResult<FunctionRow> {
        self.get_function(owner_id, id).await?;

        let (timeout_ms, memory_mb) = self.validated_limits(timeout_ms, memory_mb)?;

        self.pipeline.runtime().validate_source(source_code)?;

        self.database
            .pool
            .update_function(id, source_code, timeout_ms, memory_mb, &secret_names)
            .await?
            .ok_or_else(|| ServiceError::not_found("function does not exist"))
    }

    /// Deleting a function waits for its executions: only once every
    /// child row is terminal may the row go away.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete_function(&self, owner_id: Uuid, id: Uuid) -> ServiceResult<()> {
        self.get_function(owner_id, id).await?;

        let active = self.database.pool.count_active_executions(id).await?;
        if active > 0 {
            return Err(ServiceError::conflict(format!(
                "{active} executions are still running"
            )));
        }

        self.database.pool.delete_function(id).await?;

        Ok(())
    }

    pub async fn get_function(&self, owner_id: Uuid, id: Uuid) -> ServiceResult<FunctionRow> {
        let row = self
            .database
            .pool
            .get_function(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("function does not exist"))?;

        if row.owner_id != owner_id {
            return Err(ServiceError::not_found("function does not exist"));
        }

        Ok(row)
    }

    pub async fn list_functions(
        &self,
        owner_id: Uuid,
        offset: i64,
        limit: Option<i64>,
    ) -> ServiceResult<(Vec<FunctionRow>, i64)> {
        let rows = self
            .database
            .pool
            .list_functions(owner_id, offset.max(0), clamp_limit(limit))
            .await?;
        let total = self.database.pool.count_functions(owner_id).await?;

        Ok((rows, total))
    }

    /// Queues an execution; with `wait`, polls until the execution is
    /// terminal or the wait budget runs out (the row is returned either
    /// way).
    #[instrument(level = "debug", skip(self, params))]
    pub async fn execute_function(
        &self,
        owner_id: Uuid,
        id: Uuid,
        params: Value,
        wait: Option<Duration>,
    ) -> ServiceResult<ExecutionRow> {
        let function = self.get_function(owner_id, id).await?;

        let row = self.pipeline.submit(&function, params, None).await?;

        let Some(wait) = wait else {
            return Ok(row);
        };

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let current = self
                .database
                .pool
                .get_execution(row.id)
                .await?
                .ok_or_else(|| ServiceError::internal("execution row disappeared"))?;

            if current.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(current);
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn get_execution(
        &self,
        owner_id: Uuid,
        function_id: Uuid,
        execution_id: Uuid,
    ) -> ServiceResult<ExecutionRow> {
        self.get_function(owner_id, function_id).await?;

        let row = self
            .database
            .pool
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("execution does not exist"))?;

        if row.function_id != function_id {
            return Err(ServiceError::not_found("execution does not exist"));
        }

        Ok(row)
    }

    pub async fn list_executions(
        &self,
        owner_id: Uuid,
        function_id: Uuid,
        offset: i64,
        limit: Option<i64>,
    ) -> ServiceResult<Vec<ExecutionRow>> {
        self.get_function(owner_id, function_id).await?;

        Ok(self
            .database
            .pool
            .list_executions(function_id, offset.max(0), clamp_limit(limit))
            .await?)
    }

    // ------------------------------------------------------------------
    // Gas bank
    // ------------------------------------------------------------------

    /// The address users deposit GAS to; one service wallet for everyone,
    /// deposits are attributed by sender.
    pub async fn deposit_address(&self) -> ServiceResult<String> {
        self.transactions
            .primary_wallet(GASBANK_SERVICE)
            .await?
            .map(|wallet| wallet.address)
            .ok_or_else(|| ServiceError::unavailable("deposit wallet is not provisioned"))
    }

    pub async fn gas_balance(&self, owner_id: Uuid) -> ServiceResult<Option<GasAccountRow>> {
        self.gas_bank.primary_account(owner_id).await
    }

    pub async fn list_gas_transactions(
        &self,
        owner_id: Uuid,
        offset: i64,
        limit: Option<i64>,
    ) -> ServiceResult<Vec<GasTransactionRow>> {
        let Some(account) = self.gas_bank.primary_account(owner_id).await? else {
            return Ok(Vec::new());
        };

        self.gas_bank
            .list_transactions(account.id, offset.max(0), clamp_limit(limit))
            .await
    }

    pub async fn get_gas_transaction(
        &self,
        owner_id: Uuid,
        id: Uuid,
    ) -> ServiceResult<GasTransactionRow> {
        let row = self
            .gas_bank
            .get_transaction(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("gas transaction does not exist"))?;

        let Some(account) = self.gas_bank.primary_account(owner_id).await? else {
            return Err(ServiceError::not_found("gas transaction does not exist"));
        };

        if row.account_id != account.id {
            return Err(ServiceError::not_found("gas transaction does not exist"));
        }

        Ok(row)
    }

    /// Reserves the amount and drives the payout through the transaction
    /// manager; the ledger settles when the chain transaction does.
    #[instrument(level = "debug", skip(self))]
    pub async fn withdraw_gas(
        &self,
        owner_id: Uuid,
        amount: i64,
        target_address: &str,
    ) -> ServiceResult<TransactionRow> {
        if target_address.is_empty() {
            return Err(ServiceError::invalid("target_address is required"));
        }

        let account = self
            .gas_bank
            .primary_account(owner_id)
            .await?
            .ok_or_else(|| ServiceError::insufficient_funds("no gas account for this user"))?;

        let withdrawal_id = Uuid::new_v4();
        let reservation = self
            .gas_bank
            .reserve(
                owner_id,
                &account.address,
                amount,
                &format!("withdraw:{withdrawal_id}"),
            )
            .await?;

        let intent = TxIntent {
            service: WITHDRAWAL_SERVICE.to_string(),
            owner: owner_id,
            entity_ref: Some(format!("withdraw:{withdrawal_id}")),
            payload: serde_json::json!({
                "to": target_address,
                "amount": amount,
            }),
            gas_reservation: Some(reservation.id),
        };

        match self.transactions.create(intent).await {
            Ok(row) => Ok(row),
            Err(err) => {
                let _ = self.gas_bank.refund(reservation.id).await;
                Err(err)
            }
        }
    }

    /// Reserves the network fee for an API-submitted transaction intent.
    pub async fn reserve_network_fee(&self, owner_id: Uuid) -> ServiceResult<Option<Uuid>> {
        let Some(account) = self.gas_bank.primary_account(owner_id).await? else {
            return Ok(None);
        };

        let reservation = self
            .gas_bank
            .reserve(
                owner_id,
                &account.address,
                self.gas_bank.config().tx_fee_reserve,
                "transaction fee",
            )
            .await?;

        Ok(Some(reservation.id))
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub async fn readiness(&self) -> ServiceResult<()> {
        self.database
            .pool
            .execute("SELECT 1")
            .await
            .map_err(|err| ServiceError::unavailable(format!("database: {err}")))?;

        self.rpc
            .get_block_height()
            .await
            .map_err(|err| ServiceError::unavailable(format!("chain: {}", err.message)))?;

        Ok(())
    }

    pub fn shutdown_config(&self) -> (Duration, Duration) {
        (
            self.config.app.shutdown_timeout,
            self.config.app.shutdown_delay,
        )
    }

    fn validated_limits(
        &self,
        timeout_ms: Option<i64>,
        memory_mb: Option<i64>,
    ) -> ServiceResult<(i64, i64)> {
        let sandbox = &self.config.sandbox;

        let timeout_ms = timeout_ms.unwrap_or(sandbox.max_timeout_ms as i64);
        if timeout_ms <= 0 || timeout_ms > sandbox.max_timeout_ms as i64 {
            return Err(ServiceError::invalid(format!(
                "timeout_ms must be between 1 and {}",
                sandbox.max_timeout_ms
            )));
        }

        let memory_mb = memory_mb.unwrap_or(sandbox.max_memory_mb as i64);
        if memory_mb <= 0 || memory_mb > sandbox.max_memory_mb as i64 {
            return Err(ServiceError::invalid(format!(
                "memory_mb must be between 1 and {}",
                sandbox.max_memory_mb
            )));
        }

        Ok((timeout_ms, memory_mb))
    }
}

/// Marker logged at startup; also keeps the crate version in the binary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn log_startup(service_name: &str) {
    info!(version = VERSION, service = service_name, "Starting service");
}
