#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use neo_service_layer::chain::dev::DevChain;
use neo_service_layer::config::{self, GasBankConfig, OracleConfig, SandboxConfig, SecretsConfig};
use neo_service_layer::database::types::FunctionRow;
use neo_service_layer::database::Database;
use neo_service_layer::gas_bank::GasBank;
use neo_service_layer::oracle::OracleService;
use neo_service_layer::sandbox::host::{ExecutionIdentity, HostCapabilities};
use neo_service_layer::sandbox::SandboxRuntime;
use neo_service_layer::secrets::SecretsService;
use neo_service_layer::transactions::signer::LocalSigner;
use neo_service_layer::transactions::TransactionManager;
use neo_service_layer::utils::serde_utils::JsonStrWrapper;

pub const MASTER_KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

/// A database handle that never connects; tests here exercise the parts
/// of the stack that stay in memory.
pub fn lazy_database() -> Arc<Database> {
    let pool = sqlx::pool::PoolOptions::<sqlx::Postgres>::new()
        .connect_lazy("postgres://localhost:1/never_connected")
        .unwrap();

    Arc::new(Database { pool })
}

pub fn sandbox_config() -> SandboxConfig {
    SandboxConfig {
        workers: 1,
        queue_depth: 16,
        max_timeout_ms: 30_000,
        max_memory_mb: 128,
        fuel_limit: u64::MAX,
        max_params_bytes: config::default::max_params_bytes(),
        max_result_bytes: config::default::max_result_bytes(),
        max_log_lines: config::default::max_log_lines(),
        max_log_line_bytes: config::default::max_log_line_bytes(),
        http_allow_list: JsonStrWrapper(vec![]),
        fetch_timeout: config::default::fetch_timeout(),
        max_fetch_response_bytes: config::default::max_fetch_response_bytes(),
    }
}

pub fn runtime_with(sandbox: SandboxConfig) -> SandboxRuntime {
    let database = lazy_database();

    let secrets_config = SecretsConfig {
        master_key: MASTER_KEY.parse().unwrap(),
        rotation_batch_size: 10,
    };

    let gas_bank = Arc::new(GasBank::new(
        database.clone(),
        GasBankConfig {
            min_deposit: config::default::min_deposit(),
            reservation_ttl: config::default::reservation_ttl(),
            reaper_interval: config::default::reaper_interval(),
            execution_reserve: config::default::execution_reserve(),
            tx_fee_reserve: config::default::tx_fee_reserve(),
            gas_per_second: config::default::gas_per_second(),
            contention_retries: 0,
        },
    ));

    let secrets = Arc::new(SecretsService::new(database.clone(), &secrets_config).unwrap());
    let oracle = Arc::new(OracleService::new(database.clone(), OracleConfig::default()).unwrap());

    let transactions = Arc::new(TransactionManager::new(
        database.clone(),
        gas_bank.clone(),
        Arc::new(DevChain::new()),
        Arc::new(LocalSigner::new(MASTER_KEY).unwrap()),
        LocalSigner::new(MASTER_KEY).unwrap(),
        Default::default(),
    ));

    let caps = Arc::new(HostCapabilities {
        database,
        secrets,
        oracle,
        transactions,
        gas_bank,
        http: reqwest::Client::new(),
        config: sandbox,
    });

    SandboxRuntime::new(caps).unwrap()
}

pub fn function_with(source_code: &str, timeout_ms: i64, memory_mb: i64) -> FunctionRow {
    FunctionRow {
        id: Uuid::new_v4(),
        owner_id: Uuid::new_v4(),
        name: "test-function".to_string(),
        source_code: source_code.to_string(),
        timeout_ms,
        memory_mb,
        secret_names: vec![],
        version: 1,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn identity_for(function: &FunctionRow) -> ExecutionIdentity {
    ExecutionIdentity {
        execution_id: Uuid::new_v4(),
        owner_id: function.owner_id,
        declared_secrets: function.secret_names.clone(),
    }
}
