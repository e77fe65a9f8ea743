use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::database::types::{
    ExecutionRow, ExecutionStatus, FunctionRow, GasAccountRow, GasTransactionRow,
    GasTransactionStatus, GasTransactionType, OracleRequestRow, OracleRequestStatus,
    OracleSourceRow, SecretAuditRow, SecretRow, TransactionEventRow, TransactionRow,
    TransactionState, TriggerEventRow, TriggerEventStatus, TriggerKind, TriggerRow,
    TriggerStatus, WalletRow,
};
use crate::utils::gas::format_gas;

/// The uniform response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Identity resolved by the auth middleware and injected into request
/// extensions.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub handle: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: i64,
    pub limit: Option<i64>,
    #[serde(default)]
    pub include_total: bool,
}

#[derive(Debug, Serialize)]
pub struct Page<T: Serialize> {
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

// ---------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateFunctionRequest {
    pub name: String,
    pub source_code: String,
    pub timeout_ms: Option<i64>,
    pub memory_mb: Option<i64>,
    #[serde(default)]
    pub secret_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateFunctionRequest {
    pub source_code: String,
    pub timeout_ms: Option<i64>,
    pub memory_mb: Option<i64>,
    #[serde(default)]
    pub secret_names: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FunctionResponse {
    pub id: Uuid,
    pub name: String,
    pub timeout_ms: i64,
    pub memory_mb: i64,
    pub secret_names: Vec<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<FunctionRow> for FunctionResponse {
    fn from(row: FunctionRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            timeout_ms: row.timeout_ms,
            memory_mb: row.memory_mb,
            secret_names: row.secret_names,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecuteFunctionRequest {
    #[serde(default)]
    pub params: Value,
    /// When set, the request blocks up to this long for a terminal state.
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ExecutionResponse {
    pub id: Uuid,
    pub function_id: Uuid,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub params_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub logs: Vec<String>,
}

impl From<ExecutionRow> for ExecutionResponse {
    fn from(row: ExecutionRow) -> Self {
        Self {
            id: row.id,
            function_id: row.function_id,
            status: row.status,
            started_at: row.started_at,
            finished_at: row.finished_at,
            duration_ms: row.duration_ms,
            params_hash: row.params_hash,
            result: row.result_json,
            error_kind: row.error_kind,
            error_message: row.error_message,
            logs: row.logs,
        }
    }
}

// ---------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSecretRequest {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub description: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateSecretRequest {
    pub value: String,
    #[serde(default)]
    pub description: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Secret metadata; the value is only present on the two explicit
/// plaintext read endpoints.
#[derive(Debug, Serialize)]
pub struct SecretResponse {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub wrap_scheme: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl SecretResponse {
    pub fn metadata(row: SecretRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            wrap_scheme: row.wrap_scheme,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
            value: None,
        }
    }

    pub fn with_value(row: SecretRow, value: String) -> Self {
        Self {
            value: Some(value),
            ..Self::metadata(row)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SecretAuditResponse {
    pub secret_id: Uuid,
    pub actor: String,
    pub action: String,
    pub at: DateTime<Utc>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl From<SecretAuditRow> for SecretAuditResponse {
    fn from(row: SecretAuditRow) -> Self {
        Self {
            secret_id: row.secret_id,
            actor: row.actor,
            action: row.action.to_string(),
            at: row.at,
            source_ip: row.source_ip,
            user_agent: row.user_agent,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RotationResponse {
    pub rotated: usize,
}

// ---------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTriggerRequest {
    pub function_id: Uuid,
    pub kind: TriggerKind,
    pub config: Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateTriggerRequest {
    pub config: Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManualFireRequest {
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub id: Uuid,
    pub function_id: Uuid,
    pub kind: TriggerKind,
    pub config: Value,
    pub enabled: bool,
    pub status: TriggerStatus,
    pub consecutive_failures: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
}

impl From<TriggerRow> for TriggerResponse {
    fn from(row: TriggerRow) -> Self {
        Self {
            id: row.id,
            function_id: row.function_id,
            kind: row.kind,
            config: row.config,
            enabled: row.enabled,
            status: row.status,
            consecutive_failures: row.consecutive_failures,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_fired_at: row.last_fired_at,
            last_status: row.last_status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TriggerEventResponse {
    pub id: Uuid,
    pub trigger_id: Uuid,
    pub fired_at: DateTime<Utc>,
    pub execution_id: Option<Uuid>,
    pub status: TriggerEventStatus,
    pub detail: String,
}

impl From<TriggerEventRow> for TriggerEventResponse {
    fn from(row: TriggerEventRow) -> Self {
        Self {
            id: row.id,
            trigger_id: row.trigger_id,
            fired_at: row.fired_at,
            execution_id: row.execution_id,
            status: row.status,
            detail: row.detail,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FireResponse {
    pub trigger_event_id: Uuid,
}

// ---------------------------------------------------------------------
// Gas bank
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct GasBalanceResponse {
    pub address: Option<String>,
    pub balance: String,
    pub reserved: String,
    pub available: String,
}

impl GasBalanceResponse {
    pub fn from_account(account: Option<GasAccountRow>) -> Self {
        match account {
            Some(account) => Self {
                address: Some(account.address.clone()),
                balance: format_gas(account.balance),
                reserved: format_gas(account.reserved),
                available: format_gas(account.available()),
            },
            None => Self {
                address: None,
                balance: format_gas(0),
                reserved: format_gas(0),
                available: format_gas(0),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DepositAddressResponse {
    pub address: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WithdrawRequest {
    /// Decimal GAS amount, e.g. "1.5".
    pub amount: String,
    pub target_address: String,
}

#[derive(Debug, Serialize)]
pub struct GasTransactionResponse {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub tx_type: GasTransactionType,
    pub amount: String,
    pub status: GasTransactionStatus,
    pub chain_tx_hash: Option<String>,
    pub memo: String,
    pub created_at: DateTime<Utc>,
}

impl From<GasTransactionRow> for GasTransactionResponse {
    fn from(row: GasTransactionRow) -> Self {
        Self {
            id: row.id,
            tx_type: row.tx_type,
            amount: format_gas(row.amount),
            status: row.status,
            chain_tx_hash: row.chain_tx_hash,
            memo: row.memo,
            created_at: row.created_at,
        }
    }
}

// ---------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTransactionRequest {
    #[serde(default = "default_service")]
    pub service: String,
    pub entity_ref: Option<String>,
    pub payload: Value,
}

fn default_service() -> String {
    "api".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct TransactionFilter {
    pub service: Option<String>,
    pub state: Option<TransactionState>,
    #[serde(default)]
    pub offset: i64,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    pub id: Uuid,
    pub service: String,
    pub entity_ref: Option<String>,
    pub state: TransactionState,
    pub nonce: Option<i64>,
    pub chain_tx_hash: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub block_height: Option<i64>,
    pub fee_paid: Option<String>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<TransactionRow> for TransactionResponse {
    fn from(row: TransactionRow) -> Self {
        Self {
            id: row.id,
            service: row.service,
            entity_ref: row.entity_ref,
            state: row.state,
            nonce: row.nonce,
            chain_tx_hash: row.chain_tx_hash,
            submitted_at: row.submitted_at,
            confirmed_at: row.confirmed_at,
            block_height: row.block_height,
            fee_paid: row.fee_paid.map(format_gas),
            retry_count: row.retry_count,
            last_error: row.last_error,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TransactionEventResponse {
    pub state: TransactionState,
    pub at: DateTime<Utc>,
    pub detail: String,
}

impl From<TransactionEventRow> for TransactionEventResponse {
    fn from(row: TransactionEventRow) -> Self {
        Self {
            state: row.state,
            at: row.at,
            detail: row.detail,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WalletResponse {
    pub id: Uuid,
    pub service: String,
    pub address: String,
    pub public_key: String,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

impl From<WalletRow> for WalletResponse {
    fn from(row: WalletRow) -> Self {
        Self {
            id: row.id,
            service: row.service,
            address: row.address,
            public_key: row.public_key,
            is_primary: row.is_primary,
            created_at: row.created_at,
        }
    }
}

// ---------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OracleSourceRequest {
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_headers")]
    pub headers: Value,
    #[serde(default)]
    pub json_path: String,
    #[serde(default = "default_transform")]
    pub transform: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_headers() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_transform() -> String {
    "none".to_string()
}

#[derive(Debug, Serialize)]
pub struct OracleSourceResponse {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub method: String,
    pub json_path: String,
    pub transform: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<OracleSourceRow> for OracleSourceResponse {
    fn from(row: OracleSourceRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            url: row.url,
            method: row.method,
            json_path: row.json_path,
            transform: row.transform,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OracleRequestRequest {
    pub source: String,
    pub callback_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OracleRequestResponse {
    pub id: Uuid,
    pub status: OracleRequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<OracleRequestRow> for OracleRequestResponse {
    fn from(row: OracleRequestRow) -> Self {
        Self {
            id: row.id,
            status: row.status,
            result: row.result,
            error: row.error,
            created_at: row.created_at,
            completed_at: row.completed_at,
        }
    }
}
