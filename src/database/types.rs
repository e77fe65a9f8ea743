use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::ServiceError;

/// Implements the sqlx text codec for a status enum that already has
/// `From<Self> for &'static str` and `FromStr` conversions. All status
/// columns are stored as lower-case text.
macro_rules! pg_text_enum {
    ($ty:ty) => {
        impl sqlx::Type<sqlx::Postgres> for $ty {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <&str as sqlx::Type<sqlx::Postgres>>::type_info()
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&<&str>::from(*self), buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $ty {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
                Ok(s.parse::<$ty>()?)
            }
        }
    };
}

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $str:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant,)+
        }

        impl From<$name> for &'static str {
            fn from(value: $name) -> Self {
                match value {
                    $($name::$variant => $str,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(<&str>::from(*self))
            }
        }

        impl std::str::FromStr for $name {
            type Err = ServiceError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($str => Ok($name::$variant),)+
                    other => Err(ServiceError::internal(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }

        pg_text_enum!($name);
    };
}

status_enum! {
    /// Lifecycle of one function invocation. `Queued` and `Running` are the
    /// only non-terminal states; a row never leaves a terminal state.
    ExecutionStatus {
        Queued => "queued",
        Running => "running",
        Success => "success",
        Error => "error",
        Timeout => "timeout",
        Cancelled => "cancelled",
    }
}

impl ExecutionStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

status_enum! {
    TransactionState {
        Created => "created",
        Signed => "signed",
        Submitted => "submitted",
        Confirmed => "confirmed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl TransactionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed | Self::Cancelled)
    }
}

status_enum! {
    ReservationState {
        Held => "held",
        Committed => "committed",
        Refunded => "refunded",
    }
}

status_enum! {
    GasTransactionType {
        Deposit => "deposit",
        Withdrawal => "withdrawal",
        ServiceFee => "service_fee",
        Refund => "refund",
    }
}

status_enum! {
    GasTransactionStatus {
        Pending => "pending",
        Confirmed => "confirmed",
        Failed => "failed",
    }
}

status_enum! {
    TriggerKind {
        Cron => "cron",
        Price => "price",
        ChainEvent => "chain_event",
        Manual => "manual",
        Webhook => "webhook",
    }
}

status_enum! {
    TriggerStatus {
        Active => "active",
        Paused => "paused",
        Error => "error",
    }
}

status_enum! {
    TriggerEventStatus {
        Success => "success",
        Failure => "failure",
        Timeout => "timeout",
        Skipped => "skipped",
    }
}

status_enum! {
    SecretAction {
        Create => "create",
        Read => "read",
        Update => "update",
        Delete => "delete",
        Rotate => "rotate",
    }
}

status_enum! {
    OracleRequestStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
    }
}

status_enum! {
    RandomRequestStatus {
        Pending => "pending",
        Submitted => "submitted",
        Fulfilled => "fulfilled",
        Failed => "failed",
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub handle: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct FunctionRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub source_code: String,
    pub timeout_ms: i64,
    pub memory_mb: i64,
    pub secret_names: Vec<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub function_id: Uuid,
    pub trigger_event_id: Option<Uuid>,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub params_hash: String,
    pub result_json: Option<serde_json::Value>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub logs: Vec<String>,
    pub gas_reservation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SecretRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub wrapped_blob: Vec<u8>,
    pub wrap_scheme: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SecretAuditRow {
    pub id: i64,
    pub secret_id: Uuid,
    pub actor: String,
    pub action: SecretAction,
    pub at: DateTime<Utc>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct GasAccountRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub address: String,
    pub balance: i64,
    pub reserved: i64,
    pub updated_at: DateTime<Utc>,
}

impl GasAccountRow {
    #[must_use]
    pub fn available(&self) -> i64 {
        self.balance - self.reserved
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct GasReservationRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub amount: i64,
    pub purpose_ref: String,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct GasTransactionRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub tx_type: GasTransactionType,
    pub amount: i64,
    pub status: GasTransactionStatus,
    pub chain_tx_hash: Option<String>,
    pub memo: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct WalletRow {
    pub id: Uuid,
    pub service: String,
    pub address: String,
    pub encrypted_private_key: Vec<u8>,
    pub public_key: String,
    pub next_nonce: i64,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TransactionRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub service: String,
    pub entity_ref: Option<String>,
    pub state: TransactionState,
    pub wallet_id: Option<Uuid>,
    pub nonce: Option<i64>,
    pub chain_tx_hash: Option<String>,
    pub raw_signed: Option<Vec<u8>>,
    pub payload: serde_json::Value,
    pub gas_reservation_id: Option<Uuid>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub block_height: Option<i64>,
    pub fee_paid: Option<i64>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TransactionEventRow {
    pub id: i64,
    pub transaction_id: Uuid,
    pub state: TransactionState,
    pub at: DateTime<Utc>,
    pub detail: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct TriggerRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub function_id: Uuid,
    pub kind: TriggerKind,
    pub config: serde_json::Value,
    pub enabled: bool,
    pub status: TriggerStatus,
    pub consecutive_failures: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TriggerEventRow {
    pub seq: i64,
    pub id: Uuid,
    pub trigger_id: Uuid,
    pub fired_at: DateTime<Utc>,
    pub execution_id: Option<Uuid>,
    pub status: TriggerEventStatus,
    pub detail: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct OracleSourceRow {
    pub id: Uuid,
    pub owner_id: Option<Uuid>,
    pub name: String,
    pub url: String,
    pub method: String,
    pub headers: serde_json::Value,
    pub json_path: String,
    pub transform: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct OracleRequestRow {
    pub id: Uuid,
    pub source_id: Uuid,
    pub requester_id: Option<Uuid>,
    pub status: OracleRequestStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub callback_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct RandomRequestRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub contract: String,
    pub request_id: String,
    pub num_words: i64,
    pub seed: String,
    pub status: RandomRequestStatus,
    pub transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            ExecutionStatus::Queued,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Error,
            ExecutionStatus::Timeout,
            ExecutionStatus::Cancelled,
        ] {
            let s: &str = status.into();
            assert_eq!(s.parse::<ExecutionStatus>().unwrap(), status);
        }

        assert!("bogus".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn terminality() {
        assert!(!ExecutionStatus::Queued.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert!(TransactionState::Confirmed.is_terminal());
        assert!(!TransactionState::Submitted.is_terminal());
    }

    #[test]
    fn chain_event_kind_string() {
        let s: &str = TriggerKind::ChainEvent.into();
        assert_eq!(s, "chain_event");
        assert_eq!(s.parse::<TriggerKind>().unwrap(), TriggerKind::ChainEvent);
    }
}
