//! The trigger engine. Owns the in-memory index of enabled triggers,
//! validates kind-specific configs, and funnels every fire through one
//! dispatch path: gas pre-flight, single-flight gating, execution
//! submission and the exactly-one trigger event per fire.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::TriggersConfig;
use crate::database::methods::DbMethods as _;
use crate::database::types::{
    TriggerEventRow, TriggerEventStatus, TriggerKind, TriggerRow, TriggerStatus,
};
use crate::database::{clamp_limit, Database, IsolationLevel};
use crate::error::{ErrorKind, ServiceError, ServiceResult};
use crate::sandbox::{ExecutionFinished, ExecutionPipeline, TriggerFireContext};

pub mod chain_events;
pub mod cron;
pub mod price;

use price::PriceConditionTracker;

// ---------------------------------------------------------------------
// Kind-specific configs
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronTriggerConfig {
    pub schedule: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub params: Value,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceCondition {
    Above,
    Below,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTriggerConfig {
    pub asset_pair: String,
    pub condition: PriceCondition,
    pub threshold: f64,
    pub duration_s: u64,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEventTriggerConfig {
    pub contract_address: String,
    pub event_name: String,
    #[serde(default)]
    pub parameter_filters: Option<Value>,
    #[serde(default)]
    pub start_block: Option<u64>,
    #[serde(default)]
    pub end_block: Option<u64>,
    #[serde(default)]
    pub params: Value,
}

/// Parsed, validated per-kind state kept in the in-memory index.
pub(crate) enum KindState {
    Cron {
        schedule: Box<cron::ParsedSchedule>,
        params: Value,
        next_fire: Option<DateTime<Utc>>,
    },
    Price {
        config: PriceTriggerConfig,
        tracker: PriceConditionTracker,
    },
    ChainEvent {
        config: ChainEventTriggerConfig,
        next_block: Option<u64>,
    },
    Manual,
    Webhook,
}

pub(crate) struct ActiveTrigger {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub function_id: Uuid,
    pub kind: TriggerKind,
    pub status: TriggerStatus,
    pub consecutive_failures: i64,
    pub state: KindState,
    /// Executions dispatched and not yet terminal. Single-flight keeps
    /// this at most 1.
    pub inflight: usize,
    /// Fires waiting behind the running execution.
    pub pending: VecDeque<PendingFire>,
}

/// A fire accepted while an execution was still running. It keeps its
/// original event id and fire instant for when it is dispatched.
pub(crate) struct PendingFire {
    params: Value,
    event_id: Uuid,
    fired_at: DateTime<Utc>,
}

/// Why a fire happened; lands in the trigger event detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireCause {
    Schedule,
    PriceCondition,
    ChainEvent,
    Manual,
    Webhook,
}

impl FireCause {
    fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::PriceCondition => "price condition",
            Self::ChainEvent => "chain event",
            Self::Manual => "manual",
            Self::Webhook => "webhook",
        }
    }
}

pub struct TriggerEngine {
    database: Arc<Database>,
    pipeline: Arc<ExecutionPipeline>,
    config: TriggersConfig,
    pub(crate) index: Mutex<HashMap<Uuid, ActiveTrigger>>,
    /// Wakes the cron scheduler when the trigger set changes.
    pub(crate) cron_wake: Notify,
    completions: Mutex<Option<mpsc::UnboundedReceiver<ExecutionFinished>>>,
}

impl TriggerEngine {
    pub fn new(
        database: Arc<Database>,
        pipeline: Arc<ExecutionPipeline>,
        config: TriggersConfig,
        completions: mpsc::UnboundedReceiver<ExecutionFinished>,
    ) -> Self {
        Self {
            database,
            pipeline,
            config,
            index: Mutex::new(HashMap::new()),
            cron_wake: Notify::new(),
            completions: Mutex::new(Some(completions)),
        }
    }

    #[must_use]
    pub fn config(&self) -> &TriggersConfig {
        &self.config
    }

    /// Loads every enabled trigger into the index. Called once at startup.
    #[instrument(level = "info", skip_all)]
    pub async fn load(&self) -> anyhow::Result<()> {
        let rows = self.database.pool.list_enabled_triggers().await?;
        let mut index = self.index.lock().await;

        for row in rows {
            match self.active_from_row(&row) {
                Ok(active) => {
                    index.insert(row.id, active);
                }
                Err(err) => {
                    warn!(trigger = %row.id, ?err, "Skipping trigger with invalid config");
                }
            }
        }

        info!(count = index.len(), "Trigger index loaded");
        self.cron_wake.notify_one();

        Ok(())
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    #[instrument(level = "debug", skip(self, config_json))]
    pub async fn create(
        &self,
        owner_id: Uuid,
        function_id: Uuid,
        kind: TriggerKind,
        config_json: Value,
        enabled: bool,
    ) -> ServiceResult<TriggerRow> {
        self.validate_config(kind, &config_json)?;

        let function = self
            .database
            .pool
            .get_function(function_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("function does not exist"))?;

        if function.owner_id != owner_id {
            return Err(ServiceError::not_found("function does not exist"));
        }

        let row = self
            .database
            .pool
            .insert_trigger(
                Uuid::new_v4(),
                owner_id,
                function_id,
                kind,
                &config_json,
                enabled,
            )
            .await?;

        if enabled {
            let active = self.active_from_row(&row)?;
            self.index.lock().await.insert(row.id, active);
            self.cron_wake.notify_one();
        }

        Ok(row)
    }

    #[instrument(level = "debug", skip(self, config_json))]
    pub async fn update(
        &self,
        owner_id: Uuid,
        id: Uuid,
        config_json: Value,
        enabled: bool,
    ) -> ServiceResult<TriggerRow> {
        let existing = self.get_owned(owner_id, id).await?;

        self.validate_config(existing.kind, &config_json)?;

        let row = self
            .database
            .pool
            .update_trigger(id, &config_json, enabled)
            .await?
            .ok_or_else(|| ServiceError::not_found("trigger does not exist"))?;

        let mut index = self.index.lock().await;
        index.remove(&id);
        if enabled {
            let active = self.active_from_row(&row)?;
            index.insert(id, active);
        }
        drop(index);
        self.cron_wake.notify_one();

        Ok(row)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn delete(&self, owner_id: Uuid, id: Uuid) -> ServiceResult<()> {
        self.get_owned(owner_id, id).await?;

        let mut tx = self.database.begin_tx(IsolationLevel::ReadCommitted).await?;

        sqlx::query("DELETE FROM trigger_events WHERE trigger_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(crate::database::Error::from)?;

        (&mut tx).delete_trigger(id).await?;

        tx.commit().await.map_err(crate::database::Error::from)?;

        self.index.lock().await.remove(&id);
        self.cron_wake.notify_one();

        Ok(())
    }

    pub async fn get(&self, owner_id: Uuid, id: Uuid) -> ServiceResult<TriggerRow> {
        self.get_owned(owner_id, id).await
    }

    pub async fn list(
        &self,
        owner_id: Uuid,
        offset: i64,
        limit: Option<i64>,
    ) -> ServiceResult<Vec<TriggerRow>> {
        Ok(self
            .database
            .pool
            .list_triggers(owner_id, offset.max(0), clamp_limit(limit))
            .await?)
    }

    pub async fn history(
        &self,
        owner_id: Uuid,
        id: Uuid,
        offset: i64,
        limit: Option<i64>,
    ) -> ServiceResult<Vec<TriggerEventRow>> {
        self.get_owned(owner_id, id).await?;

        Ok(self
            .database
            .pool
            .list_trigger_events(id, offset.max(0), clamp_limit(limit))
            .await?)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn pause(&self, owner_id: Uuid, id: Uuid) -> ServiceResult<TriggerRow> {
        let row = self.get_owned(owner_id, id).await?;

        if row.status == TriggerStatus::Paused {
            return Err(ServiceError::conflict("trigger is already paused"));
        }

        self.database
            .pool
            .set_trigger_status(id, TriggerStatus::Paused, row.consecutive_failures)
            .await?;

        if let Some(active) = self.index.lock().await.get_mut(&id) {
            active.status = TriggerStatus::Paused;
        }

        self.get_owned(owner_id, id).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn resume(&self, owner_id: Uuid, id: Uuid) -> ServiceResult<TriggerRow> {
        let row = self.get_owned(owner_id, id).await?;

        if row.status == TriggerStatus::Active {
            return Err(ServiceError::conflict("trigger is already active"));
        }

        // Resuming clears the failure streak that may have parked it.
        self.database
            .pool
            .set_trigger_status(id, TriggerStatus::Active, 0)
            .await?;

        if let Some(active) = self.index.lock().await.get_mut(&id) {
            active.status = TriggerStatus::Active;
            active.consecutive_failures = 0;
        }
        self.cron_wake.notify_one();

        self.get_owned(owner_id, id).await
    }

    /// Explicit fire through the API. Works for every kind; paused and
    /// errored triggers refuse.
    #[instrument(level = "debug", skip(self, params))]
    pub async fn execute_manual(
        &self,
        owner_id: Uuid,
        id: Uuid,
        params: Option<Value>,
    ) -> ServiceResult<Uuid> {
        let row = self.get_owned(owner_id, id).await?;

        if row.status != TriggerStatus::Active {
            return Err(ServiceError::conflict(format!(
                "trigger is {}",
                row.status
            )));
        }

        let params = params.unwrap_or_else(|| configured_params(&row.config));

        self.fire(id, params, FireCause::Manual).await
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Fires a trigger: exactly one trigger event will exist for this
    /// call, written immediately for skips and pre-flight failures, or at
    /// the execution's terminal state otherwise. Returns the event id.
    #[instrument(level = "debug", skip(self, params))]
    pub(crate) async fn fire(
        &self,
        trigger_id: Uuid,
        params: Value,
        cause: FireCause,
    ) -> ServiceResult<Uuid> {
        let fired_at = Utc::now();
        let event_id = Uuid::new_v4();

        // Single-flight gate.
        {
            let mut index = self.index.lock().await;
            let active = index
                .get_mut(&trigger_id)
                .ok_or_else(|| ServiceError::not_found("trigger is not active"))?;

            if active.status != TriggerStatus::Active {
                self.write_event(
                    trigger_id,
                    event_id,
                    fired_at,
                    None,
                    TriggerEventStatus::Skipped,
                    &format!("trigger is {}", active.status),
                )
                .await?;
                return Ok(event_id);
            }

            if active.inflight > 0 {
                if active.pending.len() < self.config.pending_queue_depth {
                    // Deferred, not skipped: the fire keeps its identity
                    // and runs once the current execution terminates.
                    active.pending.push_back(PendingFire {
                        params,
                        event_id,
                        fired_at,
                    });
                } else {
                    self.write_event(
                        trigger_id,
                        event_id,
                        fired_at,
                        None,
                        TriggerEventStatus::Skipped,
                        "previous execution still running",
                    )
                    .await?;
                }
                return Ok(event_id);
            }

            active.inflight += 1;
        }

        self.launch(trigger_id, event_id, fired_at, params, cause)
            .await?;

        Ok(event_id)
    }

    /// Runs an accepted fire whose single-flight slot is already taken.
    async fn launch(
        &self,
        trigger_id: Uuid,
        event_id: Uuid,
        fired_at: DateTime<Utc>,
        params: Value,
        cause: FireCause,
    ) -> ServiceResult<()> {
        match self.dispatch(trigger_id, event_id, fired_at, params, cause).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // Pre-flight failed: the fire is over, record it.
                self.write_event(
                    trigger_id,
                    event_id,
                    fired_at,
                    None,
                    TriggerEventStatus::Failure,
                    &format!("{}: {}", err.kind, err.message),
                )
                .await?;

                self.note_fire_result(trigger_id, fired_at, TriggerEventStatus::Failure)
                    .await?;

                {
                    let mut index = self.index.lock().await;
                    if let Some(active) = index.get_mut(&trigger_id) {
                        active.inflight = active.inflight.saturating_sub(1);
                    }
                }

                Err(err)
            }
        }
    }

    async fn dispatch(
        &self,
        trigger_id: Uuid,
        event_id: Uuid,
        fired_at: DateTime<Utc>,
        params: Value,
        cause: FireCause,
    ) -> ServiceResult<()> {
        let (function_id, owner_id) = {
            let index = self.index.lock().await;
            let active = index
                .get(&trigger_id)
                .ok_or_else(|| ServiceError::not_found("trigger is not active"))?;
            (active.function_id, active.owner_id)
        };

        let function = self
            .database
            .pool
            .get_function(function_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("function was deleted"))?;

        if function.owner_id != owner_id {
            return Err(ServiceError::internal("trigger/function owner mismatch"));
        }

        let context = TriggerFireContext {
            trigger_id,
            trigger_event_id: event_id,
            fired_at,
        };

        info!(trigger = %trigger_id, cause = cause.as_str(), "Trigger fired");

        self.pipeline
            .submit(&function, params, Some(context))
            .await?;

        Ok(())
    }

    /// Consumes execution completions: writes the deferred trigger event,
    /// updates failure bookkeeping and releases the single-flight slot,
    /// dispatching the next queued fire if any.
    pub async fn run_completion_handler(self: Arc<Self>) -> anyhow::Result<()> {
        let Some(mut receiver) = self.completions.lock().await.take() else {
            warn!("Completion handler already running");
            return Ok(());
        };

        while let Some(finished) = receiver.recv().await {
            if let Err(err) = self.handle_completion(&finished).await {
                warn!(?err, execution = %finished.execution_id, "Completion handling failed");
            }
        }

        Ok(())
    }

    async fn handle_completion(&self, finished: &ExecutionFinished) -> ServiceResult<()> {
        let context = &finished.trigger;

        self.write_event(
            context.trigger_id,
            context.trigger_event_id,
            context.fired_at,
            Some(finished.execution_id),
            finished.event_status,
            &finished.detail,
        )
        .await?;

        self.note_fire_result(context.trigger_id, context.fired_at, finished.event_status)
            .await?;

        // Release the slot and run the next queued fire, which takes the
        // slot over directly.
        let next = {
            let mut index = self.index.lock().await;
            match index.get_mut(&context.trigger_id) {
                Some(active) => {
                    active.inflight = active.inflight.saturating_sub(1);
                    if active.status == TriggerStatus::Active {
                        let next = active.pending.pop_front();
                        if next.is_some() {
                            active.inflight += 1;
                        }
                        next
                    } else {
                        active.pending.clear();
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(pending) = next {
            let _ = self
                .launch(
                    context.trigger_id,
                    pending.event_id,
                    pending.fired_at,
                    pending.params,
                    FireCause::Schedule,
                )
                .await;
        }

        Ok(())
    }

    /// Persists last-fire bookkeeping and parks the trigger after too
    /// many consecutive failures.
    async fn note_fire_result(
        &self,
        trigger_id: Uuid,
        fired_at: DateTime<Utc>,
        status: TriggerEventStatus,
    ) -> ServiceResult<()> {
        let mut index = self.index.lock().await;
        let Some(active) = index.get_mut(&trigger_id) else {
            return Ok(());
        };

        match status {
            TriggerEventStatus::Success => active.consecutive_failures = 0,
            TriggerEventStatus::Failure | TriggerEventStatus::Timeout => {
                active.consecutive_failures += 1;
            }
            TriggerEventStatus::Skipped => {}
        }

        if active.consecutive_failures >= i64::from(self.config.failure_threshold)
            && active.status == TriggerStatus::Active
        {
            warn!(
                trigger = %trigger_id,
                failures = active.consecutive_failures,
                "Failure threshold reached, parking trigger"
            );
            active.status = TriggerStatus::Error;
        }

        let status_now = active.status;
        let failures = active.consecutive_failures;
        drop(index);

        self.database
            .pool
            .record_trigger_fire(trigger_id, fired_at, status, failures, status_now)
            .await?;

        Ok(())
    }

    /// Records a deliberately suppressed fire.
    pub(crate) async fn record_skip(&self, trigger_id: Uuid, detail: &str) -> ServiceResult<Uuid> {
        let event_id = Uuid::new_v4();
        self.write_event(
            trigger_id,
            event_id,
            Utc::now(),
            None,
            TriggerEventStatus::Skipped,
            detail,
        )
        .await?;

        Ok(event_id)
    }

    async fn write_event(
        &self,
        trigger_id: Uuid,
        event_id: Uuid,
        fired_at: DateTime<Utc>,
        execution_id: Option<Uuid>,
        status: TriggerEventStatus,
        detail: &str,
    ) -> ServiceResult<()> {
        self.database
            .pool
            .insert_trigger_event(event_id, trigger_id, fired_at, execution_id, status, detail)
            .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Validation and index construction
    // ------------------------------------------------------------------

    fn validate_config(&self, kind: TriggerKind, config_json: &Value) -> ServiceResult<()> {
        match kind {
            TriggerKind::Cron => {
                let config: CronTriggerConfig = parse_config(config_json)?;
                let schedule = cron::ParsedSchedule::parse(&config.schedule, &config.timezone)?;
                schedule.enforce_min_interval(self.config.min_cron_interval)?;
            }
            TriggerKind::Price => {
                let config: PriceTriggerConfig = parse_config(config_json)?;
                if config.asset_pair.is_empty() {
                    return Err(ServiceError::invalid("asset_pair must not be empty"));
                }
                if config.duration_s == 0 {
                    return Err(ServiceError::invalid("duration_s must be positive"));
                }
                if !config.threshold.is_finite() {
                    return Err(ServiceError::invalid("threshold must be finite"));
                }
            }
            TriggerKind::ChainEvent => {
                let config: ChainEventTriggerConfig = parse_config(config_json)?;
                if config.contract_address.is_empty() || config.event_name.is_empty() {
                    return Err(ServiceError::invalid(
                        "contract_address and event_name are required",
                    ));
                }
                if let (Some(start), Some(end)) = (config.start_block, config.end_block) {
                    if end < start {
                        return Err(ServiceError::invalid("end_block is before start_block"));
                    }
                }
            }
            TriggerKind::Manual | TriggerKind::Webhook => {}
        }

        Ok(())
    }

    fn active_from_row(&self, row: &TriggerRow) -> ServiceResult<ActiveTrigger> {
        let state = match row.kind {
            TriggerKind::Cron => {
                let config: CronTriggerConfig = parse_config(&row.config)?;
                let schedule = cron::ParsedSchedule::parse(&config.schedule, &config.timezone)?;
                KindState::Cron {
                    schedule: Box::new(schedule),
                    params: config.params,
                    next_fire: None,
                }
            }
            TriggerKind::Price => {
                let config: PriceTriggerConfig = parse_config(&row.config)?;
                let tracker = PriceConditionTracker::new(
                    config.condition,
                    config.threshold,
                    chrono::Duration::seconds(config.duration_s as i64),
                    chrono::Duration::from_std(self.config.price_debounce)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                );
                KindState::Price { config, tracker }
            }
            TriggerKind::ChainEvent => {
                let config: ChainEventTriggerConfig = parse_config(&row.config)?;
                let next_block = config.start_block;
                KindState::ChainEvent { config, next_block }
            }
            TriggerKind::Manual => KindState::Manual,
            TriggerKind::Webhook => KindState::Webhook,
        };

        Ok(ActiveTrigger {
            id: row.id,
            owner_id: row.owner_id,
            function_id: row.function_id,
            kind: row.kind,
            status: row.status,
            consecutive_failures: row.consecutive_failures,
            state,
            inflight: 0,
            pending: VecDeque::new(),
        })
    }

    async fn get_owned(&self, owner_id: Uuid, id: Uuid) -> ServiceResult<TriggerRow> {
        let row = self
            .database
            .pool
            .get_trigger(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("trigger does not exist"))?;

        if row.owner_id != owner_id {
            return Err(ServiceError::not_found("trigger does not exist"));
        }

        Ok(row)
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(config_json: &Value) -> ServiceResult<T> {
    serde_json::from_value(config_json.clone())
        .map_err(|err| ServiceError::new(ErrorKind::Invalid, format!("invalid trigger config: {err}")))
}

/// The params a trigger fires its function with, taken from the config.
fn configured_params(config_json: &Value) -> Value {
    config_json.get("params").cloned().unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn cron_config_parses_with_default_timezone() {
        let config: CronTriggerConfig =
            parse_config(&json!({ "schedule": "0 */5 * * * *" })).unwrap();

        assert_eq!(config.timezone, "UTC");
        assert_eq!(config.params, Value::Null);
    }

    #[test]
    fn price_config_requires_known_condition() {
        let result: ServiceResult<PriceTriggerConfig> = parse_config(&json!({
            "asset_pair": "NEO/GAS",
            "condition": "sideways",
            "threshold": 10.0,
            "duration_s": 30,
        }));

        assert!(result.is_err());
    }

    #[test]
    fn configured_params_fall_back_to_null() {
        assert_eq!(configured_params(&json!({})), Value::Null);
        assert_eq!(
            configured_params(&json!({ "params": { "x": 1 } })),
            json!({ "x": 1 })
        );
    }
}
