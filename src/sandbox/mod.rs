//! The confidential function runtime. One WebAssembly store per
//! execution, destroyed at terminal status; a worker pool drains a
//! bounded in-memory queue of jobs. Three bounds run concurrently: the
//! wall-clock deadline (engine epoch, bumped by a watchdog task), the
//! fuel budget (CPU) and the store memory limit.
//!
//! Guest ABI: the module exports `memory`, `alloc(len) -> ptr` and
//! `run(params_ptr, params_len) -> packed_ptr_len`, and may import
//! `env.host_call(cap_ptr, cap_len, req_ptr, req_len) -> packed_ptr_len`.
//! Packed values carry `ptr` in the upper and `len` in the lower 32 bits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use wasmtime::{
    Caller, Config, Engine, Extern, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap,
};

use crate::config::SandboxConfig;
use crate::database::methods::DbMethods as _;
use crate::database::types::{ExecutionRow, ExecutionStatus, FunctionRow, TriggerEventStatus};
use crate::database::Database;
use crate::error::{ErrorKind, ServiceError, ServiceResult};
use crate::gas_bank::GasBank;
use crate::utils::async_queue::AsyncQueue;

pub mod host;

use host::{ExecutionIdentity, HostCapabilities};

/// How often the watchdog bumps the engine epoch. Deadline accuracy is
/// within one tick.
pub const EPOCH_TICK: Duration = Duration::from_millis(25);

/// Error kinds recorded on failed executions.
pub mod error_kind {
    pub const USER_ERROR: &str = "user_error";
    pub const RESOURCE_EXCEEDED: &str = "resource_exceeded";
    pub const INVALID_MODULE: &str = "invalid_module";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const INTERNAL: &str = "internal";
}

#[derive(Debug, Clone, PartialEq)]
pub enum SandboxResult {
    Success(Value),
    Error { kind: String, message: String },
    Timeout,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub result: SandboxResult,
    pub logs: Vec<String>,
    pub duration_ms: i64,
}

/// Context a trigger fire travels with through the pipeline, so the
/// trigger engine can be told when the execution terminates.
#[derive(Debug, Clone)]
pub struct TriggerFireContext {
    pub trigger_id: Uuid,
    pub trigger_event_id: Uuid,
    pub fired_at: DateTime<Utc>,
}

/// Sent to the trigger engine when a trigger-dispatched execution reaches
/// a terminal state.
#[derive(Debug)]
pub struct ExecutionFinished {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub event_status: TriggerEventStatus,
    pub detail: String,
    pub trigger: TriggerFireContext,
}

#[derive(Clone)]
struct ExecutionJob {
    execution_id: Uuid,
    function_id: Uuid,
    params: Value,
    reservation_id: Option<Uuid>,
    trigger: Option<TriggerFireContext>,
}

/// Compiles and runs modules. Shared by all workers.
pub struct SandboxRuntime {
    engine: Engine,
    caps: Arc<HostCapabilities>,
    config: SandboxConfig,
}

impl SandboxRuntime {
    pub fn new(caps: Arc<HostCapabilities>) -> anyhow::Result<Self> {
        let config = caps.config.clone();

        let mut engine_config = Config::new();
        engine_config.consume_fuel(true);
        engine_config.epoch_interruption(true);

        let engine = Engine::new(&engine_config)?;

        Ok(Self {
            engine,
            caps,
            config,
        })
    }

    #[must_use]
    pub fn engine(&self) -> Engine {
        self.engine.clone()
    }

    /// Compile-checks a module at registration time. Accepts a base64
    /// encoded binary module or WAT text.
    pub fn validate_source(&self, source_code: &str) -> ServiceResult<()> {
        let bytes = decode_source(source_code);

        Module::new(&self.engine, bytes)
            .map(|_| ())
            .map_err(|err| ServiceError::invalid(format!("module does not compile: {err:#}")))
    }

    /// Runs one function invocation to completion on a blocking thread.
    #[instrument(level = "debug", skip_all, fields(execution_id = %identity.execution_id))]
    pub async fn execute(
        &self,
        function: &FunctionRow,
        params: &Value,
        identity: ExecutionIdentity,
    ) -> ExecutionOutcome {
        let engine = self.engine.clone();
        let caps = self.caps.clone();
        let config = self.config.clone();
        let source = function.source_code.clone();
        let timeout_ms = (function.timeout_ms.max(1) as u64).min(config.max_timeout_ms);
        let memory_mb = (function.memory_mb.max(1) as u64).min(config.max_memory_mb);
        let params_bytes = serde_json::to_vec(params).unwrap_or_else(|_| b"null".to_vec());
        let handle = Handle::current();

        let started = Instant::now();

        let outcome = tokio::task::spawn_blocking(move || {
            run_in_sandbox(
                &engine,
                caps,
                &config,
                handle,
                identity,
                &source,
                &params_bytes,
                timeout_ms,
                memory_mb,
            )
        })
        .await;

        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok((result, logs)) => ExecutionOutcome {
                result,
                logs,
                duration_ms,
            },
            Err(join_err) => ExecutionOutcome {
                result: SandboxResult::Error {
                    kind: error_kind::INTERNAL.to_string(),
                    message: format!("sandbox worker crashed: {join_err}"),
                },
                logs: Vec::new(),
                duration_ms,
            },
        }
    }
}

/// Keeps every sandbox deadline moving. Runs until cancelled by the task
/// monitor.
pub async fn run_epoch_ticker(engine: Engine) -> anyhow::Result<()> {
    loop {
        tokio::time::sleep(EPOCH_TICK).await;
        engine.increment_epoch();
    }
}

/// Per-execution store state: capability handles, identity, the log
/// buffer and the memory limiter.
struct HostCtx {
    caps: Arc<HostCapabilities>,
    identity: ExecutionIdentity,
    handle: Handle,
    limits: StoreLimits,
    logs: Vec<String>,
    max_log_lines: usize,
    max_log_line_bytes: usize,
}

impl HostCtx {
    /// Appends a log line; a no-op once the budget is exhausted.
    fn push_log(&mut self, mut line: String) {
        if self.logs.len() >= self.max_log_lines {
            return;
        }

        if line.len() > self.max_log_line_bytes {
            let mut cut = self.max_log_line_bytes;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
        }

        self.logs.push(line);
    }
}

#[allow(clippy::too_many_arguments)]
fn run_in_sandbox(
    engine: &Engine,
    caps: Arc<HostCapabilities>,
    config: &SandboxConfig,
    handle: Handle,
    identity: ExecutionIdentity,
    source: &str,
    params: &[u8],
    timeout_ms: u64,
    memory_mb: u64,
) -> (SandboxResult, Vec<String>) {
    let module = match Module::new(engine, decode_source(source)) {
        Ok(module) => module,
        Err(err) => {
            return (
                SandboxResult::Error {
                    kind: error_kind::INVALID_MODULE.to_string(),
                    message: format!("{err:#}"),
                },
                Vec::new(),
            )
        }
    };

    let limits = StoreLimitsBuilder::new()
        .memory_size((memory_mb * 1024 * 1024) as usize)
        .instances(2)
        .trap_on_grow_failure(true)
        .build();

    let ctx = HostCtx {
        caps,
        identity,
        handle,
        limits,
        logs: Vec::new(),
        max_log_lines: config.max_log_lines,
        max_log_line_bytes: config.max_log_line_bytes,
    };

    let mut store = Store::new(engine, ctx);
    store.limiter(|ctx| &mut ctx.limits);

    if let Err(err) = store.set_fuel(config.fuel_limit) {
        return (
            SandboxResult::Error {
                kind: error_kind::INTERNAL.to_string(),
                message: format!("{err:#}"),
            },
            Vec::new(),
        );
    }

    let deadline_ticks = timeout_ms / EPOCH_TICK.as_millis() as u64 + 1;
    store.set_epoch_deadline(deadline_ticks);

    let mut linker: Linker<HostCtx> = Linker::new(engine);
    if let Err(err) = link_host_call(&mut linker) {
        return internal_failure(store, err);
    }

    let instance = match linker.instantiate(&mut store, &module) {
        Ok(instance) => instance,
        Err(err) => {
            let result = classify_wasm_error(&err);
            let logs = store.into_data().logs;
            return (result, logs);
        }
    };

    let run = match instance.get_typed_func::<(i32, i32), i64>(&mut store, "run") {
        Ok(run) => run,
        Err(err) => {
            let result = SandboxResult::Error {
                kind: error_kind::INVALID_MODULE.to_string(),
                message: format!("missing `run` export: {err:#}"),
            };
            let logs = store.into_data().logs;
            return (result, logs);
        }
    };

    let params_ptr = match copy_into_guest(&mut store, &instance, params) {
        Ok(ptr) => ptr,
        Err(err) => {
            let result = classify_wasm_error(&err);
            let logs = store.into_data().logs;
            return (result, logs);
        }
    };

    let outcome = run.call(&mut store, (params_ptr, params.len() as i32));

    let result = match outcome {
        Ok(packed) => read_result(&mut store, &instance, packed, config.max_result_bytes),
        Err(err) => classify_wasm_error(&err),
    };

    let logs = store.into_data().logs;
    (result, logs)
}

fn internal_failure(store: Store<HostCtx>, err: anyhow::Error) -> (SandboxResult, Vec<String>) {
    let logs = store.into_data().logs;
    (
        SandboxResult::Error {
            kind: error_kind::INTERNAL.to_string(),
            message: format!("{err:#}"),
        },
        logs,
    )
}

fn link_host_call(linker: &mut Linker<HostCtx>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "host_call",
        |mut caller: Caller<'_, HostCtx>,
         cap_ptr: i32,
         cap_len: i32,
         req_ptr: i32,
         req_len: i32|
         -> anyhow::Result<i64> {
            let memory = caller
                .get_export("memory")
                .and_then(Extern::into_memory)
                .context("module has no exported memory")?;

            if cap_len < 0 || cap_len > 128 || req_len < 0 || req_len > 1024 * 1024 {
                anyhow::bail!("host_call argument lengths out of range");
            }

            let cap = {
                let mut buf = vec![0u8; cap_len as usize];
                memory.read(&caller, cap_ptr as usize, &mut buf)?;
                String::from_utf8(buf).context("capability name is not UTF-8")?
            };

            let request: Value = {
                let mut buf = vec![0u8; req_len as usize];
                memory.read(&caller, req_ptr as usize, &mut buf)?;
                serde_json::from_slice(&buf).unwrap_or(Value::Null)
            };

            let response = if cap == "log" {
                let message = request
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                caller.data_mut().push_log(message);
                serde_json::json!({ "ok": true, "value": Value::Null })
            } else {
                let (caps, identity, handle) = {
                    let data = caller.data();
                    (data.caps.clone(), data.identity.clone(), data.handle.clone())
                };
                host::dispatch(&caps, &identity, &handle, &cap, &request)
            };

            let bytes = serde_json::to_vec(&response)?;
            write_packed(&mut caller, &memory, &bytes)
        },
    )?;

    Ok(())
}

/// Allocates guest memory through the module's own `alloc` export and
/// copies the bytes in. Returns the packed ptr/len.
fn write_packed(
    caller: &mut Caller<'_, HostCtx>,
    memory: &wasmtime::Memory,
    bytes: &[u8],
) -> anyhow::Result<i64> {
    let alloc = caller
        .get_export("alloc")
        .and_then(Extern::into_func)
        .context("module has no `alloc` export")?
        .typed::<i32, i32>(&mut *caller)?;

    let ptr = alloc.call(&mut *caller, bytes.len() as i32)?;
    memory.write(&mut *caller, ptr as usize, bytes)?;

    Ok(pack(ptr, bytes.len() as i32))
}

fn copy_into_guest(
    store: &mut Store<HostCtx>,
    instance: &wasmtime::Instance,
    bytes: &[u8],
) -> anyhow::Result<i32> {
    let alloc = instance.get_typed_func::<i32, i32>(&mut *store, "alloc")?;
    let memory = instance
        .get_memory(&mut *store, "memory")
        .context("module has no exported memory")?;

    let ptr = alloc.call(&mut *store, bytes.len() as i32)?;
    memory.write(&mut *store, ptr as usize, bytes)?;

    Ok(ptr)
}

fn read_result(
    store: &mut Store<HostCtx>,
    instance: &wasmtime::Instance,
    packed: i64,
    max_result_bytes: usize,
) -> SandboxResult {
    if packed == 0 {
        return SandboxResult::Success(Value::Null);
    }

    let (ptr, len) = unpack(packed);
    if len as usize > max_result_bytes {
        return SandboxResult::Error {
            kind: error_kind::RESOURCE_EXCEEDED.to_string(),
            message: format!("result exceeds {max_result_bytes} bytes"),
        };
    }

    let Some(memory) = instance.get_memory(&mut *store, "memory") else {
        return SandboxResult::Error {
            kind: error_kind::INVALID_MODULE.to_string(),
            message: "module has no exported memory".to_string(),
        };
    };

    let mut buf = vec![0u8; len as usize];
    if let Err(err) = memory.read(&*store, ptr as usize, &mut buf) {
        return SandboxResult::Error {
            kind: error_kind::USER_ERROR.to_string(),
            message: format!("result pointer out of bounds: {err}"),
        };
    }

    match serde_json::from_slice(&buf) {
        Ok(value) => SandboxResult::Success(value),
        Err(err) => SandboxResult::Error {
            kind: error_kind::USER_ERROR.to_string(),
            message: format!("result is not valid JSON: {err}"),
        },
    }
}

const fn pack(ptr: i32, len: i32) -> i64 {
    (((ptr as u32) as u64) << 32 | (len as u32) as u64) as i64
}

const fn unpack(packed: i64) -> (u32, u32) {
    ((packed as u64 >> 32) as u32, (packed as u64 & 0xffff_ffff) as u32)
}

/// Maps a wasm failure to the execution outcome: fuel exhaustion and
/// memory-limit traps are resource errors, an epoch interrupt is the
/// deadline, everything else is the user program's own fault.
fn classify_wasm_error(err: &anyhow::Error) -> SandboxResult {
    if let Some(trap) = err.downcast_ref::<Trap>() {
        return match trap {
            Trap::OutOfFuel => SandboxResult::Error {
                kind: error_kind::RESOURCE_EXCEEDED.to_string(),
                message: "cpu budget exhausted".to_string(),
            },
            Trap::Interrupt => SandboxResult::Timeout,
            other => SandboxResult::Error {
                kind: error_kind::USER_ERROR.to_string(),
                message: format!("trap: {other}"),
            },
        };
    }

    let message = format!("{err:#}");
    if message.contains("memory")
        && (message.contains("grow") || message.contains("limit") || message.contains("exceed"))
    {
        return SandboxResult::Error {
            kind: error_kind::RESOURCE_EXCEEDED.to_string(),
            message: "memory limit exceeded".to_string(),
        };
    }

    SandboxResult::Error {
        kind: error_kind::USER_ERROR.to_string(),
        message,
    }
}

fn decode_source(source: &str) -> Vec<u8> {
    use base64::Engine as _;

    base64::engine::general_purpose::STANDARD
        .decode(source.trim())
        .unwrap_or_else(|_| source.as_bytes().to_vec())
}

/// The canonical parameter hash: SHA-256 over the serialised JSON with
/// object keys sorted, so equal values hash equally regardless of how the
/// caller ordered them.
#[must_use]
pub fn params_hash(params: &Value) -> String {
    let bytes = serde_json::to_vec(&canonicalize(params)).unwrap_or_default();
    hex::encode(Sha256::digest(bytes))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            let mut sorted = serde_json::Map::with_capacity(entries.len());
            for (key, value) in entries {
                sorted.insert(key.clone(), canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------
// Execution pipeline
// ---------------------------------------------------------------------

/// Owns the execution queue: reserves gas, creates the execution row,
/// dispatches to the worker pool and settles everything at terminal
/// state.
pub struct ExecutionPipeline {
    database: Arc<Database>,
    gas_bank: Arc<GasBank>,
    runtime: SandboxRuntime,
    queue: AsyncQueue<ExecutionJob>,
    completions: mpsc::UnboundedSender<ExecutionFinished>,
    config: SandboxConfig,
}

impl ExecutionPipeline {
    pub fn new(
        database: Arc<Database>,
        gas_bank: Arc<GasBank>,
        runtime: SandboxRuntime,
        completions: mpsc::UnboundedSender<ExecutionFinished>,
    ) -> Self {
        let config = runtime.config.clone();
        let queue = AsyncQueue::new(config.queue_depth);

        Self {
            database,
            gas_bank,
            runtime,
            queue,
            completions,
            config,
        }
    }

    #[must_use]
    pub fn runtime(&self) -> &SandboxRuntime {
        &self.runtime
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    /// Reserves gas and enqueues an execution of `function`. No execution
    /// row is created when the reservation fails.
    #[instrument(level = "debug", skip(self, function, params), fields(function_id = %function.id))]
    pub async fn submit(
        &self,
        function: &FunctionRow,
        params: Value,
        trigger: Option<TriggerFireContext>,
    ) -> ServiceResult<ExecutionRow> {
        let params_bytes = serde_json::to_vec(&params)
            .map_err(|_| ServiceError::invalid("params are not serialisable"))?;
        if params_bytes.len() > self.config.max_params_bytes {
            return Err(ServiceError::invalid(format!(
                "params exceed {} bytes",
                self.config.max_params_bytes
            )));
        }

        let execution_id = Uuid::new_v4();

        let account = self
            .gas_bank
            .primary_account(function.owner_id)
            .await?
            .ok_or_else(|| {
                ServiceError::insufficient_funds("no gas account for this user")
            })?;

        let reservation = self
            .gas_bank
            .reserve(
                function.owner_id,
                &account.address,
                self.gas_bank.config().execution_reserve,
                &format!("execution:{execution_id}"),
            )
            .await?;

        let row = self
            .database
            .pool
            .insert_execution(
                execution_id,
                function.id,
                trigger.as_ref().map(|t| t.trigger_event_id),
                &params_hash(&params),
                Some(reservation.id),
            )
            .await?;

        let job = ExecutionJob {
            execution_id,
            function_id: function.id,
            params,
            reservation_id: Some(reservation.id),
            trigger,
        };

        if self.queue.try_push(job).await.is_err() {
            let _ = self.gas_bank.refund(reservation.id).await;
            self.database
                .pool
                .finish_execution(
                    execution_id,
                    ExecutionStatus::Error,
                    0,
                    None,
                    Some(error_kind::RATE_LIMITED),
                    Some("execution queue is full"),
                    &[],
                )
                .await?;

            return Err(ServiceError::new(
                ErrorKind::RateLimited,
                "execution queue is full",
            ));
        }

        Ok(row)
    }

    /// Cancels an execution that has not started. Running executions are
    /// bounded by their own deadline.
    pub async fn cancel(&self, execution_id: Uuid) -> ServiceResult<ExecutionRow> {
        let row = self
            .database
            .pool
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("execution does not exist"))?;

        if row.status != ExecutionStatus::Queued {
            return Err(ServiceError::conflict(format!(
                "cannot cancel a {} execution",
                row.status
            )));
        }

        let cancelled = self
            .database
            .pool
            .finish_execution(
                execution_id,
                ExecutionStatus::Cancelled,
                0,
                None,
                None,
                Some("cancelled by caller"),
                &[],
            )
            .await?;

        if cancelled {
            if let Some(reservation_id) = row.gas_reservation_id {
                let _ = self.gas_bank.refund(reservation_id).await;
            }
        }

        self.database
            .pool
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ServiceError::internal("execution row disappeared"))
    }

    /// One worker: pops jobs and runs them to their terminal state. The
    /// task monitor spawns several of these.
    pub async fn run_worker(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            let guard = self.queue.pop().await;
            let job = guard.read().await;
            guard.commit().await;

            if let Err(err) = self.process(job).await {
                warn!(?err, "Execution worker error");
            }
        }
    }

    async fn process(&self, job: ExecutionJob) -> anyhow::Result<()> {
        let Some(function) = self.database.pool.get_function(job.function_id).await? else {
            self.finish(
                &job,
                ExecutionStatus::Error,
                0,
                None,
                Some(error_kind::INTERNAL),
                Some("function was deleted while queued"),
                Vec::new(),
            )
            .await?;
            return Ok(());
        };

        if !self
            .database
            .pool
            .mark_execution_running(job.execution_id)
            .await?
        {
            // Cancelled while queued; release the hold and report the
            // recorded terminal state.
            if let Some(reservation_id) = job.reservation_id {
                let _ = self.gas_bank.refund(reservation_id).await;
            }
            self.notify(&job, ExecutionStatus::Cancelled, "cancelled before start");
            return Ok(());
        }

        let identity = ExecutionIdentity {
            execution_id: job.execution_id,
            owner_id: function.owner_id,
            declared_secrets: function.secret_names.clone(),
        };

        let outcome = self.runtime.execute(&function, &job.params, identity).await;

        let (status, result_json, err_kind, err_message) = match outcome.result {
            SandboxResult::Success(value) => (ExecutionStatus::Success, Some(value), None, None),
            SandboxResult::Timeout => (ExecutionStatus::Timeout, None, None, None),
            SandboxResult::Error { kind, message } => {
                (ExecutionStatus::Error, None, Some(kind), Some(message))
            }
        };

        // Settle the gas hold: a successful run is charged for its
        // duration, everything else is released.
        if let Some(reservation_id) = job.reservation_id {
            let settlement = if status == ExecutionStatus::Success {
                let fee = self.gas_bank.execution_fee(outcome.duration_ms);
                self.gas_bank.commit(reservation_id, fee).await.map(|_| ())
            } else {
                self.gas_bank.refund(reservation_id).await.map(|_| ())
            };

            if let Err(err) = settlement {
                if err.kind != ErrorKind::Conflict {
                    warn!(execution = %job.execution_id, ?err, "Failed to settle execution gas");
                }
            }
        }

        self.finish(
            &job,
            status,
            outcome.duration_ms,
            result_json.as_ref(),
            err_kind.as_deref(),
            err_message.as_deref(),
            outcome.logs,
        )
        .await?;

        info!(
            execution = %job.execution_id,
            function = %function.id,
            %status,
            duration_ms = outcome.duration_ms,
            "Execution finished"
        );

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        job: &ExecutionJob,
        status: ExecutionStatus,
        duration_ms: i64,
        result_json: Option<&Value>,
        err_kind: Option<&str>,
        err_message: Option<&str>,
        logs: Vec<String>,
    ) -> anyhow::Result<()> {
        self.database
            .pool
            .finish_execution(
                job.execution_id,
                status,
                duration_ms,
                result_json,
                err_kind,
                err_message,
                &logs,
            )
            .await?;

        let detail = err_message.unwrap_or_default().to_string();
        self.notify(job, status, &detail);

        Ok(())
    }

    fn notify(&self, job: &ExecutionJob, status: ExecutionStatus, detail: &str) {
        let Some(trigger) = job.trigger.clone() else {
            return;
        };

        let event_status = match status {
            ExecutionStatus::Success => TriggerEventStatus::Success,
            ExecutionStatus::Timeout => TriggerEventStatus::Timeout,
            _ => TriggerEventStatus::Failure,
        };

        let _ = self.completions.send(ExecutionFinished {
            execution_id: job.execution_id,
            status,
            event_status,
            detail: detail.to_string(),
            trigger,
        });
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn packing_round_trips() {
        let packed = pack(0x1234, 0x56);
        assert_eq!(unpack(packed), (0x1234, 0x56));

        let packed = pack(i32::MAX, i32::MAX);
        assert_eq!(unpack(packed), (i32::MAX as u32, i32::MAX as u32));
    }

    #[test]
    fn params_hash_is_stable_across_key_order() {
        let a = json!({ "b": 1, "a": [1, 2, 3] });
        let b = json!({ "a": [1, 2, 3], "b": 1 });

        assert_eq!(params_hash(&a), params_hash(&b));
        assert_ne!(params_hash(&a), params_hash(&json!({ "a": [1, 2, 3] })));
    }

    #[test]
    fn wat_sources_pass_through_decoding() {
        let wat = "(module)";
        assert_eq!(decode_source(wat), wat.as_bytes());

        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"\0asm");
        assert_eq!(decode_source(&encoded), b"\0asm");
    }
}
