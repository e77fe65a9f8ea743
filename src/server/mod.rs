pub mod custom_middleware;
pub mod data;
pub mod error;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use prometheus::{Encoder, TextEncoder};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::info;
use uuid::Uuid;

use crate::app::App;
use crate::config::ServerConfig;
use crate::error::ServiceError;
use crate::secrets::Actor;
use crate::shutdown::Shutdown;
use crate::utils::gas::parse_gas;

use self::custom_middleware::rate_limit_layer::RateLimiter;
use self::data::{
    ApiResponse, AuthUser, CreateFunctionRequest, CreateSecretRequest, CreateTransactionRequest,
    CreateTriggerRequest, DepositAddressResponse, ExecuteFunctionRequest, ExecutionResponse,
    FireResponse, FunctionResponse, GasBalanceResponse, GasTransactionResponse,
    ManualFireRequest, OracleRequestRequest, OracleRequestResponse, OracleSourceRequest,
    OracleSourceResponse, Page, PageQuery, RotationResponse, SecretAuditResponse, SecretResponse,
    TransactionEventResponse, TransactionFilter, TransactionResponse, TriggerEventResponse,
    TriggerResponse, UpdateFunctionRequest, UpdateSecretRequest, UpdateTriggerRequest,
    WalletResponse, WithdrawRequest,
};
use self::error::Error;

type ApiResult<T> = Result<Json<ApiResponse<T>>, Error>;

fn ok<T: serde::Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::ok(data)))
}

/// The audit actor for a request: the resolved identity plus transport
/// metadata.
fn actor_from(user: &AuthUser, headers: &HeaderMap) -> Actor {
    let mut actor = Actor::user(user.user_id);
    actor.source_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string());
    actor.user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    actor
}

// ---------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------

async fn create_function(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateFunctionRequest>,
) -> ApiResult<FunctionResponse> {
    let row = app
        .create_function(
            user.user_id,
            &req.name,
            &req.source_code,
            req.timeout_ms,
            req.memory_mb,
            req.secret_names,
        )
        .await?;

    ok(row.into())
}

async fn list_functions(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Page<FunctionResponse>> {
    let (rows, total) = app
        .list_functions(user.user_id, page.offset, page.limit)
        .await?;

    ok(Page {
        items: rows.into_iter().map(Into::into).collect(),
        total: page.include_total.then_some(total),
    })
}

async fn get_function(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<FunctionResponse> {
    ok(app.get_function(user.user_id, id).await?.into())
}

async fn update_function(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateFunctionRequest>,
) -> ApiResult<FunctionResponse> {
    let row = app
        .update_function(
            user.user_id,
            id,
            &req.source_code,
            req.timeout_ms,
            req.memory_mb,
            req.secret_names,
        )
        .await?;

    ok(row.into())
}

async fn delete_function(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    app.delete_function(user.user_id, id).await?;
    ok(())
}

async fn execute_function(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<ExecuteFunctionRequest>,
) -> ApiResult<ExecutionResponse> {
    let wait = req.wait_ms.map(|ms| Duration::from_millis(ms.min(30_000)));

    let row = app
        .execute_function(user.user_id, id, req.params, wait)
        .await?;

    ok(row.into())
}

async fn list_executions(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Vec<ExecutionResponse>> {
    let rows = app
        .list_executions(user.user_id, id, page.offset, page.limit)
        .await?;

    ok(rows.into_iter().map(Into::into).collect())
}

async fn get_execution(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path((id, execution_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<ExecutionResponse> {
    ok(app
        .get_execution(user.user_id, id, execution_id)
        .await?
        .into())
}

// ---------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------

async fn create_secret(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    Json(req): Json<CreateSecretRequest>,
) -> ApiResult<SecretResponse> {
    let actor = actor_from(&user, &headers);

    let row = app
        .secrets
        .create(
            user.user_id,
            &req.name,
            &req.value,
            &req.description,
            req.expires_at,
            &actor,
        )
        .await?;

    ok(SecretResponse::metadata(row))
}

async fn list_secrets(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Vec<SecretResponse>> {
    let rows = app
        .secrets
        .list(
            user.user_id,
            page.offset.max(0),
            crate::database::clamp_limit(page.limit),
        )
        .await?;

    ok(rows.into_iter().map(SecretResponse::metadata).collect())
}

/// One of the two plaintext read paths; audited.
async fn get_secret(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<SecretResponse> {
    let actor = actor_from(&user, &headers);

    let row = app.secrets.get_metadata(user.user_id, id).await?;
    let value = app.secrets.reveal(user.user_id, id, &actor).await?;

    ok(SecretResponse::with_value(row, value.to_string()))
}

/// The other plaintext read path; audited.
async fn get_secret_by_name(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<SecretResponse> {
    let actor = actor_from(&user, &headers);

    let (row, value) = app
        .secrets
        .reveal_by_name(user.user_id, &name, &actor)
        .await?;

    ok(SecretResponse::with_value(row, value.to_string()))
}

async fn update_secret(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateSecretRequest>,
) -> ApiResult<SecretResponse> {
    let actor = actor_from(&user, &headers);

    let row = app
        .secrets
        .update(
            user.user_id,
            id,
            &req.value,
            &req.description,
            req.expires_at,
            &actor,
        )
        .await?;

    ok(SecretResponse::metadata(row))
}

async fn delete_secret(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    let actor = actor_from(&user, &headers);
    app.secrets.delete(user.user_id, id, &actor).await?;
    ok(())
}

async fn rotate_secrets(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
) -> ApiResult<RotationResponse> {
    let actor = actor_from(&user, &headers);
    let rotated = app.secrets.rotate_batch(&actor).await?;
    ok(RotationResponse { rotated })
}

async fn secret_audit_log(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Vec<SecretAuditResponse>> {
    let rows = app
        .secrets
        .audit_log(
            user.user_id,
            page.offset.max(0),
            crate::database::clamp_limit(page.limit),
        )
        .await?;

    ok(rows.into_iter().map(Into::into).collect())
}

// ---------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------

async fn create_trigger(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateTriggerRequest>,
) -> ApiResult<TriggerResponse> {
    let row = app
        .triggers
        .create(user.user_id, req.function_id, req.kind, req.config, req.enabled)
        .await?;

    ok(row.into())
}

async fn list_triggers(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Vec<TriggerResponse>> {
    let rows = app
        .triggers
        .list(user.user_id, page.offset, page.limit)
        .await?;

    ok(rows.into_iter().map(Into::into).collect())
}

async fn get_trigger(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<TriggerResponse> {
    ok(app.triggers.get(user.user_id, id).await?.into())
}

async fn update_trigger(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTriggerRequest>,
) -> ApiResult<TriggerResponse> {
    let row = app
        .triggers
        .update(user.user_id, id, req.config, req.enabled)
        .await?;

    ok(row.into())
}

async fn delete_trigger(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    app.triggers.delete(user.user_id, id).await?;
    ok(())
}

async fn fire_trigger(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<ManualFireRequest>,
) -> ApiResult<FireResponse> {
    let trigger_event_id = app
        .triggers
        .execute_manual(user.user_id, id, req.params)
        .await?;

    ok(FireResponse { trigger_event_id })
}

async fn pause_trigger(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<TriggerResponse> {
    ok(app.triggers.pause(user.user_id, id).await?.into())
}

async fn resume_trigger(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<TriggerResponse> {
    ok(app.triggers.resume(user.user_id, id).await?.into())
}

async fn trigger_history(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Vec<TriggerEventResponse>> {
    let rows = app
        .triggers
        .history(user.user_id, id, page.offset, page.limit)
        .await?;

    ok(rows.into_iter().map(Into::into).collect())
}

// ---------------------------------------------------------------------
// Gas bank
// ---------------------------------------------------------------------

async fn gas_balance(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<GasBalanceResponse> {
    let account = app.gas_balance(user.user_id).await?;
    ok(GasBalanceResponse::from_account(account))
}

async fn deposit_address(State(app): State<Arc<App>>) -> ApiResult<DepositAddressResponse> {
    let address = app.deposit_address().await?;
    ok(DepositAddressResponse { address })
}

async fn withdraw(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<WithdrawRequest>,
) -> ApiResult<TransactionResponse> {
    let amount = parse_gas(&req.amount)?;

    let row = app
        .withdraw_gas(user.user_id, amount, &req.target_address)
        .await?;

    ok(row.into())
}

async fn list_gas_transactions(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Vec<GasTransactionResponse>> {
    let rows = app
        .list_gas_transactions(user.user_id, page.offset, page.limit)
        .await?;

    ok(rows.into_iter().map(Into::into).collect())
}

async fn get_gas_transaction(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<GasTransactionResponse> {
    ok(app.get_gas_transaction(user.user_id, id).await?.into())
}

// ---------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------

async fn create_transaction(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateTransactionRequest>,
) -> ApiResult<TransactionResponse> {
    let gas_reservation = app.reserve_network_fee(user.user_id).await?;

    let intent = crate::transactions::TxIntent {
        service: req.service,
        owner: user.user_id,
        entity_ref: req.entity_ref,
        payload: req.payload,
        gas_reservation,
    };

    ok(app.transactions.create(intent).await?.into())
}

async fn list_transactions(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Query(filter): Query<TransactionFilter>,
) -> ApiResult<Vec<TransactionResponse>> {
    let rows = app
        .transactions
        .list(
            Some(user.user_id),
            filter.service.as_deref(),
            filter.state,
            filter.offset,
            filter.limit,
        )
        .await?;

    ok(rows.into_iter().map(Into::into).collect())
}

async fn transaction_owned(
    app: &App,
    user: &AuthUser,
    id: Uuid,
) -> Result<crate::database::types::TransactionRow, Error> {
    let row = app.transactions.get(id).await?;
    if row.owner_id != user.user_id {
        return Err(Error(ServiceError::not_found("transaction does not exist")));
    }
    Ok(row)
}

async fn get_transaction(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<TransactionResponse> {
    ok(transaction_owned(&app, &user, id).await?.into())
}

async fn retry_transaction(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<TransactionResponse> {
    transaction_owned(&app, &user, id).await?;
    ok(app.transactions.retry(id).await?.into())
}

async fn cancel_transaction(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<TransactionResponse> {
    transaction_owned(&app, &user, id).await?;
    ok(app.transactions.cancel(id).await?.into())
}

async fn transaction_events(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<TransactionEventResponse>> {
    transaction_owned(&app, &user, id).await?;

    let rows = app.transactions.events(id).await?;
    ok(rows.into_iter().map(Into::into).collect())
}

async fn list_all_wallets(State(app): State<Arc<App>>) -> ApiResult<Vec<WalletResponse>> {
    let rows = app.transactions.list_wallets(None).await?;
    ok(rows.into_iter().map(Into::into).collect())
}

async fn create_wallet(
    State(app): State<Arc<App>>,
    Path(service): Path<String>,
) -> ApiResult<WalletResponse> {
    ok(app.transactions.create_wallet(&service).await?.into())
}

async fn list_service_wallets(
    State(app): State<Arc<App>>,
    Path(service): Path<String>,
) -> ApiResult<Vec<WalletResponse>> {
    let rows = app.transactions.list_wallets(Some(&service)).await?;
    ok(rows.into_iter().map(Into::into).collect())
}

// ---------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------

async fn create_oracle_source(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<OracleSourceRequest>,
) -> ApiResult<OracleSourceResponse> {
    let row = app
        .oracle
        .create_source(
            Some(user.user_id),
            &req.name,
            &req.url,
            &req.method,
            req.headers,
            &req.json_path,
            &req.transform,
        )
        .await?;

    ok(row.into())
}

async fn list_oracle_sources(
    State(app): State<Arc<App>>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Vec<OracleSourceResponse>> {
    let rows = app
        .oracle
        .list_sources(page.offset.max(0), crate::database::clamp_limit(page.limit))
        .await?;

    ok(rows.into_iter().map(Into::into).collect())
}

async fn get_oracle_source(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<OracleSourceResponse> {
    ok(app.oracle.get_source(id).await?.into())
}

async fn update_oracle_source(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
    Json(req): Json<OracleSourceRequest>,
) -> ApiResult<OracleSourceResponse> {
    let row = app
        .oracle
        .update_source(
            id,
            &req.url,
            &req.method,
            req.headers,
            &req.json_path,
            &req.transform,
            req.active,
        )
        .await?;

    ok(row.into())
}

async fn delete_oracle_source(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    app.oracle.delete_source(id).await?;
    ok(())
}

async fn public_oracle_request(
    State(app): State<Arc<App>>,
    Json(req): Json<OracleRequestRequest>,
) -> ApiResult<OracleRequestResponse> {
    let row = app
        .oracle
        .request(&req.source, None, req.callback_url.as_deref())
        .await?;

    ok(row.into())
}

async fn public_oracle_request_status(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<OracleRequestResponse> {
    ok(app.oracle.get_request(id).await?.into())
}

async fn public_oracle_data(
    State(app): State<Arc<App>>,
    Path(id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    let row = app.oracle.get_request(id).await?;

    match row.result {
        Some(result) => ok(result),
        None => Err(Error(ServiceError::not_found(
            "request has not completed yet",
        ))),
    }
}

// ---------------------------------------------------------------------
// System
// ---------------------------------------------------------------------

async fn health() -> ApiResult<()> {
    ok(())
}

async fn readiness(State(app): State<Arc<App>>) -> ApiResult<()> {
    app.readiness().await?;
    ok(())
}

async fn liveness() -> ApiResult<()> {
    ok(())
}

async fn metrics() -> Result<Response, Error> {
    let encoder = TextEncoder::new();

    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error(ServiceError::internal(e.to_string())))?;

    let response = Response::builder()
        .status(200)
        .header(CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .map_err(|e| Error(ServiceError::internal(e.to_string())))?;

    Ok(response)
}

// ---------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------

pub fn router(app: Arc<App>, config: &ServerConfig) -> Router {
    let rate_limiter = RateLimiter::new(config.rate_limit_per_minute);

    let protected = Router::new()
        // Functions
        .route("/functions", get(list_functions).post(create_function))
        .route(
            "/functions/:id",
            get(get_function).put(update_function).delete(delete_function),
        )
        .route("/functions/:id/execute", post(execute_function))
        .route("/functions/:id/executions", get(list_executions))
        .route("/functions/:id/executions/:ex", get(get_execution))
        // Secrets
        .route("/secrets", get(list_secrets).post(create_secret))
        .route("/secrets/rotate-keys", post(rotate_secrets))
        .route("/secrets/audit-log", get(secret_audit_log))
        .route("/secrets/name/:name", get(get_secret_by_name))
        .route(
            "/secrets/:id",
            get(get_secret).put(update_secret).delete(delete_secret),
        )
        // Triggers
        .route("/triggers", get(list_triggers).post(create_trigger))
        .route(
            "/triggers/:id",
            get(get_trigger).put(update_trigger).delete(delete_trigger),
        )
        .route("/triggers/:id/execute", post(fire_trigger))
        .route("/triggers/:id/pause", post(pause_trigger))
        .route("/triggers/:id/resume", post(resume_trigger))
        .route("/triggers/:id/history", get(trigger_history))
        // Gas bank
        .route("/gasbank/balance", get(gas_balance))
        .route("/gasbank/deposit-address", get(deposit_address))
        .route("/gasbank/withdraw", post(withdraw))
        .route("/gasbank/transactions", get(list_gas_transactions))
        .route("/gasbank/transactions/:id", get(get_gas_transaction))
        // Transactions
        .route(
            "/transactions",
            get(list_transactions).post(create_transaction),
        )
        .route("/transactions/wallets", get(list_all_wallets))
        .route("/transactions/wallets/:service", post(create_wallet))
        .route("/transactions/wallets/:service/all", get(list_service_wallets))
        .route("/transactions/:id", get(get_transaction))
        .route("/transactions/:id/retry", post(retry_transaction))
        .route("/transactions/:id/cancel", post(cancel_transaction))
        .route("/transactions/:id/events", get(transaction_events))
        // Oracle sources
        .route("/oracles", get(list_oracle_sources).post(create_oracle_source))
        .route(
            "/oracles/:id",
            get(get_oracle_source)
                .put(update_oracle_source)
                .delete(delete_oracle_source),
        )
        .layer(middleware::from_fn_with_state(
            rate_limiter,
            custom_middleware::rate_limit_layer::middleware,
        ))
        .layer(middleware::from_fn_with_state(
            app.clone(),
            custom_middleware::auth_layer::middleware,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .route("/health/readiness", get(readiness))
        .route("/health/liveness", get(liveness))
        .route("/metrics", get(metrics))
        .route("/public/oracles/request", post(public_oracle_request))
        .route(
            "/public/oracles/request/:id",
            get(public_oracle_request_status),
        )
        .route("/public/oracles/data/:id", get(public_oracle_data));

    protected
        .merge(public)
        .layer(middleware::from_fn(
            custom_middleware::api_metrics_layer::middleware,
        ))
        .layer(middleware::from_fn_with_state(
            config.serve_timeout,
            custom_middleware::timeout_layer::middleware,
        ))
        .layer(middleware::from_fn(
            custom_middleware::logging_layer::middleware,
        ))
        .layer(CatchPanicLayer::new())
        .with_state(app)
}

/// Binds and serves until shutdown.
pub async fn run(app: Arc<App>, config: ServerConfig, shutdown: Shutdown) -> anyhow::Result<()> {
    info!("Will listen on {}", config.address);
    let listener = tokio::net::TcpListener::bind(config.address).await?;

    let router = router(app, &config);

    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.await_shutdown().await });

    server.await?;

    Ok(())
}
