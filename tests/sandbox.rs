//! End-to-end sandbox behavior against real WebAssembly guests: the three
//! resource bounds, the host capability envelope, log budgeting and
//! result handling.

mod common;

use serde_json::json;

use neo_service_layer::sandbox::{error_kind, run_epoch_ticker, SandboxResult};

use common::{function_with, identity_for, runtime_with, sandbox_config};

const SPIN_FOREVER: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "alloc") (param i32) (result i32) (i32.const 4096))
  (func (export "run") (param i32 i32) (result i64)
    (loop $spin (br $spin))
    (i64.const 0)))
"#;

const ECHO_PARAMS: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "alloc") (param i32) (result i32) (i32.const 4096))
  (func (export "run") (param i32 i32) (result i64)
    (i64.or
      (i64.shl (i64.extend_i32_u (local.get 0)) (i64.const 32))
      (i64.extend_i32_u (local.get 1)))))
"#;

const FIXED_RESULT: &str = r#"
(module
  (memory (export "memory") 1)
  (data (i32.const 64) "{\"answer\":42}")
  (func (export "alloc") (param i32) (result i32) (i32.const 4096))
  (func (export "run") (param i32 i32) (result i64)
    (i64.const 274877906957)))
"#;

const GROW_FOREVER: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "alloc") (param i32) (result i32) (i32.const 0))
  (func (export "run") (param i32 i32) (result i64)
    (loop $grow
      (drop (memory.grow (i32.const 16)))
      (br $grow))
    (i64.const 0)))
"#;

const LOG_FIVE_TIMES: &str = r#"
(module
  (import "env" "host_call" (func $host_call (param i32 i32 i32 i32) (result i64)))
  (memory (export "memory") 1)
  (data (i32.const 0) "log")
  (data (i32.const 16) "{\"message\":\"hello\"}")
  (func (export "alloc") (param i32) (result i32) (i32.const 8192))
  (func (export "run") (param i32 i32) (result i64)
    (local $i i32)
    (loop $again
      (drop (call $host_call (i32.const 0) (i32.const 3) (i32.const 16) (i32.const 19)))
      (local.set $i (i32.add (local.get $i) (i32.const 1)))
      (br_if $again (i32.lt_u (local.get $i) (i32.const 5))))
    (i64.const 0)))
"#;

const SHA256_OF_ABC: &str = r#"
(module
  (import "env" "host_call" (func $host_call (param i32 i32 i32 i32) (result i64)))
  (memory (export "memory") 1)
  (data (i32.const 0) "crypto.sha256")
  (data (i32.const 32) "{\"data\":\"abc\"}")
  (func (export "alloc") (param i32) (result i32) (i32.const 8192))
  (func (export "run") (param i32 i32) (result i64)
    (call $host_call (i32.const 0) (i32.const 13) (i32.const 32) (i32.const 14))))
"#;

const READ_UNDECLARED_SECRET: &str = r#"
(module
  (import "env" "host_call" (func $host_call (param i32 i32 i32 i32) (result i64)))
  (memory (export "memory") 1)
  (data (i32.const 0) "secrets.get")
  (data (i32.const 32) "{\"name\":\"api_key\"}")
  (func (export "alloc") (param i32) (result i32) (i32.const 8192))
  (func (export "run") (param i32 i32) (result i64)
    (call $host_call (i32.const 0) (i32.const 11) (i32.const 32) (i32.const 18))))
"#;

#[tokio::test(flavor = "multi_thread")]
async fn deadline_produces_timeout_with_bounded_duration() {
    let runtime = runtime_with(sandbox_config());
    tokio::spawn(run_epoch_ticker(runtime.engine()));

    let function = function_with(SPIN_FOREVER, 200, 16);
    let identity = identity_for(&function);

    let outcome = runtime.execute(&function, &json!({}), identity).await;

    assert_eq!(outcome.result, SandboxResult::Timeout);
    assert!(
        outcome.duration_ms >= 150 && outcome.duration_ms <= 2_000,
        "duration {}ms outside the expected window",
        outcome.duration_ms
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn fuel_exhaustion_is_a_resource_error() {
    let mut config = sandbox_config();
    config.fuel_limit = 10_000;

    let runtime = runtime_with(config);
    tokio::spawn(run_epoch_ticker(runtime.engine()));

    let function = function_with(SPIN_FOREVER, 30_000, 16);
    let identity = identity_for(&function);

    let outcome = runtime.execute(&function, &json!({}), identity).await;

    match outcome.result {
        SandboxResult::Error { kind, .. } => {
            assert_eq!(kind, error_kind::RESOURCE_EXCEEDED);
        }
        other => panic!("expected a resource error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn memory_limit_is_a_resource_error() {
    let runtime = runtime_with(sandbox_config());
    tokio::spawn(run_epoch_ticker(runtime.engine()));

    let function = function_with(GROW_FOREVER, 5_000, 1);
    let identity = identity_for(&function);

    let outcome = runtime.execute(&function, &json!({}), identity).await;

    match outcome.result {
        SandboxResult::Error { kind, message } => {
            assert_eq!(kind, error_kind::RESOURCE_EXCEEDED, "message: {message}");
        }
        other => panic!("expected a resource error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn params_echo_round_trips() {
    let runtime = runtime_with(sandbox_config());

    let function = function_with(ECHO_PARAMS, 5_000, 16);
    let identity = identity_for(&function);

    let params = json!({ "pair": "NEO/GAS", "limit": 10 });
    let outcome = runtime.execute(&function, &params, identity).await;

    assert_eq!(outcome.result, SandboxResult::Success(params));
}

#[tokio::test(flavor = "multi_thread")]
async fn fixed_result_is_parsed() {
    let runtime = runtime_with(sandbox_config());

    let function = function_with(FIXED_RESULT, 5_000, 16);
    let identity = identity_for(&function);

    let outcome = runtime.execute(&function, &json!({}), identity).await;

    assert_eq!(
        outcome.result,
        SandboxResult::Success(json!({ "answer": 42 }))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_results_are_rejected() {
    let mut config = sandbox_config();
    config.max_result_bytes = 8;

    let runtime = runtime_with(config);

    let function = function_with(FIXED_RESULT, 5_000, 16);
    let identity = identity_for(&function);

    let outcome = runtime.execute(&function, &json!({}), identity).await;

    match outcome.result {
        SandboxResult::Error { kind, .. } => {
            assert_eq!(kind, error_kind::RESOURCE_EXCEEDED);
        }
        other => panic!("expected a resource error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn log_lines_are_captured_and_budgeted() {
    let runtime = runtime_with(sandbox_config());

    let function = function_with(LOG_FIVE_TIMES, 5_000, 16);
    let identity = identity_for(&function);

    let outcome = runtime.execute(&function, &json!({}), identity).await;

    assert_eq!(outcome.result, SandboxResult::Success(serde_json::Value::Null));
    assert_eq!(outcome.logs, vec!["hello"; 5]);

    // Same guest with a budget of three lines: the excess is dropped.
    let mut config = sandbox_config();
    config.max_log_lines = 3;

    let runtime = runtime_with(config);
    let identity = identity_for(&function);
    let outcome = runtime.execute(&function, &json!({}), identity).await;

    assert_eq!(outcome.logs, vec!["hello"; 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn host_capability_envelope_round_trips() {
    let runtime = runtime_with(sandbox_config());

    let function = function_with(SHA256_OF_ABC, 5_000, 16);
    let identity = identity_for(&function);

    let outcome = runtime.execute(&function, &json!({}), identity).await;

    let SandboxResult::Success(envelope) = outcome.result else {
        panic!("expected success, got {:?}", outcome.result);
    };

    assert_eq!(envelope["ok"], json!(true));
    assert_eq!(
        envelope["value"],
        json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn undeclared_secret_reads_surface_not_authorized() {
    let runtime = runtime_with(sandbox_config());

    let function = function_with(READ_UNDECLARED_SECRET, 5_000, 16);
    let identity = identity_for(&function);

    let outcome = runtime.execute(&function, &json!({}), identity).await;

    let SandboxResult::Success(envelope) = outcome.result else {
        panic!("expected an error envelope, got {:?}", outcome.result);
    };

    assert_eq!(envelope["ok"], json!(false));
    assert_eq!(envelope["kind"], json!("secrets.not_authorized"));
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_modules_fail_validation_and_execution() {
    let runtime = runtime_with(sandbox_config());

    assert!(runtime.validate_source("(module (func unreachable").is_err());
    assert!(runtime.validate_source(ECHO_PARAMS).is_ok());

    let function = function_with("definitely not wasm", 5_000, 16);
    let identity = identity_for(&function);

    let outcome = runtime.execute(&function, &json!({}), identity).await;

    match outcome.result {
        SandboxResult::Error { kind, .. } => assert_eq!(kind, error_kind::INVALID_MODULE),
        other => panic!("expected an invalid module error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn user_traps_are_user_errors() {
    let trap = r#"
    (module
      (memory (export "memory") 1)
      (func (export "alloc") (param i32) (result i32) (i32.const 4096))
      (func (export "run") (param i32 i32) (result i64)
        unreachable))
    "#;

    let runtime = runtime_with(sandbox_config());

    let function = function_with(trap, 5_000, 16);
    let identity = identity_for(&function);

    let outcome = runtime.execute(&function, &json!({}), identity).await;

    match outcome.result {
        SandboxResult::Error { kind, .. } => assert_eq!(kind, error_kind::USER_ERROR),
        other => panic!("expected a user error, got {other:?}"),
    }
}
