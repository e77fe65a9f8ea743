use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use once_cell::sync::Lazy;
use prometheus::{register_gauge, Gauge};
use tokio::select;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::App;
use crate::sandbox;
use crate::shutdown::Shutdown;
use crate::transactions::observer::ConfirmationObserver;
use crate::triggers::{chain_events, cron, price};
use crate::utils::{spawn_with_backoff, spawn_with_backoff_cancel_on_shutdown};

const TASK_BACKOFF: Duration = Duration::from_secs(5);
const QUEUE_GAUGE_INTERVAL: Duration = Duration::from_secs(5);

static EXECUTION_QUEUE_DEPTH: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "execution_queue_depth",
        "Executions waiting for a sandbox worker"
    )
    .unwrap()
});

/// A task manager for all long running tasks
///
/// It's assumed that there is only one instance at a time.
/// Spawning multiple `TaskMonitors` will result in undefined behavior,
/// including data duplication.
pub struct TaskMonitor;

impl TaskMonitor {
    /// Spawns every background task and watches them for panics.
    pub async fn init(app: Arc<App>, shutdown: Shutdown) {
        let handles = FuturesUnordered::new();

        // Sandbox deadline watchdog
        let engine = app.pipeline.runtime().engine();
        handles.push(spawn_with_backoff_cancel_on_shutdown(
            move || sandbox::run_epoch_ticker(engine.clone()),
            TASK_BACKOFF,
            shutdown.clone(),
        ));

        // Sandbox workers
        for _ in 0..app.config.sandbox.workers {
            let pipeline = app.pipeline.clone();
            handles.push(spawn_with_backoff_cancel_on_shutdown(
                move || pipeline.clone().run_worker(),
                TASK_BACKOFF,
                shutdown.clone(),
            ));
        }

        // Trigger execution completions
        let triggers = app.triggers.clone();
        handles.push(spawn_with_backoff_cancel_on_shutdown(
            move || triggers.clone().run_completion_handler(),
            TASK_BACKOFF,
            shutdown.clone(),
        ));

        // Trigger schedulers
        let engine = app.triggers.clone();
        handles.push(spawn_with_backoff_cancel_on_shutdown(
            move || cron::run_cron_scheduler(engine.clone()),
            TASK_BACKOFF,
            shutdown.clone(),
        ));

        let engine = app.triggers.clone();
        let feed = app.price_feed.clone();
        handles.push(spawn_with_backoff_cancel_on_shutdown(
            move || price::run_price_watcher(engine.clone(), feed.clone()),
            TASK_BACKOFF,
            shutdown.clone(),
        ));

        if let Some(http_feed) = app.http_price_feed.clone() {
            handles.push(spawn_with_backoff_cancel_on_shutdown(
                move || http_feed.clone().run(),
                TASK_BACKOFF,
                shutdown.clone(),
            ));
        }

        let engine = app.triggers.clone();
        let rpc = app.rpc.clone();
        let chain_config = app.config.chain.clone();
        handles.push(spawn_with_backoff_cancel_on_shutdown(
            move || {
                chain_events::run_chain_event_scanner(
                    engine.clone(),
                    rpc.clone(),
                    chain_config.clone(),
                )
            },
            TASK_BACKOFF,
            shutdown.clone(),
        ));

        // Transaction submission and confirmation
        let transactions = app.transactions.clone();
        handles.push(spawn_with_backoff_cancel_on_shutdown(
            move || transactions.clone().run_submitter(),
            TASK_BACKOFF,
            shutdown.clone(),
        ));

        let observer = Arc::new(ConfirmationObserver::new(
            app.database.clone(),
            app.transactions.clone(),
            app.gas_bank.clone(),
            app.rpc.clone(),
            app.config.chain.clone(),
        ));
        // Allowed to finish its polling round during shutdown so
        // settlements are not cut off halfway.
        handles.push(spawn_with_backoff(
            move || observer.clone().run(),
            TASK_BACKOFF,
            shutdown.clone(),
        ));

        // Gas deposit watcher
        match app.deposit_address().await {
            Ok(deposit_address) => {
                let gas_bank = app.gas_bank.clone();
                let rpc = app.rpc.clone();
                let chain_config = app.config.chain.clone();
                handles.push(spawn_with_backoff_cancel_on_shutdown(
                    move || {
                        crate::gas_bank::deposit_watcher::run_deposit_watcher(
                            gas_bank.clone(),
                            rpc.clone(),
                            chain_config.clone(),
                            deposit_address.clone(),
                        )
                    },
                    TASK_BACKOFF,
                    shutdown.clone(),
                ));
            }
            Err(err) => {
                warn!(?err, "Deposit wallet unavailable, deposit watcher not started");
            }
        }

        // Gas reservation reaper
        let database = app.database.clone();
        let gas_bank = app.gas_bank.clone();
        handles.push(spawn_with_backoff_cancel_on_shutdown(
            move || {
                crate::gas_bank::reaper::reap_expired_reservations(
                    database.clone(),
                    gas_bank.clone(),
                )
            },
            TASK_BACKOFF,
            shutdown.clone(),
        ));

        // Oracle request worker
        let oracle = app.oracle.clone();
        handles.push(spawn_with_backoff_cancel_on_shutdown(
            move || oracle.clone().run_request_worker(),
            TASK_BACKOFF,
            shutdown.clone(),
        ));

        // Queue depth gauge
        let pipeline = app.pipeline.clone();
        handles.push(spawn_with_backoff_cancel_on_shutdown(
            move || {
                let pipeline = pipeline.clone();
                async move {
                    loop {
                        EXECUTION_QUEUE_DEPTH.set(pipeline.queue_len().await as f64);
                        tokio::time::sleep(QUEUE_GAUGE_INTERVAL).await;
                    }
                }
            },
            TASK_BACKOFF,
            shutdown.clone(),
        ));

        tokio::spawn(Self::monitor_shutdown(handles, shutdown));
    }

    async fn monitor_shutdown(mut handles: FuturesUnordered<JoinHandle<()>>, shutdown: Shutdown) {
        select! {
            // Wait for the shutdown signal
            _ = shutdown.await_shutdown_begin() => {}
            // Or wait for a task to panic
            _ = Self::await_task_panic(&mut handles, shutdown.clone()) => {}
        };
    }

    async fn await_task_panic(handles: &mut FuturesUnordered<JoinHandle<()>>, shutdown: Shutdown) {
        while let Some(result) = handles.next().await {
            if !shutdown.is_shutting_down() {
                match result {
                    Ok(()) => {
                        info!("task exited");
                    }
                    Err(error) => {
                        error!(?error, "task panicked");
                        // Instruct the rest of the app to shutdown
                        shutdown.shutdown();
                        return;
                    }
                }
            }
        }
        warn!("all tasks have returned unexpectedly");
    }
}
