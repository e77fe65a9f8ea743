use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::Either;
use futures::{FutureExt, StreamExt};
use tokio::select;
use tokio::task::JoinHandle;
use tracing::error;

use crate::shutdown::Shutdown;

pub mod async_queue;
pub mod gas;
pub mod secret;
pub mod serde_utils;

/// Retries a database transaction a limited number of times.
///
/// Errors from `Transaction::commit` (serialization conflicts under the
/// default SERIALIZABLE isolation) and from the transaction body are both
/// retried after a rollback, up to the limit.
///
/// # Example
/// ```ignore
/// let res = retry_tx!(db.pool(), tx, {
///     tx.execute("SELECT 1").await?;
///     Ok(())
/// }).await;
/// ```
#[macro_export]
macro_rules! retry_tx {
    ($pool:expr, $tx:ident, $expression:expr) => {
        async {
            let mut res;
            let mut counter = 0;
            loop {
                let mut $tx = $pool.begin().await?;
                res = async { $expression }.await;
                let limit = 10;
                if let Err(e) = res {
                    counter += 1;
                    if counter > limit {
                        return Err(e.into());
                    } else {
                        $tx.rollback().await?;
                        tracing::warn!(
                            error = ?e,
                            "db transaction returned error ({counter}/{limit})"
                        );
                        continue;
                    }
                }
                match $tx.commit().await {
                    Err(e) => {
                        counter += 1;
                        if counter > limit {
                            return Err(e.into());
                        } else {
                            tracing::warn!(
                                error = ?e,
                                "db transaction commit failed ({counter}/{limit})"
                            );
                        }
                    }
                    Ok(_) => break,
                }
            }
            res
        }
    };
}

/// Spawns a future that will retry on failure with a backoff duration.
///
/// The future retries until it succeeds or a shutdown signal is received.
/// During a shutdown the task is cancelled immediately.
pub fn spawn_with_backoff_cancel_on_shutdown<S, F>(
    future_spawner: S,
    backoff_duration: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let shutting_down = AtomicBool::new(false);
        select! {
            _ = retry_future(future_spawner, backoff_duration, &shutting_down) => {},
            _ = await_shutdown_begin(shutdown, &shutting_down) => {},
        }
    })
}

/// Spawns a future that will retry on failure with a backoff duration.
///
/// During a shutdown the current attempt is allowed to finish; useful when
/// the task has cleanup logic that must run.
pub fn spawn_with_backoff<S, F>(
    future_spawner: S,
    backoff_duration: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let shutting_down = AtomicBool::new(false);
        let retry = Either::Left(retry_future(
            future_spawner,
            backoff_duration,
            &shutting_down,
        ));
        let shutdown = Either::Right(await_shutdown_begin(shutdown, &shutting_down));

        // If retry completes we return; if shutdown completes we still wait
        // for retry.
        futures::stream::iter(vec![retry, shutdown])
            .buffered(2)
            .next()
            .await;
    })
}

async fn await_shutdown_begin(shutdown: Shutdown, shutting_down: &AtomicBool) {
    shutdown.await_shutdown_begin().await;
    shutting_down.store(true, Ordering::SeqCst);
}

async fn retry_future<S, F>(
    future_spawner: S,
    backoff_duration: Duration,
    shutting_down: &AtomicBool,
) where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    loop {
        let future = future_spawner();

        // Wrap in `AssertUnwindSafe` so we can call `catch_unwind` on it.
        let future = std::panic::AssertUnwindSafe(future);
        let result = future.catch_unwind().await;

        match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                error!("Task failed: {e:?}");

                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }

                tokio::time::sleep(backoff_duration).await;
            }
            Err(e) => {
                error!("Task panicked: {e:?}");

                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }

                tokio::time::sleep(backoff_duration).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;

    #[tokio::test]
    #[traced_test]
    async fn spawned_task_retries_until_allowed_to_finish() -> anyhow::Result<()> {
        let can_finish = Arc::new(AtomicBool::new(false));
        let triggered_error = Arc::new(AtomicBool::new(false));
        let shutdown = Shutdown::new(Duration::from_secs(30), Duration::from_secs(1));
        let handle = {
            let can_finish = can_finish.clone();
            let triggered_error = triggered_error.clone();

            spawn_with_backoff(
                move || {
                    let can_finish = can_finish.clone();
                    let triggered_error = triggered_error.clone();

                    async move {
                        if can_finish.load(Ordering::SeqCst) {
                            Ok(())
                        } else {
                            triggered_error.store(true, Ordering::SeqCst);

                            // Free up the executor before panicking
                            tokio::time::sleep(Duration::from_millis(20)).await;

                            panic!("Panicking!");
                        }
                    }
                },
                Duration::from_secs_f32(0.2),
                shutdown,
            )
        };

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(triggered_error.load(Ordering::SeqCst));
        assert!(!handle.is_finished(), "Task should not be finished");
        assert!(logs_contain("Task panicked"));

        can_finish.store(true, Ordering::SeqCst);
        triggered_error.store(false, Ordering::SeqCst);

        drop(tokio::time::timeout(Duration::from_secs(2), handle).await?);

        assert!(!triggered_error.load(Ordering::SeqCst));

        Ok(())
    }
}
