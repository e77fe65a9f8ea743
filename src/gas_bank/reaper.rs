use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use super::GasBank;
use crate::database::methods::DbMethods as _;
use crate::database::Database;
use crate::error::ErrorKind;

const REAP_BATCH: i64 = 100;

/// Refunds held reservations whose settlement never arrived within the
/// configured TTL. Runs until cancelled by the task monitor.
pub async fn reap_expired_reservations(
    database: Arc<Database>,
    gas_bank: Arc<GasBank>,
) -> anyhow::Result<()> {
    let interval = gas_bank.config().reaper_interval;

    loop {
        reap_once(&database, &gas_bank).await?;
        sleep(interval).await;
    }
}

#[instrument(level = "debug", skip_all)]
async fn reap_once(database: &Database, gas_bank: &GasBank) -> anyhow::Result<()> {
    let ttl = ChronoDuration::from_std(gas_bank.config().reservation_ttl)?;
    let cutoff = Utc::now() - ttl;

    loop {
        let expired = database
            .pool
            .list_expired_held_reservations(cutoff, REAP_BATCH)
            .await?;

        if expired.is_empty() {
            return Ok(());
        }

        for reservation in &expired {
            match gas_bank.refund(reservation.id).await {
                Ok(_) => {
                    info!(
                        reservation = %reservation.id,
                        amount = reservation.amount,
                        purpose = %reservation.purpose_ref,
                        "Refunded expired reservation"
                    );
                }
                // A settlement raced us; nothing to release anymore.
                Err(err) if err.kind == ErrorKind::Conflict => {}
                Err(err) => {
                    warn!(reservation = %reservation.id, ?err, "Failed to reap reservation");
                }
            }
        }

        if expired.len() < REAP_BATCH as usize {
            return Ok(());
        }
    }
}
