//! Periodic background work.
//!
//! The only scheduled task is the subscription expiry sweep. Each tick runs
//! one sweep in its own database transaction; a failed tick is logged and the
//! next tick tries again. Running a sweep when nothing is due is a no-op, so
//! redundant ticks (or several worker instances) are harmless.
//!
//! ```text
//!   tick          tick          tick
//!    |             |             |
//!    v             v             v
//! sweep: lock active subscriptions with expires_at <= now
//!        mark them expired
//!        revoke product.<id> from each user
//! ```

use anyhow::Context;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time;

use crate::{store, telemetry::log_error, time::TimeSource};

pub struct Scheduler {
    pool: PgPool,
    time_source: TimeSource,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        time_source: TimeSource,
        tick_interval: Duration,
    ) -> Self {
        Self {
            pool,
            time_source,
            tick_interval,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.tick_interval);
        // A slow sweep shouldn't cause a burst of catch-up ticks.
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let _ = sweep_tick(&self.pool, &self.time_source)
                .await
                .map_err(log_error);
        }
    }
}

/// Run one expiry sweep right now, returning how many subscriptions expired.
#[tracing::instrument(skip(pool, time_source))]
pub async fn sweep_tick(
    pool: &PgPool,
    time_source: &TimeSource,
) -> anyhow::Result<u64> {
    let expired =
        store::subscription::sweep_expired_subscriptions(time_source, pool)
            .await
            .context("failed to sweep expired subscriptions")?;

    if expired > 0 {
        tracing::info!(expired, "expired subscriptions");
    }

    Ok(expired)
}
