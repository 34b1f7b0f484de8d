// This file is part of Bundler.
//
// Bundler is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// Bundler is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with Bundler.
// If not, see https://www.gnu.org/licenses/.

use std::time::Duration;

use anyhow::{ensure, Context};
use async_trait::async_trait;
use bundler_pool::{Mempool, ReputationStore};
use bundler_task::Task;
use bundler_utils::log::LogOnError;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{bundler::Bundler, executor::BundleExecutor};

/// Drives a [`Bundler`] on timers: bundling, reputation decay and mempool
/// pruning.
pub struct BundlerTask<M, R, E> {
    bundler: Bundler<M, R, E>,
}

#[async_trait]
impl<M, R, E> Task for BundlerTask<M, R, E>
where
    M: Mempool,
    R: ReputationStore,
    E: BundleExecutor,
{
    async fn run(self: Box<Self>, shutdown_token: CancellationToken) -> anyhow::Result<()> {
        let config = self.bundler.config().clone();
        for (name, period) in [
            ("bundle interval", config.bundle_interval),
            ("reputation decay interval", config.reputation_decay_interval),
            ("prune interval", config.prune_interval),
        ] {
            ensure!(!period.is_zero(), "{name} must be positive");
        }

        self.bundler
            .recover_submitted()
            .await
            .context("should have recovered submitted ops")?;

        let mut bundle_timer = timer(config.bundle_interval, true);
        let mut decay_timer = timer(config.reputation_decay_interval, false);
        let mut prune_timer = timer(config.prune_interval, false);

        info!(
            "Started bundler for entry points {:?}",
            config.supported_entry_points
        );

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    info!("Shutting down bundler");
                    break;
                }
                _ = bundle_timer.tick() => {
                    if let Err(e) = self.bundler.bundle_once().await {
                        error!("Failed to bundle: {e}");
                    }
                }
                _ = decay_timer.tick() => {
                    let _ = self
                        .bundler
                        .decay_reputation()
                        .await
                        .log_on_error("should have decayed reputation");
                }
                _ = prune_timer.tick() => {
                    let _ = self
                        .bundler
                        .prune_mempool()
                        .await
                        .log_on_error("should have pruned mempool");
                }
            }
        }

        Ok(())
    }
}

impl<M, R, E> BundlerTask<M, R, E>
where
    M: Mempool,
    R: ReputationStore,
    E: BundleExecutor,
{
    /// Create a new bundler task
    pub fn new(bundler: Bundler<M, R, E>) -> Self {
        Self { bundler }
    }

    /// Convert this task into a boxed task
    pub fn boxed(self) -> Box<dyn Task> {
        Box::new(self)
    }
}

fn timer(period: Duration, immediate: bool) -> time::Interval {
    let start = if immediate {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut timer = time::interval_at(start, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}
