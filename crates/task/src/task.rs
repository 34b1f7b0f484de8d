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

//! Task trait and helper functions

use std::future::Future;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A top level bundler component that runs until shutdown.
#[async_trait]
pub trait Task: Sync + Send + 'static {
    /// Runs the task until `shutdown_token` is cancelled or it fails.
    async fn run(self: Box<Self>, shutdown_token: CancellationToken) -> anyhow::Result<()>;
}

/// Runs `tasks` until the first of them exits or `signal` resolves, then
/// cancels the shared token and waits for every task to return.
pub async fn spawn_tasks_with_shutdown<T, R, E>(
    tasks: impl IntoIterator<Item = Box<dyn Task>>,
    signal: T,
) where
    T: Future<Output = Result<R, E>> + Send + 'static,
    E: std::fmt::Debug,
{
    let shutdown_token = CancellationToken::new();
    let mut running = JoinSet::new();
    for task in tasks {
        running.spawn(task.run(shutdown_token.child_token()));
    }

    tokio::select! {
        Some(exited) = running.join_next() => match exited {
            Ok(Ok(())) => error!("Task exited before shutdown"),
            Ok(Err(err)) => error!("Task failed: {err:?}"),
            Err(err) => error!("Task panicked or was aborted: {err}"),
        },
        res = signal => match res {
            Ok(_) => info!("Received signal, shutting down"),
            Err(err) => error!("Error while waiting for signal: {err:?}"),
        },
    }

    shutdown_token.cancel();
    while let Some(exited) = running.join_next().await {
        if let Ok(Err(err)) = exited {
            error!("Task failed during shutdown: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::*;

    struct WaitForShutdown {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Task for WaitForShutdown {
        async fn run(self: Box<Self>, shutdown_token: CancellationToken) -> anyhow::Result<()> {
            shutdown_token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailImmediately;

    #[async_trait]
    impl Task for FailImmediately {
        async fn run(self: Box<Self>, _shutdown_token: CancellationToken) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn test_waits_for_tasks_after_signal() {
        let stopped = Arc::new(AtomicBool::new(false));
        let task = WaitForShutdown {
            stopped: Arc::clone(&stopped),
        };

        spawn_tasks_with_shutdown(
            [Box::new(task) as Box<dyn Task>],
            async { Ok::<_, std::io::Error>(()) },
        )
        .await;

        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_task_stops_the_others() {
        let stopped = Arc::new(AtomicBool::new(false));
        let waiting = WaitForShutdown {
            stopped: Arc::clone(&stopped),
        };

        spawn_tasks_with_shutdown(
            [
                Box::new(waiting) as Box<dyn Task>,
                Box::new(FailImmediately) as Box<dyn Task>,
            ],
            std::future::pending::<Result<(), std::io::Error>>(),
        )
        .await;

        assert!(stopped.load(Ordering::SeqCst));
    }
}
