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

//! Broadcasting and logging of component events

use std::fmt::{self, Display, Formatter};

use alloy_primitives::Address;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{info, warn};

/// Capacity of the event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// An event tagged with the entry point it concerns.
#[derive(Clone, Debug)]
pub struct WithEntryPoint<T> {
    /// Entry point address associated with the event
    pub entry_point: Address,
    /// The event itself
    pub event: T,
}

impl<T: Display> Display for WithEntryPoint<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}    Entrypoint: {}", self.event, self.entry_point)
    }
}

/// Logs every event from `rx` that passes `filter` at `INFO` until the
/// channel closes. Lagging is reported and skipped.
pub fn log_events<T>(
    mut rx: broadcast::Receiver<T>,
    filter: impl (Fn(&T) -> bool) + Send + 'static,
) -> JoinHandle<usize>
where
    T: Clone + Display + Send + 'static,
{
    tokio::spawn(async move {
        let mut logged = 0;
        loop {
            match rx.recv().await {
                Ok(event) if filter(&event) => {
                    info!("{event}");
                    logged += 1;
                }
                Ok(_) => {}
                Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(count)) => warn!("Event log lagged, skipped {count} events"),
            }
        }
        logged
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logs_filtered_events_until_closed() {
        let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let handle = log_events(rx, |n: &usize| n % 2 == 0);

        for n in 0..5usize {
            tx.send(n).unwrap();
        }
        drop(tx);

        assert_eq!(handle.await.unwrap(), 3);
    }

    #[test]
    fn test_display_includes_entry_point() {
        let event = WithEntryPoint {
            entry_point: Address::ZERO,
            event: "bundle sent",
        };
        assert!(event.to_string().starts_with("bundle sent"));
        assert!(event.to_string().contains(&Address::ZERO.to_string()));
    }
}
