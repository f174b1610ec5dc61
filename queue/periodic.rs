use std::{future::Future, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff};
use mxrmq_graceful_shutdown::ShutdownListener;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::error::Error;

/// Run a maintenance operation on a fixed cadence until shutdown.
///
/// Transient failures are logged and retried with exponential backoff on
/// top of the cadence; they never touch a message's attempt counter. A
/// success resets the backoff.
pub(crate) fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: ShutdownListener,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<usize, Error>> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        let mut backoff = transient_backoff(period);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.wait() => break,
                _ = interval.tick() => {}
            };

            match task().await {
                Ok(count) => {
                    backoff.reset();
                    if count > 0 {
                        event!(Level::INFO, task = %name, count = %count, "Processed items");
                    }
                }
                Err(e) => {
                    event!(Level::ERROR, task = %name, error = %e, "Maintenance pass failed");
                    if let Some(sleep_time) = backoff.next_backoff() {
                        tokio::select! {
                            biased;
                            _ = shutdown.wait() => break,
                            _ = tokio::time::sleep(sleep_time) => {}
                        };
                    }
                }
            }
        }

        event!(Level::DEBUG, task = %name, "Maintenance task stopped");
    })
}

pub(crate) fn transient_backoff(initial: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..Default::default()
    }
}
