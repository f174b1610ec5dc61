use chrono::Utc;
use mxrmq_graceful_shutdown::ShutdownListener;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::MessageQueue;

// Refresh the lease of every message this process is still working on.
// Runs at a third of the lease length. On shutdown leases are simply left
// to expire; the reclaimer requeues anything that was cut off.
pub(crate) fn lease_monitor_loop(
    queue: MessageQueue,
    mut shutdown: ShutdownListener,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let lease_ms = queue.0.config.lease_timeout.as_millis() as i64;
        let mut interval = tokio::time::interval(queue.0.config.lease_refresh_interval());

        loop {
            tokio::select! {
                biased;

                _ = shutdown.wait() => break,
                _ = interval.tick() => {}
            };

            let active = queue.0.active.snapshot();
            if active.is_empty() {
                continue;
            }

            let mut conn = match queue.0.pool.get().await {
                Ok(conn) => conn,
                Err(e) => {
                    event!(Level::ERROR, error = %e, "Error acquiring connection for lease refresh");
                    continue;
                }
            };

            let new_expiry = Utc::now().timestamp_millis() + lease_ms;
            for (id, _lease) in active {
                match queue
                    .0
                    .scripts
                    .extend_lease
                    .run(&queue.0.keys, &mut conn, &id, new_expiry)
                    .await
                {
                    Ok(Some(lease)) => {
                        // The worker may have finished in the meantime;
                        // update only refreshes ids still held locally.
                        queue.0.active.update(&id, lease);
                    }
                    Ok(None) => {
                        // No longer in flight (acked elsewhere or reclaimed);
                        // stop refreshing it.
                        queue.0.active.remove(&id);
                        event!(Level::DEBUG, message_id = %id,
                            "Lease vanished before refresh; the worker's terminal call will no-op");
                    }
                    Err(e) => {
                        event!(Level::ERROR, message_id = %id, error = %e, "Error extending lease");
                    }
                }
            }
        }

        event!(Level::DEBUG, "Lease monitor stopped");
    })
}
