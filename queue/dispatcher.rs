use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use mxrmq_graceful_shutdown::{ShutdownListener, ShutdownTrigger};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{event, Level};

use crate::{
    error::Error,
    message::Message,
    take_ready::TakeOutcome,
    work_item::ActiveMessage,
    MessageQueue,
};

// One dispatcher per consumer process. It is the only producer for the
// local task channel; the channel filling up stops the fetch loop, so
// Redis keeps ownership of everything this process has not accepted.
pub(crate) fn dispatcher_loop(
    queue: MessageQueue,
    mut shutdown: ShutdownListener,
    trigger: ShutdownTrigger,
    ready_keys: Vec<String>,
    tx: mpsc::Sender<ActiveMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let lease_ms = queue.0.config.lease_timeout.as_millis() as i64;
        let mut backoff = crate::periodic::transient_backoff(std::time::Duration::from_millis(50));

        loop {
            if shutdown.shutting_down() {
                break;
            }

            match fetch_one(&queue, &ready_keys, lease_ms).await {
                Ok(Some(message)) => {
                    backoff.reset();

                    let id = message.id.clone();
                    tokio::select! {
                        biased;

                        _ = shutdown.wait() => {
                            // Leased but never handed to a worker; the
                            // reclaimer picks it up after the lease runs out.
                            queue.0.active.remove(&id);
                            break;
                        }
                        res = tx.send(message) => {
                            if res.is_err() {
                                queue.0.active.remove(&id);
                                break;
                            }
                        }
                    };
                }
                // Idle blocking-pop timeout; go around again.
                Ok(None) => {
                    backoff.reset();
                }
                // A broken invariant means the keyspace can no longer be
                // trusted; stop the whole consumer rather than churn on it.
                Err(e @ Error::InvariantViolation(_)) => {
                    event!(Level::ERROR, error = %e, "Invariant violation; starting shutdown");
                    trigger.begin();
                    break;
                }
                Err(e) => {
                    event!(Level::ERROR, error = %e, "Error fetching ready messages");
                    let sleep_time = backoff
                        .next_backoff()
                        .unwrap_or(std::time::Duration::from_secs(1));
                    tokio::select! {
                        biased;
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(sleep_time) => {}
                    };
                }
            }
        }

        // Dropping the sender closes the channel; the workers drain what
        // was already accepted and then stop.
        drop(tx);
        event!(Level::DEBUG, "Dispatcher stopped");
    })
}

/// Claim the next ready message, visiting keys in priority order. Falls
/// back to a short blocking pop across every key when nothing is
/// immediately available, so an idle consumer still reacts quickly.
async fn fetch_one(
    queue: &MessageQueue,
    ready_keys: &[String],
    lease_ms: i64,
) -> Result<Option<ActiveMessage>, Error> {
    let mut conn = queue.0.pool.get().await?;

    for key in ready_keys {
        loop {
            let now = Utc::now();
            match queue
                .0
                .scripts
                .take_ready
                .run(&queue.0.keys, &mut conn, key, &now, lease_ms)
                .await?
            {
                TakeOutcome::Empty => break,
                TakeOutcome::Orphan(id) => {
                    event!(Level::WARN, message_id = %id, ready_key = %key, "Dropped ready id without an envelope");
                }
                TakeOutcome::Claimed(fields) => {
                    return accept(queue, &mut conn, fields, &now, lease_ms).await;
                }
            }
        }
    }

    // BRPOP scans its keys left to right, so the priority-major order
    // keeps HIGH ahead of NORMAL ahead of LOW across every topic.
    let pop_timeout = queue.0.config.blocking_pop_timeout.as_secs().max(1);
    let popped: Option<(String, String)> = redis::cmd("BRPOP")
        .arg(ready_keys)
        .arg(pop_timeout)
        .query_async(&mut conn)
        .await?;

    let id = match popped {
        Some((_key, id)) => id,
        None => return Ok(None),
    };

    let now = Utc::now();
    match queue
        .0
        .scripts
        .claim_ready
        .run(&queue.0.keys, &mut conn, &id, &now, lease_ms)
        .await?
    {
        Some(fields) => accept(queue, &mut conn, fields, &now, lease_ms).await,
        None => {
            event!(Level::WARN, message_id = %id, "Popped ready id without an envelope");
            Ok(None)
        }
    }
}

/// Decode a freshly claimed envelope and register its lease locally.
/// Undecodable envelopes are dead-lettered right here; they would fail
/// identically on every future delivery.
async fn accept(
    queue: &MessageQueue,
    conn: &mut deadpool_redis::Connection,
    fields: std::collections::HashMap<String, String>,
    claimed_at: &DateTime<Utc>,
    lease_ms: i64,
) -> Result<Option<ActiveMessage>, Error> {
    let lease = claimed_at.timestamp_millis() + lease_ms;

    let failure = match Message::from_hash(fields) {
        Ok(message) => match ActiveMessage::from_message(message) {
            Some(active) => {
                queue.0.active.insert(&active.id, lease);
                return Ok(Some(active));
            }
            None => {
                return Err(Error::InvariantViolation(String::from(
                    "claimed envelope has no lease",
                )))
            }
        },
        Err(failure) => failure,
    };

    match (&failure.id, &failure.topic) {
        (Some(id), Some(topic)) => {
            event!(Level::ERROR, message_id = %id, topic = %topic, reason = %failure.reason,
                "Dead-lettering undecodable message");
            queue
                .0
                .scripts
                .dead_letter
                .run(
                    &queue.0.keys,
                    conn,
                    id,
                    topic,
                    &Utc::now(),
                    &format!("serialization_error: {}", failure.reason),
                    lease,
                    queue.0.config.dead_retention.as_millis() as i64,
                )
                .await?;
        }
        // Without an identity there is nothing to dead-letter; the
        // reclaimer will retire the id once the lease expires.
        _ => {
            event!(Level::ERROR, reason = %failure.reason, "Claimed an envelope with no identity");
        }
    }

    Ok(None)
}
