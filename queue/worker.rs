use std::{sync::Arc, time::Duration};

use chrono::Utc;
use mxrmq_graceful_shutdown::ShutdownTrigger;
use rand::Rng;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{event, Level};

use crate::{
    config::MQConfig,
    error::Error,
    handler::{HandlerError, HandlerRegistry, MessageHandler},
    retry::RetryOutcome,
    work_item::ActiveMessage,
    MessageQueue,
};

/// What a delivery came to. Decided locally, recorded by exactly one
/// terminal script call.
#[derive(Debug)]
enum Outcome {
    Ack,
    Retry(String),
    Dead(String),
}

pub(crate) fn worker_loop(
    queue: MessageQueue,
    worker_id: usize,
    registry: Arc<HandlerRegistry>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ActiveMessage>>>,
    trigger: ShutdownTrigger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            // Hold the lock only for the receive so the other workers can
            // take the next message while this one is busy.
            let message = { rx.lock().await.recv().await };
            let message = match message {
                Some(message) => message,
                // Channel closed: the dispatcher is gone and the backlog
                // is drained.
                None => break,
            };

            let id = message.id.clone();
            let topic = message.topic.clone();
            match process_message(&queue, &registry, message).await {
                Ok(()) => {}
                Err(e @ Error::InvariantViolation(_)) => {
                    event!(Level::ERROR, worker = worker_id, message_id = %id, topic = %topic,
                        error = %e, "Invariant violation; starting shutdown");
                    trigger.begin();
                    break;
                }
                Err(e) => {
                    // The message stays leased; reclamation redelivers it.
                    event!(Level::ERROR, worker = worker_id, message_id = %id, topic = %topic,
                        error = %e, "Error recording message outcome");
                }
            }
        }

        event!(Level::DEBUG, worker = worker_id, "Worker stopped");
    })
}

async fn process_message(
    queue: &MessageQueue,
    registry: &HandlerRegistry,
    message: ActiveMessage,
) -> Result<(), Error> {
    let outcome = if message.expired(Utc::now()) {
        // Past its deadline: dead-letter without invoking the handler.
        Outcome::Dead(String::from("expired"))
    } else {
        match registry.get(&message.topic) {
            // Retried so that a later process with the handler registered
            // can pick it up; max_retries caps the healing window.
            None => Outcome::Retry(String::from("no_handler")),
            Some(handler) => run_handler(queue, handler, &message).await,
        }
    };

    finish(queue, message, outcome).await
}

/// Run the handler in its own task so a panic is contained and an abort on
/// timeout propagates cancellation into the handler.
async fn run_handler(
    queue: &MessageQueue,
    handler: Arc<dyn MessageHandler>,
    message: &ActiveMessage,
) -> Outcome {
    let owned = message.clone();
    let mut task = AbortOnDrop(tokio::spawn(async move { handler.handle(&owned).await }));

    match tokio::time::timeout(queue.0.config.processing_timeout, &mut task.0).await {
        Err(_elapsed) => Outcome::Retry(String::from("timeout")),
        Ok(Ok(Ok(()))) => Outcome::Ack,
        Ok(Ok(Err(HandlerError::Failure(e)))) => Outcome::Retry(e.to_string()),
        Ok(Ok(Err(HandlerError::Unrecoverable(e)))) => {
            Outcome::Dead(format!("unrecoverable: {}", e))
        }
        Ok(Err(join_error)) => {
            if join_error.is_panic() {
                Outcome::Dead(format!("handler panicked: {}", join_error))
            } else {
                Outcome::Retry(String::from("handler cancelled"))
            }
        }
    }
}

async fn finish(
    queue: &MessageQueue,
    message: ActiveMessage,
    outcome: Outcome,
) -> Result<(), Error> {
    // The freshest local lease score is the ownership proof for the
    // terminal script. Removing it also stops further lease refreshes.
    let expected_lease = queue
        .0
        .active
        .remove(&message.id)
        .unwrap_or_else(|| message.lease_expires_at.timestamp_millis());

    let now = Utc::now();
    let mut conn = queue.0.pool.get().await?;
    let dead_retention_ms = queue.0.config.dead_retention.as_millis() as i64;

    match outcome {
        Outcome::Ack => {
            let acked = queue
                .0
                .scripts
                .ack
                .run(
                    &queue.0.keys,
                    &mut conn,
                    &message.id,
                    &now,
                    queue.0.config.completed_retention.as_millis() as i64,
                    expected_lease,
                )
                .await?;
            if acked {
                event!(Level::DEBUG, message_id = %message.id, topic = %message.topic, "Message completed");
            } else {
                event!(Level::WARN, message_id = %message.id, topic = %message.topic,
                    "Lease lost before ack; the message will be delivered again");
            }
        }
        Outcome::Retry(reason) => {
            let backoff = retry_backoff(&queue.0.config, message.attempts);
            let outcome = queue
                .0
                .scripts
                .retry
                .run(
                    &queue.0.keys,
                    &mut conn,
                    &message.id,
                    &message.topic,
                    &now,
                    backoff.as_millis() as i64,
                    &reason,
                    expected_lease,
                    dead_retention_ms,
                )
                .await?;
            match outcome {
                RetryOutcome::Retried => {
                    event!(Level::INFO, message_id = %message.id, topic = %message.topic,
                        attempt = %(message.attempts + 1), backoff_ms = %backoff.as_millis(),
                        reason = %reason, "Message scheduled for retry");
                }
                RetryOutcome::Dead => {
                    event!(Level::WARN, message_id = %message.id, topic = %message.topic,
                        reason = %reason, "Message moved to dead letters");
                }
                RetryOutcome::Lost => {
                    event!(Level::WARN, message_id = %message.id, topic = %message.topic,
                        "Lease lost before retry");
                }
            }
        }
        Outcome::Dead(reason) => {
            let dead = queue
                .0
                .scripts
                .dead_letter
                .run(
                    &queue.0.keys,
                    &mut conn,
                    &message.id,
                    &message.topic,
                    &now,
                    &reason,
                    expected_lease,
                    dead_retention_ms,
                )
                .await?;
            if dead {
                event!(Level::WARN, message_id = %message.id, topic = %message.topic,
                    reason = %reason, "Message moved to dead letters");
            } else {
                event!(Level::WARN, message_id = %message.id, topic = %message.topic,
                    "Lease lost before dead-letter");
            }
        }
    }

    Ok(())
}

/// Exponential backoff for a delivery that failed on `attempts` prior
/// tries: `base * 2^attempts`, capped, with ±10% jitter.
pub(crate) fn retry_backoff(config: &MQConfig, attempts: u32) -> Duration {
    let base = config.retry_base_backoff.as_millis() as u64;
    let cap = config.retry_max_backoff.as_millis() as u64;
    let exp = attempts.min(20);
    let capped = base.saturating_mul(1u64 << exp).min(cap);

    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_millis((capped as f64 * jitter) as u64)
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_follows_the_exponential_schedule() {
        let config = MQConfig::default();
        let base = config.retry_base_backoff.as_millis() as f64;

        for attempts in 0..6u32 {
            let expected = base * f64::from(1u32 << attempts);
            let actual = retry_backoff(&config, attempts).as_millis() as f64;
            assert!(
                actual >= expected * 0.9 - 1.0 && actual <= expected * 1.1 + 1.0,
                "attempts={}: {} outside jitter window around {}",
                attempts,
                actual,
                expected
            );
        }
    }

    #[test]
    fn backoff_caps_at_the_max() {
        let config = MQConfig::default();
        let cap = config.retry_max_backoff.as_millis() as f64;

        for attempts in [10u32, 20, 25, u32::MAX].iter() {
            let actual = retry_backoff(&config, *attempts).as_millis() as f64;
            assert!(actual <= cap * 1.1 + 1.0, "attempts={}: {} above cap", attempts, actual);
            assert!(actual >= cap * 0.9 - 1.0, "attempts={}: {} below capped window", attempts, actual);
        }
    }
}
