pub mod config;
pub mod handler;
pub mod message;
pub mod work_item;

mod ack;
mod dead_letter;
mod dispatcher;
mod enqueue;
mod error;
mod evict;
mod extend_lease;
mod lease_monitor;
mod message_data;
mod periodic;
mod promote;
mod reclaim;
mod retry;
mod take_ready;
mod worker;

pub use self::{
    config::MQConfig,
    error::*,
    handler::{HandlerError, MessageHandler},
    message::{Message, MessagePriority, MessageState, NewMessage},
    work_item::ActiveMessage,
};
pub use mxrmq_storage::RedisPool;

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use itertools::Itertools;
use mxrmq_graceful_shutdown::Shutdown;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{event, Level};

use self::{
    ack::AckScript,
    dead_letter::DeadLetterScript,
    enqueue::{EnqueueScript, Placement},
    evict::EvictScript,
    extend_lease::ExtendLeaseScript,
    handler::{FnHandler, HandlerRegistry},
    promote::PromoteScript,
    reclaim::ReclaimScript,
    retry::RetryScript,
    take_ready::{ClaimReadyScript, TakeReadyScript},
    work_item::ActiveTasks,
};

/// Redis key layout under `<queue_prefix>:`. These keys are the persisted
/// contract; companion tooling may read them directly.
pub(crate) struct QueueKeys {
    pub prefix: String,
    pub delayed: String,
    pub inflight: String,
    pub retention: String,
    pub topics: String,
    pub stats: String,
    pub payload_prefix: String,
}

impl QueueKeys {
    fn new(prefix: &str) -> QueueKeys {
        QueueKeys {
            prefix: prefix.to_string(),
            delayed: format!("{}:delayed", prefix),
            inflight: format!("{}:inflight", prefix),
            retention: format!("{}:retention", prefix),
            topics: format!("{}:topics", prefix),
            stats: format!("{}:stats", prefix),
            payload_prefix: format!("{}:payload:", prefix),
        }
    }

    pub fn payload(&self, id: &str) -> String {
        format!("{}{}", self.payload_prefix, id)
    }

    pub fn ready(&self, topic: &str, priority: MessagePriority) -> String {
        format!("{}:ready:{}:{}", self.prefix, topic, priority.as_str())
    }

    pub fn dead(&self, topic: &str) -> String {
        format!("{}:dead:{}", self.prefix, topic)
    }
}

pub(crate) struct Scripts {
    pub enqueue: EnqueueScript,
    pub take_ready: TakeReadyScript,
    pub claim_ready: ClaimReadyScript,
    pub ack: AckScript,
    pub retry: RetryScript,
    pub dead_letter: DeadLetterScript,
    pub extend_lease: ExtendLeaseScript,
    pub promote: PromoteScript,
    pub reclaim: ReclaimScript,
    pub evict: EvictScript,
}

impl Scripts {
    fn new() -> Scripts {
        Scripts {
            enqueue: EnqueueScript::new(),
            take_ready: TakeReadyScript::new(),
            claim_ready: ClaimReadyScript::new(),
            ack: AckScript::new(),
            retry: RetryScript::new(),
            dead_letter: DeadLetterScript::new(),
            extend_lease: ExtendLeaseScript::new(),
            promote: PromoteScript::new(),
            reclaim: ReclaimScript::new(),
            evict: EvictScript::new(),
        }
    }

    /// (name, source, sha) for every script, for preloading and the health
    /// check.
    fn catalog(&self) -> Vec<(&'static str, &'static str, String)> {
        vec![
            ("enqueue", self.enqueue.source(), self.enqueue.hash().to_string()),
            ("take_ready", self.take_ready.source(), self.take_ready.hash().to_string()),
            ("claim_ready", self.claim_ready.source(), self.claim_ready.hash().to_string()),
            ("ack", self.ack.source(), self.ack.hash().to_string()),
            ("retry", self.retry.source(), self.retry.hash().to_string()),
            ("dead_letter", self.dead_letter.source(), self.dead_letter.hash().to_string()),
            ("extend_lease", self.extend_lease.source(), self.extend_lease.hash().to_string()),
            ("promote", self.promote.source(), self.promote.hash().to_string()),
            ("reclaim", self.reclaim.source(), self.reclaim.hash().to_string()),
            ("evict", self.evict.source(), self.evict.hash().to_string()),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Initialized,
    Running,
    Stopped,
}

struct RunningTasks {
    shutdown: Shutdown,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    monitors: Vec<(&'static str, JoinHandle<()>)>,
}

pub(crate) struct QueueInner {
    pool: RedisPool,
    config: MQConfig,
    keys: QueueKeys,
    scripts: Scripts,
    active: ActiveTasks,
    state: Mutex<LifecycleState>,
    handlers: Mutex<HandlerRegistry>,
    running: Mutex<Option<RunningTasks>>,
}

/// A Redis-backed message queue handle. Cheap to clone; every clone shares
/// the same pool, registry, and background tasks.
pub struct MessageQueue(Arc<QueueInner>);

impl Clone for MessageQueue {
    fn clone(&self) -> MessageQueue {
        MessageQueue(self.0.clone())
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("prefix", &self.0.keys.prefix)
            .field("state", &*self.0.state.lock().unwrap())
            .field("max_workers", &self.0.config.max_workers)
            .field("task_queue_size", &self.0.config.task_queue_size)
            .finish()
    }
}

/// Redis-side and local counters for one queue namespace.
#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub state: LifecycleState,
    /// Messages leased by this process right now.
    pub active_tasks: usize,
    /// Liveness of every background task, by name.
    pub loops: BTreeMap<String, bool>,
    pub delayed: usize,
    pub inflight: usize,
    pub retention: usize,
    /// Ready depth per topic, summed over priorities.
    pub ready: BTreeMap<String, usize>,
    /// Dead-letter depth per topic.
    pub dead: BTreeMap<String, usize>,
    pub counters: QueueCounters,
}

#[derive(Debug, Default, Serialize)]
pub struct QueueCounters {
    pub enqueued: usize,
    pub delayed: usize,
    pub promoted: usize,
    pub completed: usize,
    pub retried: usize,
    pub reclaimed: usize,
    pub dead: usize,
    pub evicted: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub checks: BTreeMap<String, bool>,
}

impl MessageQueue {
    pub fn new(config: MQConfig) -> Result<MessageQueue, Error> {
        config.validate()?;
        let pool = RedisPool::new(
            config.redis_url.clone(),
            Some(config.pool_size()),
            Some(config.connect_timeout),
        )?;
        Ok(MessageQueue::with_pool(config, pool))
    }

    /// Build a queue on an existing pool, for processes that share one
    /// pool between several queue namespaces.
    pub fn with_pool(config: MQConfig, pool: RedisPool) -> MessageQueue {
        let keys = QueueKeys::new(&config.queue_prefix);
        MessageQueue(Arc::new(QueueInner {
            pool,
            keys,
            scripts: Scripts::new(),
            active: ActiveTasks::default(),
            state: Mutex::new(LifecycleState::Created),
            handlers: Mutex::new(HandlerRegistry::default()),
            running: Mutex::new(None),
            config,
        }))
    }

    pub fn is_running(&self) -> bool {
        *self.0.state.lock().unwrap() == LifecycleState::Running
    }

    /// Register a handler for a topic. Registration closes when the queue
    /// starts; the registry is published to the workers as an immutable
    /// snapshot.
    pub fn register(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), Error> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(Error::EmptyTopic);
        }
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }

        let mut handlers = self.0.handlers.lock().unwrap();
        if handlers.insert(topic.clone(), handler) {
            Ok(())
        } else {
            Err(Error::ConfigError(format!(
                "topic {} already has a handler",
                topic
            )))
        }
    }

    pub fn register_fn<F, Fut>(&self, topic: impl Into<String>, handler: F) -> Result<(), Error>
    where
        F: Fn(ActiveMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(topic, Arc::new(FnHandler(handler)))
    }

    /// Verify the connection, preload every script, and record the
    /// registered topics. Idempotent; `start_background` calls it.
    pub async fn initialize(&self) -> Result<(), Error> {
        let mut conn = self.0.pool.get().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;

        for (name, source, sha) in self.0.scripts.catalog() {
            let loaded: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(source)
                .query_async(&mut conn)
                .await?;
            if loaded != sha {
                return Err(Error::InvariantViolation(format!(
                    "script {} loaded as {} but hashed locally as {}",
                    name, loaded, sha
                )));
            }
        }

        let topics = self.0.handlers.lock().unwrap().topics();
        if !topics.is_empty() {
            redis::cmd("SADD")
                .arg(&self.0.keys.topics)
                .arg(topics)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }

        let mut state = self.0.state.lock().unwrap();
        if *state == LifecycleState::Created {
            *state = LifecycleState::Initialized;
        }

        Ok(())
    }

    /// Launch the dispatcher, the worker pool, and the maintenance loops.
    /// Returns once everything is running; messages flow until `stop`.
    pub async fn start_background(&self) -> Result<(), Error> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }

        let registry = {
            let handlers = self.0.handlers.lock().unwrap();
            if handlers.is_empty() {
                return Err(Error::NoHandlers);
            }
            Arc::new(handlers.clone())
        };

        self.initialize().await?;

        let topics = registry.topics();
        // Priority-major order: BRPOP scans keys left to right, which is
        // what gives HIGH precedence over NORMAL over LOW.
        let mut ready_keys = Vec::with_capacity(topics.len() * MessagePriority::ALL.len());
        for priority in MessagePriority::ALL.iter() {
            for topic in &topics {
                ready_keys.push(self.0.keys.ready(topic, *priority));
            }
        }

        let mut running = self.0.running.lock().unwrap();
        if running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let shutdown = Shutdown::new();
        let (tx, rx) = mpsc::channel(self.0.config.task_queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let dispatcher = dispatcher::dispatcher_loop(
            self.clone(),
            shutdown.listener(),
            shutdown.trigger(),
            ready_keys,
            tx,
        );

        let workers = (0..self.0.config.max_workers)
            .map(|worker_id| {
                worker::worker_loop(
                    self.clone(),
                    worker_id,
                    registry.clone(),
                    rx.clone(),
                    shutdown.trigger(),
                )
            })
            .collect::<Vec<_>>();

        let mut monitors: Vec<(&'static str, JoinHandle<()>)> = Vec::with_capacity(4);
        monitors.push((
            "lease_monitor",
            lease_monitor::lease_monitor_loop(self.clone(), shutdown.listener()),
        ));
        monitors.push(("promoter", {
            let queue = self.clone();
            periodic::spawn_periodic(
                "promoter",
                self.0.config.promote_interval,
                shutdown.listener(),
                move || {
                    let queue = queue.clone();
                    async move { queue.promote_due().await }
                },
            )
        }));
        monitors.push(("reclaimer", {
            let queue = self.clone();
            periodic::spawn_periodic(
                "reclaimer",
                self.0.config.reclaim_interval,
                shutdown.listener(),
                move || {
                    let queue = queue.clone();
                    async move { queue.reclaim_expired().await }
                },
            )
        }));
        monitors.push(("sweeper", {
            let queue = self.clone();
            periodic::spawn_periodic(
                "sweeper",
                self.0.config.gc_interval,
                shutdown.listener(),
                move || {
                    let queue = queue.clone();
                    async move { queue.evict_retained().await }
                },
            )
        }));

        *running = Some(RunningTasks {
            shutdown,
            dispatcher,
            workers,
            monitors,
        });
        drop(running);

        *self.0.state.lock().unwrap() = LifecycleState::Running;
        event!(Level::INFO, topics = ?topics, workers = %self.0.config.max_workers, "Queue started");

        Ok(())
    }

    /// Two-phase drain: the dispatcher stops fetching and closes the task
    /// channel, the workers finish what was already accepted, and anything
    /// still leased when `shutdown_timeout` runs out is left for
    /// reclamation.
    pub async fn stop(&self) -> Result<(), Error> {
        let running = self.0.running.lock().unwrap().take();
        let mut running = match running {
            Some(running) => running,
            None => return Ok(()),
        };

        event!(Level::INFO, "Stopping queue");
        running.shutdown.begin();

        let drained = tokio::time::timeout(self.0.config.shutdown_timeout, async {
            let _ = (&mut running.dispatcher).await;
            futures::future::join_all(running.workers.iter_mut()).await;
            futures::future::join_all(
                running.monitors.iter_mut().map(|(_name, handle)| handle),
            )
            .await;
        })
        .await;

        if drained.is_err() {
            event!(
                Level::WARN,
                timeout_ms = %self.0.config.shutdown_timeout.as_millis(),
                "Shutdown timed out; aborting remaining tasks"
            );
            running.dispatcher.abort();
            for worker in &running.workers {
                worker.abort();
            }
            for (_name, handle) in &running.monitors {
                handle.abort();
            }
        }

        // Whatever is still tracked locally was cut off mid-flight; its
        // lease must be allowed to expire so reclamation can requeue it.
        self.0.active.clear();

        *self.0.state.lock().unwrap() = LifecycleState::Stopped;
        event!(Level::INFO, "Queue stopped");
        Ok(())
    }

    /// Stop if running, then release the connection pool.
    pub async fn cleanup(&self) -> Result<(), Error> {
        self.stop().await?;
        self.0.pool.close();
        Ok(())
    }

    /// Start, serve for `duration` (or until an interrupt signal), then
    /// stop. Convenience for simple deployments.
    pub async fn run(&self, duration: Duration) -> Result<(), Error> {
        self.start_background().await?;

        let listener = {
            let running = self.0.running.lock().unwrap();
            running.as_ref().map(|r| r.shutdown.listener())
        };
        match listener {
            Some(mut listener) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {},
                    _ = listener.wait() => {},
                };
            }
            None => tokio::time::sleep(duration).await,
        }

        self.stop().await
    }

    /// Scoped lifetime: build the queue, run `f` with it, and always stop
    /// and release connections afterwards, even when `f` fails.
    pub async fn scoped<F, Fut, R>(config: MQConfig, f: F) -> Result<R, Error>
    where
        F: FnOnce(MessageQueue) -> Fut,
        Fut: Future<Output = Result<R, Error>>,
    {
        let queue = MessageQueue::new(config)?;
        queue.initialize().await?;

        let result = f(queue.clone()).await;
        let released = queue.cleanup().await;

        let value = result?;
        released?;
        Ok(value)
    }

    /// Enqueue one message and return its assigned id.
    pub async fn produce(&self, message: &NewMessage) -> Result<String, Error> {
        if message.topic.is_empty() {
            return Err(Error::EmptyTopic);
        }

        let mut conn = self.0.pool.get().await?;
        self.produce_with_conn(&mut conn, message).await
    }

    /// Enqueue a batch over a single connection. Not atomic as a group:
    /// on error, the messages before the failure stand.
    pub async fn produce_many(&self, messages: &[NewMessage]) -> Result<Vec<String>, Error> {
        if messages.iter().any(|m| m.topic.is_empty()) {
            return Err(Error::EmptyTopic);
        }

        let mut conn = self.0.pool.get().await?;
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(self.produce_with_conn(&mut conn, message).await?);
        }
        Ok(ids)
    }

    async fn produce_with_conn(
        &self,
        conn: &mut deadpool_redis::Connection,
        message: &NewMessage,
    ) -> Result<String, Error> {
        let id = message::generate_id();
        let now = Utc::now();
        let delay = chrono::Duration::from_std(message.delay)
            .map_err(|_| Error::ConfigError(String::from("delay out of range")))?;
        let scheduled_at = now + delay;
        let payload = serde_json::to_string(&message.payload)?;
        let max_retries = message.max_retries.unwrap_or(self.0.config.max_retries);

        let placement = self
            .0
            .scripts
            .enqueue
            .run(
                &self.0.keys,
                conn,
                &id,
                &message.topic,
                message.priority,
                &payload,
                &now,
                &scheduled_at,
                message.expire_at.as_ref(),
                max_retries,
                &now,
            )
            .await?;

        match placement {
            Placement::Queued => {
                event!(Level::DEBUG, message_id = %id, topic = %message.topic, "Message queued");
            }
            Placement::Delayed => {
                event!(Level::DEBUG, message_id = %id, topic = %message.topic,
                    scheduled_at = %scheduled_at.timestamp_millis(), "Message delayed");
            }
            Placement::Duplicate => {
                return Err(Error::InvariantViolation(format!(
                    "generated id {} already exists",
                    id
                )));
            }
        }

        Ok(id)
    }

    /// Move due delayed messages to their ready lists. Runs periodically in
    /// the background; callable directly for tests and operational tooling.
    pub async fn promote_due(&self) -> Result<usize, Error> {
        let mut conn = self.0.pool.get().await?;
        self.0
            .scripts
            .promote
            .run(
                &self.0.keys,
                &mut conn,
                &Utc::now(),
                self.0.config.promote_batch,
            )
            .await
    }

    /// Requeue or dead-letter every in-flight message whose lease expired.
    pub async fn reclaim_expired(&self) -> Result<usize, Error> {
        let mut conn = self.0.pool.get().await?;
        let (retried, dead) = self
            .0
            .scripts
            .reclaim
            .run(
                &self.0.keys,
                &mut conn,
                &Utc::now(),
                self.0.config.reclaim_batch,
                self.0.config.retry_base_backoff.as_millis() as i64,
                self.0.config.retry_max_backoff.as_millis() as i64,
                self.0.config.dead_retention.as_millis() as i64,
            )
            .await?;

        if dead > 0 {
            event!(Level::WARN, count = %dead, "Reclaimed messages moved to dead letters");
        }

        Ok(retried + dead)
    }

    /// Delete payloads whose retention window has passed.
    pub async fn evict_retained(&self) -> Result<usize, Error> {
        let mut conn = self.0.pool.get().await?;
        self.0
            .scripts
            .evict
            .run(&self.0.keys, &mut conn, &Utc::now(), self.0.config.gc_batch)
            .await
    }

    /// Fetch the current envelope for a message, if its payload still
    /// exists.
    pub async fn message_info(&self, id: &str) -> Result<Option<Message>, Error> {
        let mut conn = self.0.pool.get().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.0.keys.payload(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        Message::from_hash(fields).map(Some).map_err(Error::from)
    }

    pub async fn list_delayed(&self) -> Result<Vec<(String, DateTime<Utc>)>, Error> {
        self.list_zset(&self.0.keys.delayed).await
    }

    pub async fn list_inflight(&self) -> Result<Vec<(String, DateTime<Utc>)>, Error> {
        self.list_zset(&self.0.keys.inflight).await
    }

    pub async fn list_retention(&self) -> Result<Vec<(String, DateTime<Utc>)>, Error> {
        self.list_zset(&self.0.keys.retention).await
    }

    async fn list_zset(&self, key: &str) -> Result<Vec<(String, DateTime<Utc>)>, Error> {
        let list: Vec<String> = self.0.pool.get().await?.zrange_withscores(key, 0, -1).await?;

        list.into_iter()
            .tuples::<(_, _)>()
            .map(|(id, score)| Ok((id, Utc.timestamp_millis(score.parse::<i64>()?))))
            .collect::<Result<Vec<_>, Error>>()
    }

    /// The newest `limit` dead letters for a topic, for operator
    /// inspection.
    pub async fn dead_letters(&self, topic: &str, limit: usize) -> Result<Vec<Message>, Error> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.0.pool.get().await?;
        let ids: Vec<String> = conn
            .lrange(self.0.keys.dead(topic), 0, limit as isize - 1)
            .await?;

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let fields: HashMap<String, String> = conn.hgetall(self.0.keys.payload(&id)).await?;
            if fields.is_empty() {
                continue;
            }
            match Message::from_hash(fields) {
                Ok(message) => messages.push(message),
                Err(failure) => {
                    event!(Level::WARN, message_id = %id, reason = %failure.reason,
                        "Skipping undecodable dead letter");
                }
            }
        }

        Ok(messages)
    }

    pub async fn status(&self) -> Result<QueueStatus, Error> {
        let (state, active_tasks, loops) = {
            let state = *self.0.state.lock().unwrap();
            let running = self.0.running.lock().unwrap();
            let loops = running
                .as_ref()
                .map(|r| {
                    let mut map = BTreeMap::new();
                    map.insert(String::from("dispatcher"), !r.dispatcher.is_finished());
                    for (i, worker) in r.workers.iter().enumerate() {
                        map.insert(format!("worker-{}", i), !worker.is_finished());
                    }
                    for (name, handle) in &r.monitors {
                        map.insert((*name).to_string(), !handle.is_finished());
                    }
                    map
                })
                .unwrap_or_default();
            (state, self.0.active.len(), loops)
        };

        let mut conn = self.0.pool.get().await?;
        let (
            delayed,
            inflight,
            retention,
            topics,
            (enqueued, delayed_total, promoted, completed, retried, reclaimed, dead_total, evicted),
        ): (
            usize,
            usize,
            usize,
            Vec<String>,
            (
                Option<usize>,
                Option<usize>,
                Option<usize>,
                Option<usize>,
                Option<usize>,
                Option<usize>,
                Option<usize>,
                Option<usize>,
            ),
        ) = redis::Pipeline::with_capacity(5)
            .cmd("ZCARD")
            .arg(&self.0.keys.delayed)
            .cmd("ZCARD")
            .arg(&self.0.keys.inflight)
            .cmd("ZCARD")
            .arg(&self.0.keys.retention)
            .cmd("SMEMBERS")
            .arg(&self.0.keys.topics)
            .cmd("HMGET")
            .arg(&self.0.keys.stats)
            .arg(&[
                "enqueued",
                "delayed",
                "promoted",
                "completed",
                "retried",
                "reclaimed",
                "dead",
                "evicted",
            ])
            .query_async(&mut conn)
            .await?;

        let mut ready = BTreeMap::new();
        let mut dead = BTreeMap::new();
        if !topics.is_empty() {
            let mut pipe = redis::Pipeline::with_capacity(topics.len() * 4);
            for topic in &topics {
                for priority in MessagePriority::ALL.iter() {
                    pipe.cmd("LLEN").arg(self.0.keys.ready(topic, *priority));
                }
                pipe.cmd("LLEN").arg(self.0.keys.dead(topic));
            }
            let counts: Vec<usize> = pipe.query_async(&mut conn).await?;
            for (topic, chunk) in topics.iter().zip(counts.chunks(4)) {
                ready.insert(topic.clone(), chunk[..3].iter().sum());
                dead.insert(topic.clone(), chunk[3]);
            }
        }

        Ok(QueueStatus {
            state,
            active_tasks,
            loops,
            delayed,
            inflight,
            retention,
            ready,
            dead,
            counters: QueueCounters {
                enqueued: enqueued.unwrap_or(0),
                delayed: delayed_total.unwrap_or(0),
                promoted: promoted.unwrap_or(0),
                completed: completed.unwrap_or(0),
                retried: retried.unwrap_or(0),
                reclaimed: reclaimed.unwrap_or(0),
                dead: dead_total.unwrap_or(0),
                evicted: evicted.unwrap_or(0),
            },
        })
    }

    /// PING plus a presence check for every cached script SHA.
    pub async fn health_check(&self) -> HealthReport {
        let mut checks = BTreeMap::new();

        match self.probe().await {
            Ok(script_checks) => {
                checks.insert(String::from("redis"), true);
                checks.extend(script_checks);
            }
            Err(e) => {
                event!(Level::WARN, error = %e, "Health check failed");
                checks.insert(String::from("redis"), false);
            }
        }

        let healthy = checks.values().all(|ok| *ok);
        HealthReport { healthy, checks }
    }

    async fn probe(&self) -> Result<BTreeMap<String, bool>, Error> {
        let mut conn = self.0.pool.get().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;

        let catalog = self.0.scripts.catalog();
        let mut cmd = redis::cmd("SCRIPT");
        cmd.arg("EXISTS");
        for (_name, _source, sha) in &catalog {
            cmd.arg(sha);
        }
        let present: Vec<bool> = cmd.query_async(&mut conn).await?;

        Ok(catalog
            .iter()
            .zip(present)
            .map(|((name, _source, _sha), ok)| (format!("script:{}", name), ok))
            .collect())
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::json;

    struct NoopHandler;

    #[async_trait]
    impl MessageHandler for NoopHandler {
        async fn handle(&self, _message: &ActiveMessage) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn local_queue() -> MessageQueue {
        // Pool construction performs no I/O, so control-plane rules can be
        // checked without a Redis server.
        MessageQueue::new(MQConfig::default()).expect("Creating queue")
    }

    #[test]
    fn key_layout() {
        let keys = QueueKeys::new("mxrmq");
        assert_eq!(keys.delayed, "mxrmq:delayed");
        assert_eq!(keys.inflight, "mxrmq:inflight");
        assert_eq!(keys.retention, "mxrmq:retention");
        assert_eq!(keys.topics, "mxrmq:topics");
        assert_eq!(keys.payload("abc"), "mxrmq:payload:abc");
        assert_eq!(keys.ready("t", MessagePriority::High), "mxrmq:ready:t:HIGH");
        assert_eq!(keys.dead("t"), "mxrmq:dead:t");
    }

    #[tokio::test]
    async fn registration_rules() {
        let queue = local_queue();

        queue
            .register("orders", Arc::new(NoopHandler))
            .expect("first registration");

        let duplicate = queue.register("orders", Arc::new(NoopHandler));
        assert_matches!(duplicate, Err(Error::ConfigError(_)));

        let empty = queue.register("", Arc::new(NoopHandler));
        assert_matches!(empty, Err(Error::EmptyTopic));
    }

    #[tokio::test]
    async fn produce_rejects_empty_topic() {
        let queue = local_queue();
        let result = queue.produce(&NewMessage::new("", json!(1))).await;
        assert_matches!(result, Err(Error::EmptyTopic));
    }

    #[tokio::test]
    async fn start_requires_handlers() {
        let queue = local_queue();
        let result = queue.start_background().await;
        assert_matches!(result, Err(Error::NoHandlers));
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let queue = local_queue();
        queue.stop().await.expect("stop on idle queue");
    }
}

#[cfg(all(test, feature = "test_redis"))]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

    fn unique_prefix() -> String {
        format!("mxrmq-test-{}", message::generate_id())
    }

    fn test_config(prefix: &str) -> MQConfig {
        MQConfig {
            queue_prefix: prefix.to_string(),
            promote_interval: Duration::from_millis(100),
            reclaim_interval: Duration::from_millis(200),
            gc_interval: Duration::from_millis(500),
            retry_base_backoff: Duration::from_millis(50),
            retry_max_backoff: Duration::from_millis(400),
            lease_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
            ..MQConfig::default()
        }
    }

    async fn run_queue_test<T, Fut, E>(config: MQConfig, test: T)
    where
        T: Send + Sync + FnOnce(MessageQueue) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Debug,
    {
        dotenv::dotenv().ok();
        let prefix = config.queue_prefix.clone();
        let queue = MessageQueue::new(config).expect("Creating queue");

        let result = std::panic::AssertUnwindSafe(test(queue.clone()))
            .catch_unwind()
            .await;

        queue.stop().await.expect("Stopping queue");

        // Clean up the test keys.
        let mut conn = queue
            .0
            .pool
            .get()
            .await
            .expect("Cleanup: Acquiring connection");

        let key_pattern = format!("{}:*", prefix);
        let mut cmd = redis::cmd("SCAN");
        let mut iter: redis::AsyncIter<String> = cmd
            .cursor_arg(0)
            .arg("MATCH")
            .arg(&key_pattern)
            .arg("COUNT")
            .arg(100)
            .clone()
            .iter_async(&mut *conn)
            .await
            .expect("Cleanup: Scanning keyspace");

        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        drop(iter);

        if !keys.is_empty() {
            let mut del_cmd = redis::cmd("DEL");
            for key in &keys {
                del_cmd.arg(key);
            }
            del_cmd
                .query_async::<_, ()>(&mut conn)
                .await
                .expect("Cleanup: deleting keys");
        }

        // Unwrap the results from catch_unwind and the test itself.
        result.expect("Panicked").expect("Error");
    }

    async fn wait_for_state(
        queue: &MessageQueue,
        id: &str,
        state: MessageState,
        deadline: Duration,
    ) -> Message {
        let timeout_at = tokio::time::Instant::now() + deadline;
        loop {
            if let Some(message) = queue.message_info(id).await.expect("Fetching message") {
                if message.state == state {
                    return message;
                }
            }
            if tokio::time::Instant::now() > timeout_at {
                panic!("message {} never reached {:?}", id, state.as_str());
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn produce_consume_ack_round_trip() {
        run_queue_test(test_config(&unique_prefix()), |queue| async move {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let tx = Mutex::new(Some(tx));
            queue.register_fn("t", move |message: ActiveMessage| {
                let sender = tx.lock().unwrap().take();
                async move {
                    if let Some(sender) = sender {
                        sender.send(message.payload.clone()).ok();
                    }
                    Ok(())
                }
            })?;

            queue.start_background().await?;
            assert!(queue.is_running());

            let id = queue.produce(&NewMessage::new("t", json!({"n": 1}))).await?;

            let seen = tokio::time::timeout(Duration::from_secs(10), rx)
                .await
                .expect("Waiting for handler")
                .expect("Handler dropped the channel");
            assert_eq!(seen, json!({"n": 1}), "payload survives the round trip");

            let message = wait_for_state(&queue, &id, MessageState::Completed, Duration::from_secs(5)).await;
            assert_eq!(message.attempts, 0, "a clean run consumes no attempts");

            // Completed messages sit in the retention window.
            let retained = queue.list_retention().await?;
            assert!(retained.iter().any(|(rid, _at)| rid == &id));
            assert!(queue.list_inflight().await?.is_empty());

            let status = queue.status().await?;
            assert_eq!(status.counters.completed, 1);
            assert_eq!(status.ready.get("t"), Some(&0));

            queue.stop().await?;
            Ok::<(), Error>(())
        })
        .await;
    }

    #[tokio::test]
    async fn delayed_message_promotes_on_schedule() {
        run_queue_test(test_config(&unique_prefix()), |queue| async move {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let tx = Mutex::new(Some(tx));
            queue.register_fn("t", move |_message: ActiveMessage| {
                let sender = tx.lock().unwrap().take();
                async move {
                    if let Some(sender) = sender {
                        sender.send(Utc::now()).ok();
                    }
                    Ok(())
                }
            })?;

            queue.start_background().await?;

            let not_before = Utc::now() + chrono::Duration::milliseconds(300);
            let id = queue
                .produce(&NewMessage {
                    delay: Duration::from_millis(300),
                    ..NewMessage::new("t", json!({"kind": "reminder"}))
                })
                .await?;

            // Still parked in the delayed zset.
            let delayed = queue.list_delayed().await?;
            assert_eq!(delayed.len(), 1);
            assert_eq!(delayed[0].0, id);

            let handled_at = tokio::time::timeout(Duration::from_secs(10), rx)
                .await
                .expect("Waiting for handler")
                .expect("Handler dropped the channel");
            assert!(
                handled_at >= not_before,
                "ran at {} before schedule {}",
                handled_at,
                not_before
            );

            queue.stop().await?;
            Ok::<(), Error>(())
        })
        .await;
    }

    #[tokio::test]
    async fn failing_handler_exhausts_retries_into_dead_letters() {
        run_queue_test(test_config(&unique_prefix()), |queue| async move {
            let invocations = Arc::new(AtomicU32::new(0));
            let counter = invocations.clone();
            queue.register_fn("t", move |_message: ActiveMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(HandlerError::from(anyhow::anyhow!("boom"))) }
            })?;

            queue.start_background().await?;
            let id = queue.produce(&NewMessage::new("t", json!({"n": 2}))).await?;

            let message = wait_for_state(&queue, &id, MessageState::Dead, Duration::from_secs(20)).await;
            assert_eq!(message.attempts, 4, "max_retries + 1 attempts");
            assert!(message.last_error.expect("last_error set").contains("boom"));
            assert_eq!(invocations.load(Ordering::SeqCst), 4);

            let dead = queue.dead_letters("t", 10).await?;
            assert_eq!(dead.len(), 1);
            assert_eq!(dead[0].id, id);

            queue.stop().await?;
            Ok::<(), Error>(())
        })
        .await;
    }

    #[tokio::test]
    async fn backpressure_still_delivers_everything() {
        let config = MQConfig {
            task_queue_size: 5,
            max_workers: 2,
            ..test_config(&unique_prefix())
        };
        run_queue_test(config, |queue| async move {
            let handled = Arc::new(AtomicU32::new(0));
            let counter = handled.clone();
            queue.register_fn("t", move |_message: ActiveMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    Ok(())
                }
            })?;

            let messages = (0..100)
                .map(|n| NewMessage::new("t", json!({"n": n})))
                .collect::<Vec<_>>();
            queue.produce_many(&messages).await?;

            queue.start_background().await?;

            let timeout_at = tokio::time::Instant::now() + Duration::from_secs(30);
            loop {
                let status = queue.status().await?;
                if status.counters.completed >= 100 {
                    break;
                }
                if tokio::time::Instant::now() > timeout_at {
                    panic!("only {} of 100 completed", status.counters.completed);
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            assert_eq!(handled.load(Ordering::SeqCst), 100);

            queue.stop().await?;
            Ok::<(), Error>(())
        })
        .await;
    }

    #[tokio::test]
    async fn high_priority_delivered_first() {
        let config = MQConfig {
            max_workers: 1,
            ..test_config(&unique_prefix())
        };
        run_queue_test(config, |queue| async move {
            let order = Arc::new(Mutex::new(Vec::new()));
            let seen = order.clone();
            queue.register_fn("t", move |message: ActiveMessage| {
                seen.lock().unwrap().push(message.priority);
                async move { Ok(()) }
            })?;

            // Low enqueued first; High must still come out ahead.
            queue
                .produce(&NewMessage {
                    priority: MessagePriority::Low,
                    ..NewMessage::new("t", json!("low"))
                })
                .await?;
            queue
                .produce(&NewMessage {
                    priority: MessagePriority::High,
                    ..NewMessage::new("t", json!("high"))
                })
                .await?;

            queue.start_background().await?;

            let timeout_at = tokio::time::Instant::now() + Duration::from_secs(10);
            while order.lock().unwrap().len() < 2 {
                if tokio::time::Instant::now() > timeout_at {
                    panic!("both messages should be handled");
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }

            let order = order.lock().unwrap();
            assert_eq!(
                *order,
                vec![MessagePriority::High, MessagePriority::Low],
                "HIGH drains before LOW"
            );

            queue.stop().await?;
            Ok::<(), Error>(())
        })
        .await;
    }

    #[tokio::test]
    async fn concurrent_promotion_moves_each_message_once() {
        run_queue_test(test_config(&unique_prefix()), |queue| async move {
            let messages = (0..20)
                .map(|n| NewMessage {
                    delay: Duration::from_millis(50),
                    ..NewMessage::new("t", json!({"n": n}))
                })
                .collect::<Vec<_>>();
            queue.produce_many(&messages).await?;
            tokio::time::sleep(Duration::from_millis(100)).await;

            let (a, b) = futures::join!(queue.promote_due(), queue.promote_due());
            assert_eq!(a? + b?, 20, "every due message promoted exactly once");

            let status = queue.status().await?;
            assert_eq!(status.ready.get("t"), Some(&20), "no duplicates in ready");
            assert_eq!(status.delayed, 0);

            Ok::<(), Error>(())
        })
        .await;
    }

    #[tokio::test]
    async fn zero_delay_is_immediately_ready() {
        run_queue_test(test_config(&unique_prefix()), |queue| async move {
            let id = queue.produce(&NewMessage::new("t", json!(1))).await?;

            let message = queue.message_info(&id).await?.expect("envelope exists");
            assert_eq!(message.state, MessageState::Ready);
            assert!(queue.list_delayed().await?.is_empty());

            let status = queue.status().await?;
            assert_eq!(status.ready.get("t"), Some(&1));

            Ok::<(), Error>(())
        })
        .await;
    }

    #[tokio::test]
    async fn zero_max_retries_dies_on_first_failure() {
        run_queue_test(test_config(&unique_prefix()), |queue| async move {
            let invocations = Arc::new(AtomicU32::new(0));
            let counter = invocations.clone();
            queue.register_fn("t", move |_message: ActiveMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(HandlerError::from(anyhow::anyhow!("nope"))) }
            })?;

            queue.start_background().await?;
            let id = queue
                .produce(&NewMessage {
                    max_retries: Some(0),
                    ..NewMessage::new("t", json!(1))
                })
                .await?;

            let message = wait_for_state(&queue, &id, MessageState::Dead, Duration::from_secs(10)).await;
            assert_eq!(message.attempts, 1);
            assert_eq!(invocations.load(Ordering::SeqCst), 1);

            queue.stop().await?;
            Ok::<(), Error>(())
        })
        .await;
    }

    #[tokio::test]
    async fn expired_message_dead_letters_without_running() {
        run_queue_test(test_config(&unique_prefix()), |queue| async move {
            let invocations = Arc::new(AtomicU32::new(0));
            let counter = invocations.clone();
            queue.register_fn("t", move |_message: ActiveMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(()) }
            })?;

            queue.start_background().await?;
            let id = queue
                .produce(&NewMessage {
                    expire_at: Some(Utc::now() - chrono::Duration::seconds(1)),
                    ..NewMessage::new("t", json!(1))
                })
                .await?;

            let message = wait_for_state(&queue, &id, MessageState::Dead, Duration::from_secs(10)).await;
            assert_eq!(message.last_error.as_deref(), Some("expired"));
            assert_eq!(
                invocations.load(Ordering::SeqCst),
                0,
                "handler must not run for an expired message"
            );

            queue.stop().await?;
            Ok::<(), Error>(())
        })
        .await;
    }

    #[tokio::test]
    async fn reclaimer_requeues_an_expired_lease() {
        run_queue_test(test_config(&unique_prefix()), |queue| async move {
            let id = queue.produce(&NewMessage::new("t", json!(1))).await?;

            // Claim with a tiny lease and walk away, as a crashed consumer
            // would.
            let mut conn = queue.0.pool.get().await?;
            let ready_key = queue.0.keys.ready("t", MessagePriority::Normal);
            let outcome = queue
                .0
                .scripts
                .take_ready
                .run(&queue.0.keys, &mut conn, &ready_key, &Utc::now(), 100)
                .await?;
            assert!(matches!(outcome, take_ready::TakeOutcome::Claimed(_)));
            drop(conn);

            tokio::time::sleep(Duration::from_millis(200)).await;
            let reclaimed = queue.reclaim_expired().await?;
            assert_eq!(reclaimed, 1);

            let message = queue.message_info(&id).await?.expect("envelope exists");
            assert_eq!(message.state, MessageState::Delayed);
            assert_eq!(message.attempts, 1, "reclamation costs an attempt");
            assert_eq!(message.last_error.as_deref(), Some("lease_expired"));

            Ok::<(), Error>(())
        })
        .await;
    }

    #[tokio::test]
    async fn stop_leaves_no_handler_running() {
        run_queue_test(test_config(&unique_prefix()), |queue| async move {
            let in_flight = Arc::new(AtomicI64::new(0));
            let gauge = in_flight.clone();
            queue.register_fn("t", move |_message: ActiveMessage| {
                let gauge = gauge.clone();
                async move {
                    gauge.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    gauge.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })?;

            queue.start_background().await?;
            let messages = (0..5)
                .map(|n| NewMessage::new("t", json!({"n": n})))
                .collect::<Vec<_>>();
            queue.produce_many(&messages).await?;

            // Let at least one delivery begin before stopping.
            tokio::time::sleep(Duration::from_millis(250)).await;
            queue.stop().await?;

            assert!(!queue.is_running());
            assert_eq!(
                in_flight.load(Ordering::SeqCst),
                0,
                "no handler still executing after stop"
            );

            Ok::<(), Error>(())
        })
        .await;
    }

    #[tokio::test]
    async fn health_check_reports_scripts() {
        run_queue_test(test_config(&unique_prefix()), |queue| async move {
            queue.initialize().await?;

            let report = queue.health_check().await;
            assert!(report.healthy, "checks: {:?}", report.checks);
            assert_eq!(report.checks.get("redis"), Some(&true));
            assert_eq!(report.checks.get("script:enqueue"), Some(&true));
            assert_eq!(report.checks.get("script:reclaim"), Some(&true));

            Ok::<(), Error>(())
        })
        .await;
    }

    #[tokio::test]
    async fn scoped_lifetime_releases_the_pool() {
        dotenv::dotenv().ok();
        let prefix = unique_prefix();
        let config = test_config(&prefix);

        let observed = MessageQueue::scoped(config.clone(), |queue| async move {
            let id = queue.produce(&NewMessage::new("t", json!(1))).await?;
            Ok(id)
        })
        .await
        .expect("Scoped run");
        assert_eq!(observed.len(), 26);

        // Clean up with a fresh queue since the scoped pool is closed.
        run_queue_test(config, |_queue| async move { Ok::<(), Error>(()) }).await;
    }
}
