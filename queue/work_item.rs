use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use serde_json::Value;

use crate::message::{Message, MessagePriority};

/// A leased message as handed to a handler: the decoded envelope plus the
/// lease the dispatcher claimed for it.
#[derive(Debug, Clone)]
pub struct ActiveMessage {
    pub id: String,
    pub topic: String,
    pub priority: MessagePriority,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
    pub max_retries: u32,
    /// Failed deliveries so far; 0 on the first delivery.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub lease_expires_at: DateTime<Utc>,
}

impl ActiveMessage {
    /// The envelope must carry a lease; claim scripts always set one.
    pub(crate) fn from_message(message: Message) -> Option<ActiveMessage> {
        let lease_expires_at = message.lease_expires_at?;
        Some(ActiveMessage {
            id: message.id,
            topic: message.topic,
            priority: message.priority,
            payload: message.payload,
            created_at: message.created_at,
            scheduled_at: message.scheduled_at,
            expire_at: message.expire_at,
            max_retries: message.max_retries,
            attempts: message.attempts,
            last_error: message.last_error,
            lease_expires_at,
        })
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        match self.expire_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

/// Ids leased by this process, mapped to their current lease expiry in epoch
/// millis. The dispatcher inserts on claim, the lease monitor refreshes, and
/// the worker removes at the terminal transition, reading the freshest
/// score for the ownership check.
#[derive(Clone, Default)]
pub(crate) struct ActiveTasks(Arc<Mutex<FxHashMap<String, i64>>>);

impl ActiveTasks {
    pub fn insert(&self, id: &str, lease_expires_at: i64) {
        self.0
            .lock()
            .unwrap()
            .insert(id.to_string(), lease_expires_at);
    }

    /// Update the lease for an id still held locally. Returns false when the
    /// worker already finished the message.
    pub fn update(&self, id: &str, lease_expires_at: i64) -> bool {
        match self.0.lock().unwrap().get_mut(id) {
            Some(slot) => {
                *slot = lease_expires_at;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) -> Option<i64> {
        self.0.lock().unwrap().remove(id)
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    pub fn snapshot(&self) -> Vec<(String, i64)> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|(id, lease)| (id.clone(), *lease))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}
