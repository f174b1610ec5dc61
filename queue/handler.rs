use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use fxhash::FxHashMap;

use crate::work_item::ActiveMessage;

/// How a handler failed. `Failure` goes through the retry schedule;
/// `Unrecoverable` dead-letters without another attempt.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failure(anyhow::Error),

    #[error("unrecoverable: {0}")]
    Unrecoverable(anyhow::Error),
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> HandlerError {
        HandlerError::Failure(e)
    }
}

impl HandlerError {
    pub fn unrecoverable(e: impl Into<anyhow::Error>) -> HandlerError {
        HandlerError::Unrecoverable(e.into())
    }
}

/// A message handler for one topic. Must tolerate redelivery (at-least-once)
/// and observe cancellation promptly; a handler that outlives its lease will
/// see the message delivered again elsewhere.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &ActiveMessage) -> Result<(), HandlerError>;
}

pub(crate) struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(ActiveMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: &ActiveMessage) -> Result<(), HandlerError> {
        (self.0)(message.clone()).await
    }
}

/// Topic → handler map. Mutable only before the queue starts; published as
/// an immutable Arc to the dispatcher and workers, so reads take no lock.
#[derive(Clone, Default)]
pub(crate) struct HandlerRegistry {
    handlers: FxHashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    /// Returns false when the topic already had a handler.
    pub fn insert(&mut self, topic: String, handler: Arc<dyn MessageHandler>) -> bool {
        use std::collections::hash_map::Entry;
        match self.handlers.entry(topic) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handler);
                true
            }
        }
    }

    pub fn get(&self, topic: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(topic).cloned()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics = self.handlers.keys().cloned().collect::<Vec<_>>();
        topics.sort();
        topics
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl MessageHandler for NoopHandler {
        async fn handle(&self, _message: &ActiveMessage) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn registry_resolves_and_rejects_duplicates() {
        let mut registry = HandlerRegistry::default();
        assert!(registry.insert("orders".to_string(), Arc::new(NoopHandler)));
        assert!(!registry.insert("orders".to_string(), Arc::new(NoopHandler)));

        assert!(registry.get("orders").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.topics(), vec!["orders".to_string()]);
    }
}
