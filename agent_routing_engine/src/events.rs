//! Execution lifecycle events, scoped to one engine instance.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::AttemptFailure;
use crate::memory::LayerKind;

/// Topic names published by the orchestrator.
pub struct Topics;

impl Topics {
    pub const EXECUTION_START: &'static str = "execution:start";
    pub const EXECUTION_SUCCESS: &'static str = "execution:success";
    pub const EXECUTION_FAILURE: &'static str = "execution:failure";
    pub const EXECUTION_DEFERRED: &'static str = "execution:deferred";
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EngineEvent {
    Start {
        request_id: Uuid,
        function_name: String,
        agent_name: String,
        attempt: u32,
        score: f64,
        timestamp: DateTime<Utc>,
    },
    Success {
        request_id: Uuid,
        function_name: String,
        agent_name: String,
        exec_time_ms: u64,
        cached: Option<LayerKind>,
        timestamp: DateTime<Utc>,
    },
    /// One failed attempt; `terminal` is set when no retry follows.
    Failure {
        request_id: Uuid,
        function_name: String,
        failure: AttemptFailure,
        attempt: u32,
        terminal: bool,
        timestamp: DateTime<Utc>,
    },
    Deferred {
        request_id: Uuid,
        function_name: String,
        deferral: usize,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Start { .. } => Topics::EXECUTION_START,
            Self::Success { .. } => Topics::EXECUTION_SUCCESS,
            Self::Failure { .. } => Topics::EXECUTION_FAILURE,
            Self::Deferred { .. } => Topics::EXECUTION_DEFERRED,
        }
    }

    pub fn request_id(&self) -> Uuid {
        match self {
            Self::Start { request_id, .. }
            | Self::Success { request_id, .. }
            | Self::Failure { request_id, .. }
            | Self::Deferred { request_id, .. } => *request_id,
        }
    }
}

/// Synchronous listener, called inline on the publishing task.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

impl<F> EventObserver for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent) {
        self(event)
    }
}

/// Broadcast channel plus registered observers.
pub struct EventChannel {
    sender: broadcast::Sender<EngineEvent>,
    observers: RwLock<Vec<Arc<dyn EventObserver>>>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn observe(&self, observer: Arc<dyn EventObserver>) {
        self.observers.write().push(observer);
    }

    /// Deliver to observers, then to subscribers. Having no subscribers is fine.
    pub fn publish(&self, event: EngineEvent) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_event(&event);
        }
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn deferred() -> EngineEvent {
        EngineEvent::Deferred {
            request_id: Uuid::new_v4(),
            function_name: "f".to_string(),
            deferral: 1,
            delay_ms: 100,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_observers_and_subscribers_receive_events() {
        let channel = EventChannel::new(8);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        channel.observe(Arc::new(move |event: &EngineEvent| {
            assert_eq!(event.topic(), Topics::EXECUTION_DEFERRED);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let mut rx = channel.subscribe();

        let event = deferred();
        let id = event.request_id();
        channel.publish(event);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(rx.recv().await.unwrap().request_id(), id);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let channel = EventChannel::new(1);
        channel.publish(deferred());
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(deferred()).unwrap();
        assert_eq!(json["type"], "deferred");
        assert_eq!(json["payload"]["delay_ms"], 100);
    }
}
