use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::constants::defaults::EVENT_CHANNEL_CAPACITY;
use crate::models::ActivityPath;

/// In-process publisher for task, activity and bucket lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

/// Event that has been published
#[derive(Debug, Clone, Serialize)]
pub struct PublishedEvent {
    pub name: String,
    pub context: Value,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

impl PublishedEvent {
    pub fn task_id(&self) -> Option<Uuid> {
        self.context
            .get("task_id")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }

    pub fn activity_path(&self) -> Option<&str> {
        self.context.get("activity_path").and_then(Value::as_str)
    }
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event with the given name and context
    pub fn publish(&self, event_name: impl Into<String>, context: Value) {
        let event = PublishedEvent {
            name: event_name.into(),
            context,
            published_at: chrono::Utc::now(),
        };

        // No subscribers is fine; events are fire-and-forget
        let _ = self.sender.send(event);
    }

    /// Publish a task-scoped event
    pub fn publish_task(&self, event_name: &str, task_id: Uuid, details: Value) {
        self.publish(
            event_name,
            json!({
                "task_id": task_id.to_string(),
                "details": details,
            }),
        );
    }

    /// Publish an activity-scoped event, optionally naming a bucket
    pub fn publish_activity(
        &self,
        event_name: &str,
        task_id: Uuid,
        path: &ActivityPath,
        bucket: Option<u64>,
        details: Value,
    ) {
        self.publish(
            event_name,
            json!({
                "task_id": task_id.to_string(),
                "activity_path": path.to_string(),
                "bucket_sequence_number": bucket,
                "details": details,
            }),
        );
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}
