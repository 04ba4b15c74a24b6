//! Pipeline lifecycle events.
//!
//! The engine never touches a presentation layer directly. Instead it
//! publishes events on an [`EventBus`]; a terminal UI, a web frontend, or a
//! test can subscribe and render whatever it likes.

use crate::session::GenerationType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Everything observable about a generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A pipeline pass began
    Started {
        generation_type: GenerationType,
        depth: u32,
        timestamp: DateTime<Utc>,
    },

    /// The target message was updated with newer text
    ChunkCommitted {
        message_index: usize,
        text: String,
    },

    /// Generation completed and the result was committed
    Finished {
        message_index: Option<usize>,
        text: String,
        timestamp: DateTime<Utc>,
    },

    /// The run was aborted; partial text was kept
    Stopped {
        message_index: Option<usize>,
        text: String,
    },

    /// The run failed; the chat is left as it was before the failure
    Errored { error: String },

    /// Tool calls were executed
    ToolsInvoked {
        invocations: usize,
        stealth: usize,
        errors: Vec<String>,
    },
}

/// A broadcast-based event bus.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Slow
/// subscribers lag and miss events; the pipeline never waits on them.
pub struct EventBus {
    sender: broadcast::Sender<Arc<PipelineEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: PipelineEvent) {
        // no subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PipelineEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(PipelineEvent::ChunkCommitted {
            message_index: 3,
            text: "Hel".into(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            PipelineEvent::ChunkCommitted { message_index, text } => {
                assert_eq!(*message_index, 3);
                assert_eq!(text, "Hel");
            }
            other => panic!("Expected ChunkCommitted, got {other:?}"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(PipelineEvent::Errored {
            error: "no subscribers".into(),
        });
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_string(&PipelineEvent::Started {
            generation_type: GenerationType::Swipe,
            depth: 0,
            timestamp: Utc::now(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"started""#));
        assert!(json.contains(r#""generation_type":"swipe""#));
    }
}
