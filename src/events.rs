//! Transport-visible event surface.
//!
//! The core publishes interaction-scoped events for the UI layer. Ordering is
//! per-session FIFO: events for one session are published from that session's
//! serialized work, so subscribers observe them in order. Publishing is
//! fire-and-forget — a slow or absent subscriber never fails the hot path.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    agent::AgentStatus,
    session::MessageRole,
};

// ─── CoreEvent ────────────────────────────────────────────────────────────────

/// Session lifecycle changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Created,
    Closed,
}

/// Events emitted by the core for transport consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    SessionEvent {
        session_id: String,
        kind: SessionEventKind,
    },
    AgentStatus {
        agent_id: String,
        status: AgentStatus,
    },
    MessageAppended {
        session_id: String,
        message_id: String,
        role: MessageRole,
    },
    ToolInvoked {
        session_id: String,
        tool_name: String,
        success: bool,
    },
    InteractionRecorded {
        session_id: String,
        interaction_id: String,
        success: bool,
    },
}

// ─── EventBus ─────────────────────────────────────────────────────────────────

/// Sink for [`CoreEvent`]s. Implementations must never block or fail the
/// publisher.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: CoreEvent);
}

/// `tokio::sync::broadcast`-backed bus.
///
/// Lagging receivers drop the oldest buffered events; publishers are never
/// back-pressured.
pub struct TokioBroadcastBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl TokioBroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventBus for TokioBroadcastBus {
    fn publish(&self, event: CoreEvent) {
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = TokioBroadcastBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(CoreEvent::SessionEvent {
            session_id: "s1".into(),
            kind: SessionEventKind::Created,
        });
        let event = rx.recv().await.unwrap();
        match event {
            CoreEvent::SessionEvent { session_id, kind } => {
                assert_eq!(session_id, "s1");
                assert_eq!(kind, SessionEventKind::Created);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = TokioBroadcastBus::new(4);
        bus.publish(CoreEvent::InteractionRecorded {
            session_id: "s1".into(),
            interaction_id: "i1".into(),
            success: true,
        });
    }

    #[tokio::test]
    async fn events_are_received_in_publish_order() {
        let bus = TokioBroadcastBus::new(16);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(CoreEvent::MessageAppended {
                session_id: "s1".into(),
                message_id: format!("m{i}"),
                role: MessageRole::User,
            });
        }
        for i in 0..5 {
            match rx.recv().await.unwrap() {
                CoreEvent::MessageAppended { message_id, .. } => {
                    assert_eq!(message_id, format!("m{i}"));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let json = serde_json::to_string(&CoreEvent::ToolInvoked {
            session_id: "s1".into(),
            tool_name: "web_search".into(),
            success: true,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"tool_invoked\""));
    }
}
