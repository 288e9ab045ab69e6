//! Ephemeral broadcast of in-progress drafts and control signals.
//!
//! Per-token updates are too expensive to persist, so they travel on this
//! advisory channel instead: no durability, last-write-wins per draft, and
//! viewers reconcile against the durable store using the shared draft id.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::conversation::{AgentSlot, MessageId, StoredMessage, StreamingDraft};

const CHANNEL_CAPACITY: usize = 256;

/// Events published while a conversation runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    /// Snapshot of an in-progress generation; last write wins per draft id
    Draft { draft: StreamingDraft },

    /// The supervisor is waiting out a backoff delay
    Retrying {
        slot: AgentSlot,
        attempt: u32,
        delay_ms: u64,
    },

    /// A message became durable
    MessageAppended { message: StoredMessage },

    /// The narration gate armed; no further turns until released
    GateArmed { message_id: MessageId },

    /// Narration playback finished and the turn advanced
    GateReleased {
        message_id: MessageId,
        next_turn: AgentSlot,
    },

    /// Synthesized audio was attached to a message
    NarrationReady {
        message_id: MessageId,
        audio_ref: String,
    },

    /// The conversation reached a terminal error
    Erred { context: String },

    /// The conversation was stopped
    Stopped,
}

/// Broadcast channel for one conversation's live events.
#[derive(Clone)]
pub struct LiveChannel {
    tx: broadcast::Sender<LiveEvent>,
    drafts: Arc<Mutex<HashMap<MessageId, StreamingDraft>>>,
}

impl LiveChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            drafts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to live events
    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Draft events also refresh the snapshot map so late
    /// subscribers can fetch the current partial text.
    pub fn publish(&self, event: LiveEvent) {
        if let LiveEvent::Draft { draft } = &event {
            self.drafts.lock().insert(draft.draft_id, draft.clone());
        }
        // No subscribers is fine; the channel is advisory.
        let _ = self.tx.send(event);
    }

    /// Current snapshot of a draft, if one is being streamed
    pub fn draft(&self, draft_id: MessageId) -> Option<StreamingDraft> {
        self.drafts.lock().get(&draft_id).cloned()
    }

    /// Drop the snapshot once the corresponding message is durable
    pub fn forget_draft(&self, draft_id: MessageId) {
        self.drafts.lock().remove(&draft_id);
    }
}

impl Default for LiveChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationId, DraftPhase, Speaker};

    fn draft(id: MessageId, text: &str) -> StreamingDraft {
        StreamingDraft {
            conversation_id: ConversationId::new(),
            draft_id: id,
            speaker: Speaker::Agent(AgentSlot::A),
            text: text.to_string(),
            phase: DraftPhase::Streaming,
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let live = LiveChannel::new();
        let mut rx = live.subscribe();

        live.publish(LiveEvent::Stopped);
        match rx.recv().await.unwrap() {
            LiveEvent::Stopped => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_draft_snapshot_is_last_write_wins() {
        let live = LiveChannel::new();
        let id = MessageId::new();

        live.publish(LiveEvent::Draft {
            draft: draft(id, "Hel"),
        });
        live.publish(LiveEvent::Draft {
            draft: draft(id, "Hello"),
        });

        assert_eq!(live.draft(id).unwrap().text, "Hello");

        live.forget_draft(id);
        assert!(live.draft(id).is_none());
    }

    #[test]
    fn test_publish_without_subscribers_does_not_panic() {
        let live = LiveChannel::new();
        live.publish(LiveEvent::Stopped);
    }
}
