//! Durable conversation storage behind a compare-and-set interface.
//!
//! Every state transition goes through [`ConversationStore::conditional_update`]:
//! the caller states what it expects the conversation to look like, and the
//! store applies the patch only if the expectation still holds. Writers that
//! lose the race re-read and re-decide instead of clobbering each other.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

use crate::conversation::{
    AgentSlot, Conversation, ConversationId, MessageId, NewMessage, Status, StoredMessage,
};

/// Errors from the durable store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(ConversationId),

    #[error("message {0} not found")]
    MessageNotFound(MessageId),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// What a writer expects the conversation to look like before its patch
/// applies. Unset fields are not checked.
#[derive(Debug, Clone, Copy, Default)]
pub struct Precondition {
    pub status: Option<Status>,
    pub turn: Option<AgentSlot>,
}

impl Precondition {
    /// Apply the patch unconditionally
    pub fn any() -> Self {
        Self::default()
    }

    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            turn: None,
        }
    }

    pub fn with_turn(mut self, turn: AgentSlot) -> Self {
        self.turn = Some(turn);
        self
    }

    /// Whether the expectation holds against a snapshot
    pub fn holds(&self, conversation: &Conversation) -> bool {
        self.status.is_none_or(|s| conversation.status == s)
            && self.turn.is_none_or(|t| conversation.turn == t)
    }
}

/// Partial update to a conversation record. Unset fields are left alone.
///
/// `last_narrated_message_id` and `error_context` are doubly optional so a
/// patch can distinguish "leave unchanged" from "clear to `None`".
#[derive(Debug, Clone, Default)]
pub struct ConversationPatch {
    pub status: Option<Status>,
    pub turn: Option<AgentSlot>,
    pub narration_gate_armed: Option<bool>,
    pub last_narrated_message_id: Option<Option<MessageId>>,
    pub error_context: Option<Option<String>>,
}

impl ConversationPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_turn(mut self, turn: AgentSlot) -> Self {
        self.turn = Some(turn);
        self
    }

    pub fn with_gate(mut self, armed: bool) -> Self {
        self.narration_gate_armed = Some(armed);
        self
    }

    pub fn with_last_narrated(mut self, id: MessageId) -> Self {
        self.last_narrated_message_id = Some(Some(id));
        self
    }

    pub fn with_error_context(mut self, context: impl Into<String>) -> Self {
        self.error_context = Some(Some(context.into()));
        self
    }

    /// Apply the patch to a snapshot, refreshing its activity timestamp
    pub fn apply(&self, conversation: &mut Conversation) {
        if let Some(status) = self.status {
            conversation.status = status;
        }
        if let Some(turn) = self.turn {
            conversation.turn = turn;
        }
        if let Some(armed) = self.narration_gate_armed {
            conversation.narration_gate_armed = armed;
        }
        if let Some(marker) = self.last_narrated_message_id {
            conversation.last_narrated_message_id = marker;
        }
        if let Some(context) = &self.error_context {
            conversation.error_context = context.clone();
        }
        conversation.last_activity_at = chrono::Utc::now();
    }
}

/// Durable storage for conversations and their messages.
///
/// Implementations must make `conditional_update` atomic with respect to
/// concurrent calls on the same conversation, and must assign strictly
/// increasing `seq` values within a conversation.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Persist a new conversation record
    async fn create(&self, conversation: Conversation) -> Result<(), StoreError>;

    /// Fetch the current conversation snapshot
    async fn get(&self, id: ConversationId) -> Result<Conversation, StoreError>;

    /// Apply `patch` iff `precondition` still holds. Returns whether the
    /// patch was applied.
    async fn conditional_update(
        &self,
        id: ConversationId,
        precondition: Precondition,
        patch: ConversationPatch,
    ) -> Result<bool, StoreError>;

    /// Append a message, assigning its sequence key
    async fn append_message(
        &self,
        id: ConversationId,
        message: NewMessage,
    ) -> Result<StoredMessage, StoreError>;

    /// Messages in `seq` order. With a limit, the most recent `limit`
    /// messages are returned, still in ascending order.
    async fn list_messages(
        &self,
        id: ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Attach synthesized narration to an existing message
    async fn attach_narration(
        &self,
        id: ConversationId,
        message_id: MessageId,
        audio_ref: String,
        was_split: bool,
    ) -> Result<(), StoreError>;
}

struct Record {
    conversation: Conversation,
    messages: Vec<StoredMessage>,
    next_seq: u64,
}

/// In-memory store; the default for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<ConversationId, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create(&self, conversation: Conversation) -> Result<(), StoreError> {
        self.records.write().insert(
            conversation.id,
            Record {
                conversation,
                messages: Vec::new(),
                next_seq: 0,
            },
        );
        Ok(())
    }

    async fn get(&self, id: ConversationId) -> Result<Conversation, StoreError> {
        self.records
            .read()
            .get(&id)
            .map(|r| r.conversation.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn conditional_update(
        &self,
        id: ConversationId,
        precondition: Precondition,
        patch: ConversationPatch,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !precondition.holds(&record.conversation) {
            return Ok(false);
        }
        patch.apply(&mut record.conversation);
        Ok(true)
    }

    async fn append_message(
        &self,
        id: ConversationId,
        message: NewMessage,
    ) -> Result<StoredMessage, StoreError> {
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let stored = StoredMessage {
            id: message.id,
            seq: record.next_seq,
            speaker: message.speaker,
            content: message.content,
            narration_audio_ref: None,
            narration_was_split: false,
            created_at: chrono::Utc::now(),
        };
        record.next_seq += 1;
        record.conversation.last_activity_at = stored.created_at;
        record.messages.push(stored.clone());
        Ok(stored)
    }

    async fn list_messages(
        &self,
        id: ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let records = self.records.read();
        let record = records.get(&id).ok_or(StoreError::NotFound(id))?;
        let messages = &record.messages;
        let start = limit.map_or(0, |n| messages.len().saturating_sub(n));
        Ok(messages[start..].to_vec())
    }

    async fn attach_narration(
        &self,
        id: ConversationId,
        message_id: MessageId,
        audio_ref: String,
        was_split: bool,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let message = record
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(StoreError::MessageNotFound(message_id))?;
        message.narration_audio_ref = Some(audio_ref);
        message.narration_was_split = was_split;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{SessionConfig, Speaker};
    use crate::retry::BackoffConfig;
    use duet_ai::{ModelConfig, ProviderKind};

    fn test_config() -> SessionConfig {
        let agent = |name: &str| crate::conversation::AgentConfig {
            name: name.to_string(),
            model: ModelConfig::new(ProviderKind::OpenAi, "gpt-4o-mini"),
            system_prompt: format!("You are {}.", name),
            voice: None,
        };
        SessionConfig {
            agent_a: agent("Ada"),
            agent_b: agent("Ben"),
            opening_prompt: None,
            language: None,
            first_turn: AgentSlot::A,
            lookahead_limit: 3,
            backoff: BackoffConfig::default(),
        }
    }

    async fn seeded_store() -> (MemoryStore, ConversationId) {
        let store = MemoryStore::new();
        let conversation = Conversation::new(test_config());
        let id = conversation.id;
        store.create(conversation).await.unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (store, id) = seeded_store().await;
        let conversation = store.get(id).await.unwrap();
        assert_eq!(conversation.id, id);
        assert_eq!(conversation.status, Status::Running);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryStore::new();
        let id = ConversationId::new();
        assert!(matches!(
            store.get(id).await,
            Err(StoreError::NotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_conditional_update_applies_when_precondition_holds() {
        let (store, id) = seeded_store().await;
        let applied = store
            .conditional_update(
                id,
                Precondition::status(Status::Running).with_turn(AgentSlot::A),
                ConversationPatch::new()
                    .with_turn(AgentSlot::B)
                    .with_gate(true)
                    .with_status(Status::WaitingForNarration),
            )
            .await
            .unwrap();
        assert!(applied);

        let conversation = store.get(id).await.unwrap();
        assert_eq!(conversation.status, Status::WaitingForNarration);
        assert_eq!(conversation.turn, AgentSlot::B);
        assert!(conversation.narration_gate_armed);
    }

    #[tokio::test]
    async fn test_conditional_update_rejects_stale_expectation() {
        let (store, id) = seeded_store().await;
        let applied = store
            .conditional_update(
                id,
                Precondition::status(Status::Stopped),
                ConversationPatch::new().with_turn(AgentSlot::B),
            )
            .await
            .unwrap();
        assert!(!applied);

        // Nothing changed.
        let conversation = store.get(id).await.unwrap();
        assert_eq!(conversation.turn, AgentSlot::A);
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_seq() {
        let (store, id) = seeded_store().await;
        let first = store
            .append_message(id, NewMessage::new(Speaker::System, "opening"))
            .await
            .unwrap();
        let second = store
            .append_message(id, NewMessage::new(Speaker::Agent(AgentSlot::A), "hello"))
            .await
            .unwrap();
        assert!(first.seq < second.seq);

        let messages = store.list_messages(id, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "opening");
        assert_eq!(messages[1].content, "hello");
    }

    #[tokio::test]
    async fn test_list_with_limit_returns_most_recent() {
        let (store, id) = seeded_store().await;
        for i in 0..5 {
            store
                .append_message(id, NewMessage::new(Speaker::User, format!("m{}", i)))
                .await
                .unwrap();
        }
        let tail = store.list_messages(id, Some(2)).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "m3");
        assert_eq!(tail[1].content, "m4");
    }

    #[tokio::test]
    async fn test_attach_narration() {
        let (store, id) = seeded_store().await;
        let message = store
            .append_message(id, NewMessage::new(Speaker::Agent(AgentSlot::A), "hi"))
            .await
            .unwrap();
        store
            .attach_narration(id, message.id, "audio/turn-1.mp3".into(), true)
            .await
            .unwrap();

        let messages = store.list_messages(id, None).await.unwrap();
        assert_eq!(
            messages[0].narration_audio_ref.as_deref(),
            Some("audio/turn-1.mp3")
        );
        assert!(messages[0].narration_was_split);
    }

    #[tokio::test]
    async fn test_attach_narration_unknown_message() {
        let (store, id) = seeded_store().await;
        let missing = MessageId::new();
        assert!(matches!(
            store
                .attach_narration(id, missing, "ref".into(), false)
                .await,
            Err(StoreError::MessageNotFound(m)) if m == missing
        ));
    }
}
