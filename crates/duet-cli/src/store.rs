//! File-backed conversation storage.
//!
//! Each conversation is a small state JSON (rewritten atomically via a temp
//! file) plus an append-only JSONL message log. Narration attachments are
//! appended as their own log entries and folded onto messages at read time,
//! keeping the log strictly append-only.
//!
//! Writes are serialized by an in-process lock; the store assumes a single
//! process owns the data directory.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use duet_core::{
    Conversation, ConversationId, ConversationPatch, ConversationStore, MessageId, NewMessage,
    Precondition, StoreError, StoredMessage,
};

/// One line of a conversation's message log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogEntry {
    Message {
        message: StoredMessage,
    },
    Narration {
        message_id: MessageId,
        audio_ref: String,
        was_split: bool,
    },
}

/// Durable store rooted at a directory
pub struct JsonlStore {
    root: PathBuf,
    // Serializes read-modify-write cycles and caches the next sequence key.
    seqs: Mutex<HashMap<ConversationId, u64>>,
}

impl JsonlStore {
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            seqs: Mutex::new(HashMap::new()),
        })
    }

    fn state_path(&self, id: ConversationId) -> PathBuf {
        self.root.join(format!("{}.state.json", id))
    }

    fn log_path(&self, id: ConversationId) -> PathBuf {
        self.root.join(format!("{}.messages.jsonl", id))
    }

    fn read_state(&self, id: ConversationId) -> Result<Conversation, StoreError> {
        let path = self.state_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id));
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the state file through a temp file so readers never observe a
    /// torn record.
    fn write_state(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let path = self.state_path(conversation.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(conversation)?)?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn read_log(&self, id: ConversationId) -> Result<Vec<StoredMessage>, StoreError> {
        let path = self.log_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id));
        }
        let reader = BufReader::new(File::open(path)?);
        let mut messages: Vec<StoredMessage> = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line)? {
                LogEntry::Message { message } => messages.push(message),
                LogEntry::Narration {
                    message_id,
                    audio_ref,
                    was_split,
                } => {
                    if let Some(message) = messages.iter_mut().find(|m| m.id == message_id) {
                        message.narration_audio_ref = Some(audio_ref);
                        message.narration_was_split = was_split;
                    }
                }
            }
        }
        messages.sort_by_key(|m| m.seq);
        Ok(messages)
    }

    fn append_entry(&self, id: ConversationId, entry: &LogEntry) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(id))?;
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
        file.flush()?;
        Ok(())
    }

    fn next_seq(
        &self,
        seqs: &mut HashMap<ConversationId, u64>,
        id: ConversationId,
    ) -> Result<u64, StoreError> {
        if let Some(seq) = seqs.get(&id) {
            return Ok(*seq);
        }
        // First touch since open: recover the counter from the log.
        let seq = self
            .read_log(id)?
            .last()
            .map(|m| m.seq + 1)
            .unwrap_or(0);
        seqs.insert(id, seq);
        Ok(seq)
    }

    /// All conversations under the root, newest first
    pub fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let _guard = self.seqs.lock();
        let mut conversations = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".state.json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            conversations.push(serde_json::from_str::<Conversation>(&content)?);
        }
        conversations.sort_by_key(|c| std::cmp::Reverse(c.created_at));
        Ok(conversations)
    }
}

#[async_trait]
impl ConversationStore for JsonlStore {
    async fn create(&self, conversation: Conversation) -> Result<(), StoreError> {
        let mut seqs = self.seqs.lock();
        self.write_state(&conversation)?;
        File::create(self.log_path(conversation.id))?;
        seqs.insert(conversation.id, 0);
        Ok(())
    }

    async fn get(&self, id: ConversationId) -> Result<Conversation, StoreError> {
        let _guard = self.seqs.lock();
        self.read_state(id)
    }

    async fn conditional_update(
        &self,
        id: ConversationId,
        precondition: Precondition,
        patch: ConversationPatch,
    ) -> Result<bool, StoreError> {
        let _guard = self.seqs.lock();
        let mut conversation = self.read_state(id)?;
        if !precondition.holds(&conversation) {
            return Ok(false);
        }
        patch.apply(&mut conversation);
        self.write_state(&conversation)?;
        Ok(true)
    }

    async fn append_message(
        &self,
        id: ConversationId,
        message: NewMessage,
    ) -> Result<StoredMessage, StoreError> {
        let mut seqs = self.seqs.lock();
        let mut conversation = self.read_state(id)?;
        let seq = self.next_seq(&mut seqs, id)?;
        let stored = StoredMessage {
            id: message.id,
            seq,
            speaker: message.speaker,
            content: message.content,
            narration_audio_ref: None,
            narration_was_split: false,
            created_at: chrono::Utc::now(),
        };
        self.append_entry(
            id,
            &LogEntry::Message {
                message: stored.clone(),
            },
        )?;
        seqs.insert(id, seq + 1);
        conversation.last_activity_at = stored.created_at;
        self.write_state(&conversation)?;
        Ok(stored)
    }

    async fn list_messages(
        &self,
        id: ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let _guard = self.seqs.lock();
        let messages = self.read_log(id)?;
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
        let _guard = self.seqs.lock();
        let messages = self.read_log(id)?;
        if !messages.iter().any(|m| m.id == message_id) {
            return Err(StoreError::MessageNotFound(message_id));
        }
        self.append_entry(
            id,
            &LogEntry::Narration {
                message_id,
                audio_ref,
                was_split,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_ai::{ModelConfig, ProviderKind};
    use duet_core::{AgentConfig, AgentSlot, BackoffConfig, SessionConfig, Speaker, Status};

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("duet-store-test-{}", uuid::Uuid::new_v4()))
    }

    fn test_config() -> SessionConfig {
        let agent = |name: &str| AgentConfig {
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

    #[tokio::test]
    async fn test_state_round_trip() {
        let root = temp_root();
        let store = JsonlStore::open(&root).unwrap();
        let conversation = Conversation::new(test_config());
        let id = conversation.id;
        store.create(conversation).await.unwrap();

        let loaded = store.get(id).await.unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.status, Status::Running);
        assert_eq!(loaded.config.agent_a.name, "Ada");
    }

    #[tokio::test]
    async fn test_log_survives_reopen() {
        let root = temp_root();
        let id;
        {
            let store = JsonlStore::open(&root).unwrap();
            let conversation = Conversation::new(test_config());
            id = conversation.id;
            store.create(conversation).await.unwrap();
            store
                .append_message(id, NewMessage::new(Speaker::System, "opening"))
                .await
                .unwrap();
            store
                .append_message(id, NewMessage::new(Speaker::Agent(AgentSlot::A), "hello"))
                .await
                .unwrap();
        }

        // A fresh handle recovers the sequence counter from the log.
        let store = JsonlStore::open(&root).unwrap();
        let appended = store
            .append_message(id, NewMessage::new(Speaker::Agent(AgentSlot::B), "hi"))
            .await
            .unwrap();
        assert_eq!(appended.seq, 2);

        let messages = store.list_messages(id, None).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "opening");
        assert_eq!(messages[2].content, "hi");
    }

    #[tokio::test]
    async fn test_narration_entries_fold_onto_messages() {
        let root = temp_root();
        let store = JsonlStore::open(&root).unwrap();
        let conversation = Conversation::new(test_config());
        let id = conversation.id;
        store.create(conversation).await.unwrap();
        let message = store
            .append_message(id, NewMessage::new(Speaker::Agent(AgentSlot::A), "hello"))
            .await
            .unwrap();

        store
            .attach_narration(id, message.id, "audio/a.mp3".into(), true)
            .await
            .unwrap();

        let messages = store.list_messages(id, None).await.unwrap();
        assert_eq!(messages[0].narration_audio_ref.as_deref(), Some("audio/a.mp3"));
        assert!(messages[0].narration_was_split);
    }

    #[tokio::test]
    async fn test_conditional_update_is_durable() {
        let root = temp_root();
        let store = JsonlStore::open(&root).unwrap();
        let conversation = Conversation::new(test_config());
        let id = conversation.id;
        store.create(conversation).await.unwrap();

        let applied = store
            .conditional_update(
                id,
                Precondition::status(Status::Running),
                ConversationPatch::new().with_status(Status::Stopped),
            )
            .await
            .unwrap();
        assert!(applied);

        let reopened = JsonlStore::open(&root).unwrap();
        assert_eq!(reopened.get(id).await.unwrap().status, Status::Stopped);

        // The expectation no longer holds on the new state.
        let applied = reopened
            .conditional_update(
                id,
                Precondition::status(Status::Running),
                ConversationPatch::new().with_status(Status::Erred),
            )
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn test_list_conversations_newest_first() {
        let root = temp_root();
        let store = JsonlStore::open(&root).unwrap();
        let first = Conversation::new(test_config());
        let second = {
            let mut c = Conversation::new(test_config());
            c.created_at = first.created_at + chrono::Duration::seconds(10);
            c
        };
        let (first_id, second_id) = (first.id, second.id);
        store.create(first).await.unwrap();
        store.create(second).await.unwrap();

        let listed = store.list_conversations().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second_id);
        assert_eq!(listed[1].id, first_id);
    }
}
