//! Conversation state, message records, and session configuration.

use chrono::{DateTime, Utc};
use duet_ai::{ModelConfig, VoiceConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{lookahead, retry::BackoffConfig};

/// Unique identifier for a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ConversationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for a message; a streaming draft and the durable
/// message it becomes share one id so viewers can de-duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One of the two agent seats in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentSlot {
    A,
    B,
}

impl AgentSlot {
    /// The opposite seat
    pub fn other(self) -> Self {
        match self {
            AgentSlot::A => AgentSlot::B,
            AgentSlot::B => AgentSlot::A,
        }
    }
}

impl Default for AgentSlot {
    fn default() -> Self {
        AgentSlot::A
    }
}

impl fmt::Display for AgentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentSlot::A => write!(f, "A"),
            AgentSlot::B => write!(f, "B"),
        }
    }
}

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Agent(AgentSlot),
    User,
    System,
}

impl Speaker {
    /// Whether an agent (rather than the user or the system) spoke
    pub fn is_agent(&self) -> bool {
        matches!(self, Speaker::Agent(_))
    }
}

/// Conversation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Running,
    WaitingForNarration,
    Stopped,
    Erred,
}

impl Status {
    /// Terminal states never transition again without a new session
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Stopped | Status::Erred)
    }
}

/// Configuration for one agent seat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Display name
    pub name: String,
    /// Model to use
    pub model: ModelConfig,
    /// System prompt establishing the agent's persona
    pub system_prompt: String,
    /// Voice for narration; `None` disables the narration gate for this agent
    #[serde(default)]
    pub voice: Option<VoiceConfig>,
}

impl AgentConfig {
    /// Whether completed turns by this agent arm the narration gate
    pub fn narration_enabled(&self) -> bool {
        self.voice.is_some()
    }
}

/// Full configuration of a session, persisted with the conversation so a
/// viewer can re-attach after a disconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub agent_a: AgentConfig,
    pub agent_b: AgentConfig,
    /// Initial framing appended as a system message at session start
    #[serde(default)]
    pub opening_prompt: Option<String>,
    /// Language both agents are instructed to respond in
    #[serde(default)]
    pub language: Option<String>,
    /// Which agent speaks first
    #[serde(default)]
    pub first_turn: AgentSlot,
    /// Maximum agent messages beyond the last narrated one
    #[serde(default = "default_lookahead_limit")]
    pub lookahead_limit: usize,
    /// Retry/backoff policy for provider calls
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_lookahead_limit() -> usize {
    lookahead::DEFAULT_LOOKAHEAD_LIMIT
}

impl SessionConfig {
    /// The configuration for a seat
    pub fn agent(&self, slot: AgentSlot) -> &AgentConfig {
        match slot {
            AgentSlot::A => &self.agent_a,
            AgentSlot::B => &self.agent_b,
        }
    }
}

/// Durable record of one conversation.
///
/// Owned by the turn controller: created at session start and mutated only
/// through its transition functions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub config: SessionConfig,
    /// The agent seat authorized to produce the next response
    pub turn: AgentSlot,
    pub status: Status,
    /// True exactly while `status` is `WaitingForNarration`
    pub narration_gate_armed: bool,
    /// Last message whose narration finished playing
    pub last_narrated_message_id: Option<MessageId>,
    /// Human-readable cause; set exactly when `status` is `Erred`
    pub error_context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a fresh running conversation from a session config
    pub fn new(config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            turn: config.first_turn,
            config,
            status: Status::Running,
            narration_gate_armed: false,
            last_narrated_message_id: None,
            error_context: None,
            created_at: now,
            last_activity_at: now,
        }
    }
}

/// A durably appended message. Immutable once written, except for the
/// narration fields which are attached asynchronously after generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    /// Strictly increasing sequence key assigned by the store
    pub seq: u64,
    pub speaker: Speaker,
    pub content: String,
    #[serde(default)]
    pub narration_audio_ref: Option<String>,
    #[serde(default)]
    pub narration_was_split: bool,
    pub created_at: DateTime<Utc>,
}

/// A message to append; the id is caller-supplied so a streaming draft and
/// the durable message can share it.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: MessageId,
    pub speaker: Speaker,
    pub content: String,
}

impl NewMessage {
    pub fn new(speaker: Speaker, content: impl Into<String>) -> Self {
        Self::with_id(MessageId::new(), speaker, content)
    }

    pub fn with_id(id: MessageId, speaker: Speaker, content: impl Into<String>) -> Self {
        Self {
            id,
            speaker,
            content: content.into(),
        }
    }
}

/// Phase of an in-progress generation as seen on the live channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftPhase {
    Streaming,
    Complete,
    Erred,
}

/// Transient, per-token representation of an in-progress generation.
/// Lives only on the live channel; never a source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingDraft {
    pub conversation_id: ConversationId,
    pub draft_id: MessageId,
    pub speaker: Speaker,
    pub text: String,
    pub phase: DraftPhase,
}
