//! Process-level control surface over any number of conversations.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use duet_ai::ApiKeys;
use tokio::sync::broadcast;

use crate::controller::{TurnController, Wake};
use crate::conversation::{
    Conversation, ConversationId, NewMessage, SessionConfig, Speaker, Status, StoredMessage,
};
use crate::error::{Error, Result};
use crate::handle::SessionHandle;
use crate::live::{LiveChannel, LiveEvent};
use crate::narration::Narrator;
use crate::resume::{ResumeCoordinator, ResumeOutcome};
use crate::session::SessionActor;
use crate::store::{ConversationPatch, ConversationStore, Precondition};
use crate::transport::{ProviderTransport, Transport};

/// Owns the live sessions: starting, stopping, resuming, and routing
/// narration acknowledgements and user messages to the right actor.
pub struct Orchestrator {
    store: Arc<dyn ConversationStore>,
    keys: ApiKeys,
    narrator: Option<Arc<dyn Narrator>>,
    sessions: Mutex<HashMap<ConversationId, SessionActor>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn ConversationStore>, keys: ApiKeys) -> Self {
        Self {
            store,
            keys,
            narrator: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_narrator(mut self, narrator: Arc<dyn Narrator>) -> Self {
        self.narrator = Some(narrator);
        self
    }

    pub fn store(&self) -> Arc<dyn ConversationStore> {
        self.store.clone()
    }

    /// Create a conversation and start its actor. The first turn begins as
    /// soon as the opening prompt (if any) is durable.
    pub async fn start_session(&self, config: SessionConfig) -> Result<ConversationId> {
        let transport = Arc::new(ProviderTransport::resolve(&config, &self.keys)?);
        self.start_with_transport(config, transport).await
    }

    /// As [`Self::start_session`], with a caller-supplied transport
    pub async fn start_with_transport(
        &self,
        config: SessionConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<ConversationId> {
        let conversation = Conversation::new(config.clone());
        let id = conversation.id;
        self.store.create(conversation).await?;
        if let Some(opening) = &config.opening_prompt {
            self.store
                .append_message(id, NewMessage::new(Speaker::System, opening.clone()))
                .await?;
        }

        let actor = self.spawn_actor(id, config, transport);
        actor.wake(Wake::MessageAppended).await;
        self.sessions.lock().insert(id, actor);
        tracing::info!(conversation = %id, "session started");
        Ok(id)
    }

    /// Stop a conversation. Cancels any in-flight generation immediately,
    /// even while the actor's mailbox is busy, then makes the stop durable.
    pub async fn stop(&self, id: ConversationId) -> Result<()> {
        let entry = {
            let sessions = self.sessions.lock();
            sessions.get(&id).map(|a| (a.handle().clone(), a.sender()))
        };
        if let Some((handle, tx)) = entry {
            handle.abort();
            // If the actor already shut down, fall through to the durable
            // write below.
            if tx.send(Wake::Stop).await.is_ok() {
                return Ok(());
            }
        }

        let conversation = self.store.get(id).await?;
        if !conversation.status.is_terminal() {
            self.store
                .conditional_update(
                    id,
                    Precondition::status(conversation.status),
                    ConversationPatch::new()
                        .with_status(Status::Stopped)
                        .with_gate(false),
                )
                .await?;
        }
        Ok(())
    }

    /// Pick a persisted conversation back up, attaching an actor if it is
    /// still live.
    pub async fn resume(&self, id: ConversationId) -> Result<ResumeOutcome> {
        let outcome = ResumeCoordinator::new(self.store.clone()).resume(id).await?;
        if let ResumeOutcome::Active { config, .. } = &outcome {
            let transport = Arc::new(ProviderTransport::resolve(config, &self.keys)?);
            self.attach(id, config.clone(), transport).await;
        }
        Ok(outcome)
    }

    /// As [`Self::resume`], with a caller-supplied transport
    pub async fn resume_with_transport(
        &self,
        id: ConversationId,
        transport: Arc<dyn Transport>,
    ) -> Result<ResumeOutcome> {
        let outcome = ResumeCoordinator::new(self.store.clone()).resume(id).await?;
        if let ResumeOutcome::Active { config, .. } = &outcome {
            self.attach(id, config.clone(), transport).await;
        }
        Ok(outcome)
    }

    /// The viewer finished playing narration for `message_id`
    pub async fn notify_narration_finished(
        &self,
        id: ConversationId,
        message_id: crate::conversation::MessageId,
    ) -> Result<()> {
        let tx = self.sessions.lock().get(&id).map(|a| a.sender());
        let Some(tx) = tx else {
            return Err(Error::Inactive(id));
        };
        tx.send(Wake::NarrationFinished { message_id })
            .await
            .map_err(|_| Error::Inactive(id))
    }

    /// Inject a user message into the transcript and poke the actor
    pub async fn post_user_message(
        &self,
        id: ConversationId,
        text: impl Into<String>,
    ) -> Result<StoredMessage> {
        let message = self
            .store
            .append_message(id, NewMessage::new(Speaker::User, text.into()))
            .await?;
        let tx = self.sessions.lock().get(&id).map(|a| a.sender());
        if let Some(tx) = tx {
            let _ = tx.send(Wake::MessageAppended).await;
        }
        Ok(message)
    }

    /// Subscribe to a live session's event stream
    pub fn subscribe(&self, id: ConversationId) -> Option<broadcast::Receiver<LiveEvent>> {
        self.sessions.lock().get(&id).map(|a| a.live().subscribe())
    }

    /// Handle of a live session
    pub fn handle(&self, id: ConversationId) -> Option<SessionHandle> {
        self.sessions.lock().get(&id).map(|a| a.handle().clone())
    }

    /// Whether an actor is attached to this conversation
    pub fn is_active(&self, id: ConversationId) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    fn spawn_actor(
        &self,
        id: ConversationId,
        config: SessionConfig,
        transport: Arc<dyn Transport>,
    ) -> SessionActor {
        let controller = TurnController::new(
            id,
            config,
            self.store.clone(),
            transport,
            LiveChannel::new(),
            self.narrator.clone(),
        );
        SessionActor::spawn(controller)
    }

    async fn attach(&self, id: ConversationId, config: SessionConfig, transport: Arc<dyn Transport>) {
        let sender = {
            let mut sessions = self.sessions.lock();
            if !sessions.contains_key(&id) {
                let actor = self.spawn_actor(id, config, transport);
                sessions.insert(id, actor);
            }
            sessions.get(&id).map(|a| a.sender())
        };
        if let Some(sender) = sender {
            let _ = sender.send(Wake::Resume).await;
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        for actor in self.sessions.lock().values() {
            actor.abort_task();
        }
    }
}
