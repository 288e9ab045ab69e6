//! The per-conversation turn state machine.
//!
//! All progress happens through [`TurnController::handle_wake`]: a wake reads
//! the durable snapshot, decides whether the conversation may advance, and
//! either runs one generation or reports why it did nothing. Writes go through
//! conditional updates, so two controllers racing on the same record cannot
//! both advance the turn.

use futures::StreamExt;
use std::sync::Arc;

use duet_ai::{ChatMessage, ChatRequest};

use crate::conversation::{
    AgentSlot, ConversationId, DraftPhase, MessageId, NewMessage, SessionConfig, Speaker, Status,
    StoredMessage, StreamingDraft,
};
use crate::error::{Error, Result};
use crate::handle::SessionHandle;
use crate::live::{LiveChannel, LiveEvent};
use crate::lookahead;
use crate::narration::{self, Narrator};
use crate::retry::{RetryError, RetrySupervisor};
use crate::store::{ConversationPatch, ConversationStore, Precondition};
use crate::transport::Transport;

/// How many times a lost conditional update is re-read and re-decided before
/// giving up. These re-evaluations are not provider retries.
pub(crate) const CONFLICT_REEVALUATIONS: u32 = 3;

/// Upper bound on the persisted error context
pub(crate) const ERROR_CONTEXT_MAX_LEN: usize = 1024;

/// Reasons a wake may be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// A message became durable (session start, user injection, agent turn)
    MessageAppended,
    /// The viewer finished playing narration for a message
    NarrationFinished { message_id: MessageId },
    /// A previously persisted conversation is being picked back up
    Resume,
    /// The user asked to stop
    Stop,
}

/// Why a wake resulted in no generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The conversation is stopped or erred
    TerminalStatus,
    /// The narration gate is armed
    Gated,
    /// A generation is already running
    InFlight,
    /// The acting agent already produced the latest agent message
    NotOurTurn,
    /// The unheard window is at its limit
    LookaheadFull,
}

/// What a wake did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// No generation ran
    Ignored(IgnoreReason),
    /// A turn completed and the other agent is now up
    Advanced { message_id: MessageId },
    /// A turn completed and the gate armed; waiting for playback
    Gated { message_id: MessageId },
    /// The conversation stopped (or lost its race to a concurrent stop)
    Stopped,
    /// Retries exhausted; the conversation is erred
    Erred,
}

/// Drives one conversation's turn-taking.
pub struct TurnController {
    conversation_id: ConversationId,
    config: SessionConfig,
    store: Arc<dyn ConversationStore>,
    transport: Arc<dyn Transport>,
    live: LiveChannel,
    narrator: Option<Arc<dyn Narrator>>,
    handle: SessionHandle,
    retry: RetrySupervisor,
}

impl TurnController {
    pub fn new(
        conversation_id: ConversationId,
        config: SessionConfig,
        store: Arc<dyn ConversationStore>,
        transport: Arc<dyn Transport>,
        live: LiveChannel,
        narrator: Option<Arc<dyn Narrator>>,
    ) -> Self {
        let retry = RetrySupervisor::new(config.backoff.clone());
        Self {
            conversation_id,
            config,
            store,
            transport,
            live,
            narrator,
            handle: SessionHandle::new(),
            retry,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn live(&self) -> &LiveChannel {
        &self.live
    }

    /// Process one wake. At most one generation runs per call; chaining
    /// follow-up turns is the caller's job.
    pub async fn handle_wake(&self, wake: Wake) -> Result<WakeOutcome> {
        match wake {
            Wake::Stop => self.stop().await,
            Wake::NarrationFinished { message_id } => {
                self.release_gate(message_id).await?;
                self.try_advance().await
            }
            Wake::MessageAppended | Wake::Resume => self.try_advance().await,
        }
    }

    /// Read the snapshot, run the entry guard, and generate if permitted.
    /// A lost conditional update re-reads and re-decides a bounded number of
    /// times; the fresh state usually turns the wake into an ignore.
    async fn try_advance(&self) -> Result<WakeOutcome> {
        for _ in 0..CONFLICT_REEVALUATIONS {
            let conversation = self.store.get(self.conversation_id).await?;
            if conversation.status.is_terminal() {
                return Ok(WakeOutcome::Ignored(IgnoreReason::TerminalStatus));
            }
            if conversation.status == Status::WaitingForNarration {
                return Ok(WakeOutcome::Ignored(IgnoreReason::Gated));
            }
            if self.handle.is_generating() {
                return Ok(WakeOutcome::Ignored(IgnoreReason::InFlight));
            }

            let messages = self.store.list_messages(self.conversation_id, None).await?;
            let slot = conversation.turn;
            let last_agent = messages.iter().rev().find(|m| m.speaker.is_agent());
            if last_agent.is_some_and(|m| m.speaker == Speaker::Agent(slot)) {
                return Ok(WakeOutcome::Ignored(IgnoreReason::NotOurTurn));
            }
            if !lookahead::allowed(
                conversation.last_narrated_message_id,
                &messages,
                conversation.config.lookahead_limit,
            ) {
                return Ok(WakeOutcome::Ignored(IgnoreReason::LookaheadFull));
            }

            match self.generate(slot, &messages).await {
                Err(Error::Conflict) => continue,
                other => return other,
            }
        }
        Err(Error::Conflict)
    }

    /// Run one full generation for `slot`: stream under the retry supervisor,
    /// then persist the completed turn.
    async fn generate(&self, slot: AgentSlot, messages: &[StoredMessage]) -> Result<WakeOutcome> {
        let Some(_guard) = self.handle.begin_generation() else {
            return Ok(WakeOutcome::Ignored(IgnoreReason::InFlight));
        };
        self.handle.reset_cancel();
        let cancel = self.handle.cancel_token();

        let draft_id = MessageId::new();
        let request = self.build_request(slot, messages);
        let conversation_id = self.conversation_id;
        let transport = self.transport.clone();
        let live = self.live.clone();
        let op_cancel = cancel.clone();

        // Each attempt streams into a fresh draft under the same id, so a
        // retry visibly restarts the partial text instead of appending to it.
        let op = move || {
            let transport = transport.clone();
            let live = live.clone();
            let request = request.clone();
            let cancel = op_cancel.clone();
            async move {
                let mut draft = StreamingDraft {
                    conversation_id,
                    draft_id,
                    speaker: Speaker::Agent(slot),
                    text: String::new(),
                    phase: DraftPhase::Streaming,
                };
                live.publish(LiveEvent::Draft {
                    draft: draft.clone(),
                });

                let mut stream = tokio::select! {
                    _ = cancel.cancelled() => return Err(duet_ai::Error::Aborted),
                    result = transport.stream(slot, request) => result?,
                };
                loop {
                    let chunk = tokio::select! {
                        _ = cancel.cancelled() => return Err(duet_ai::Error::Aborted),
                        chunk = stream.next() => chunk,
                    };
                    match chunk {
                        Some(Ok(text)) => {
                            draft.text.push_str(&text);
                            live.publish(LiveEvent::Draft {
                                draft: draft.clone(),
                            });
                        }
                        Some(Err(e)) => return Err(e),
                        None => break,
                    }
                }
                Ok(draft.text)
            }
        };

        let result = self
            .retry
            .invoke(op, &cancel, |attempt, delay| {
                self.live.publish(LiveEvent::Retrying {
                    slot,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            })
            .await;

        match result {
            Ok(text) => self.complete_turn(slot, draft_id, text).await,
            Err(RetryError::Cancelled) => {
                self.mark_draft_erred(draft_id);
                Ok(WakeOutcome::Stopped)
            }
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                let error = Error::Generation {
                    slot,
                    attempts,
                    message: last_error,
                };
                self.mark_erred(draft_id, &error).await?;
                Ok(WakeOutcome::Erred)
            }
        }
    }

    /// Persist the completed turn, then either hand the turn over or arm the
    /// narration gate.
    async fn complete_turn(
        &self,
        slot: AgentSlot,
        draft_id: MessageId,
        text: String,
    ) -> Result<WakeOutcome> {
        let message = self
            .store
            .append_message(
                self.conversation_id,
                NewMessage::with_id(draft_id, Speaker::Agent(slot), text),
            )
            .await?;

        self.live.publish(LiveEvent::Draft {
            draft: StreamingDraft {
                conversation_id: self.conversation_id,
                draft_id,
                speaker: Speaker::Agent(slot),
                text: message.content.clone(),
                phase: DraftPhase::Complete,
            },
        });
        self.live.publish(LiveEvent::MessageAppended {
            message: message.clone(),
        });
        self.live.forget_draft(draft_id);

        let agent = self.config.agent(slot);
        if agent.narration_enabled() {
            let applied = self
                .update_with_reevaluation(
                    Precondition::status(Status::Running).with_turn(slot),
                    ConversationPatch::new()
                        .with_status(Status::WaitingForNarration)
                        .with_gate(true),
                )
                .await?;
            if !applied {
                // The conversation went terminal while we were streaming.
                return Ok(WakeOutcome::Stopped);
            }
            self.live.publish(LiveEvent::GateArmed {
                message_id: message.id,
            });
            if let (Some(narrator), Some(voice)) = (&self.narrator, &agent.voice) {
                narration::spawn_synthesis(
                    narrator.clone(),
                    self.store.clone(),
                    self.live.clone(),
                    self.conversation_id,
                    message.id,
                    message.content.clone(),
                    voice.clone(),
                );
            }
            Ok(WakeOutcome::Gated {
                message_id: message.id,
            })
        } else {
            let applied = self
                .update_with_reevaluation(
                    Precondition::status(Status::Running).with_turn(slot),
                    ConversationPatch::new().with_turn(slot.other()),
                )
                .await?;
            if !applied {
                return Ok(WakeOutcome::Stopped);
            }
            Ok(WakeOutcome::Advanced {
                message_id: message.id,
            })
        }
    }

    /// Apply a conditional update, re-reading on failure. Returns `Ok(false)`
    /// if the conversation turned terminal underneath us.
    async fn update_with_reevaluation(
        &self,
        precondition: Precondition,
        patch: ConversationPatch,
    ) -> Result<bool> {
        for _ in 0..CONFLICT_REEVALUATIONS {
            if self
                .store
                .conditional_update(self.conversation_id, precondition, patch.clone())
                .await?
            {
                return Ok(true);
            }
            let conversation = self.store.get(self.conversation_id).await?;
            if conversation.status.is_terminal() {
                return Ok(false);
            }
        }
        Err(Error::Conflict)
    }

    /// Record a terminal generation failure: erred draft, terminal status,
    /// and a bounded context derived from the error's display form.
    async fn mark_erred(&self, draft_id: MessageId, error: &Error) -> Result<()> {
        self.mark_draft_erred(draft_id);

        let mut context = error.to_string();
        if context.len() > ERROR_CONTEXT_MAX_LEN {
            let cut = (0..=ERROR_CONTEXT_MAX_LEN)
                .rev()
                .find(|&i| context.is_char_boundary(i))
                .unwrap_or(0);
            context.truncate(cut);
        }

        let applied = self
            .store
            .conditional_update(
                self.conversation_id,
                Precondition::status(Status::Running),
                ConversationPatch::new()
                    .with_status(Status::Erred)
                    .with_gate(false)
                    .with_error_context(context.clone()),
            )
            .await?;
        if applied {
            tracing::error!(conversation = %self.conversation_id, "{}", context);
            self.live.publish(LiveEvent::Erred { context });
        }
        Ok(())
    }

    fn mark_draft_erred(&self, draft_id: MessageId) {
        if let Some(mut draft) = self.live.draft(draft_id) {
            draft.phase = DraftPhase::Erred;
            self.live.publish(LiveEvent::Draft { draft });
        }
        self.live.forget_draft(draft_id);
    }

    /// Playback of `message_id` finished: disarm the gate, advance the
    /// narrated marker, and hand the turn to the other agent.
    async fn release_gate(&self, message_id: MessageId) -> Result<()> {
        let conversation = self.store.get(self.conversation_id).await?;
        if conversation.status == Status::WaitingForNarration {
            let next_turn = conversation.turn.other();
            let applied = self
                .store
                .conditional_update(
                    self.conversation_id,
                    Precondition::status(Status::WaitingForNarration).with_turn(conversation.turn),
                    ConversationPatch::new()
                        .with_status(Status::Running)
                        .with_turn(next_turn)
                        .with_gate(false)
                        .with_last_narrated(message_id),
                )
                .await?;
            if applied {
                self.live.publish(LiveEvent::GateReleased {
                    message_id,
                    next_turn,
                });
            }
        } else if !conversation.status.is_terminal() {
            // Playback finishing for an ungated message still moves the
            // marker, widening the lookahead window.
            self.store
                .conditional_update(
                    self.conversation_id,
                    Precondition::status(conversation.status),
                    ConversationPatch::new().with_last_narrated(message_id),
                )
                .await?;
        }
        Ok(())
    }

    /// Stop the conversation: cancel any in-flight generation and make the
    /// terminal status durable. Already-terminal conversations are left alone.
    async fn stop(&self) -> Result<WakeOutcome> {
        self.handle.abort();
        let conversation = self.store.get(self.conversation_id).await?;
        if !conversation.status.is_terminal() {
            self.store
                .conditional_update(
                    self.conversation_id,
                    Precondition::status(conversation.status),
                    ConversationPatch::new()
                        .with_status(Status::Stopped)
                        .with_gate(false),
                )
                .await?;
        }
        self.live.publish(LiveEvent::Stopped);
        Ok(WakeOutcome::Stopped)
    }

    /// Frame history for the acting agent: its own prior turns become
    /// assistant messages, everything else user messages.
    fn build_request(&self, slot: AgentSlot, messages: &[StoredMessage]) -> ChatRequest {
        let agent = self.config.agent(slot);
        let mut system_prompt = agent.system_prompt.clone();
        if let Some(language) = &self.config.language {
            system_prompt.push_str(&format!("\n\nAlways respond in {}.", language));
        }
        let framed = messages
            .iter()
            .map(|m| {
                if m.speaker == Speaker::Agent(slot) {
                    ChatMessage::assistant(m.content.clone())
                } else {
                    ChatMessage::user(m.content.clone())
                }
            })
            .collect();
        ChatRequest {
            system_prompt: Some(system_prompt),
            messages: framed,
            max_tokens: agent.model.max_tokens,
            temperature: agent.model.temperature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Conversation;
    use crate::store::MemoryStore;
    use crate::testutil::{MockTransport, test_config};
    use duet_ai::ChatRole;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        transport: Arc<MockTransport>,
        controller: TurnController,
        id: ConversationId,
    }

    async fn fixture(config: SessionConfig, transport: Arc<MockTransport>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let conversation = Conversation::new(config.clone());
        let id = conversation.id;
        store.create(conversation).await.unwrap();
        let controller = TurnController::new(
            id,
            config,
            store.clone(),
            transport.clone(),
            LiveChannel::new(),
            None,
        );
        Fixture {
            store,
            transport,
            controller,
            id,
        }
    }

    #[tokio::test]
    async fn test_turn_completes_and_hands_over() {
        let f = fixture(test_config(false), MockTransport::scripted(vec![Ok("Hello there")])).await;

        let outcome = f.controller.handle_wake(Wake::MessageAppended).await.unwrap();
        assert!(matches!(outcome, WakeOutcome::Advanced { .. }));

        let conversation = f.store.get(f.id).await.unwrap();
        assert_eq!(conversation.status, Status::Running);
        assert_eq!(conversation.turn, AgentSlot::B);

        let messages = f.store.list_messages(f.id, None).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].speaker, Speaker::Agent(AgentSlot::A));
        assert_eq!(messages[0].content, "Hello there");
        assert_eq!(f.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_narrated_turn_arms_gate() {
        let f = fixture(test_config(true), MockTransport::scripted(vec![Ok("Bonjour")])).await;

        let outcome = f.controller.handle_wake(Wake::MessageAppended).await.unwrap();
        let WakeOutcome::Gated { message_id } = outcome else {
            panic!("expected Gated, got {:?}", outcome);
        };

        let conversation = f.store.get(f.id).await.unwrap();
        assert_eq!(conversation.status, Status::WaitingForNarration);
        assert!(conversation.narration_gate_armed);
        // Turn only advances when playback finishes.
        assert_eq!(conversation.turn, AgentSlot::A);

        // Playback acknowledgement disarms the gate and hands the turn over.
        f.controller.release_gate(message_id).await.unwrap();
        let conversation = f.store.get(f.id).await.unwrap();
        assert_eq!(conversation.status, Status::Running);
        assert!(!conversation.narration_gate_armed);
        assert_eq!(conversation.turn, AgentSlot::B);
        assert_eq!(conversation.last_narrated_message_id, Some(message_id));
    }

    #[tokio::test]
    async fn test_narration_finished_chains_into_next_turn() {
        let f = fixture(
            test_config(true),
            MockTransport::scripted(vec![Ok("First"), Ok("Second")]),
        )
        .await;

        let outcome = f.controller.handle_wake(Wake::MessageAppended).await.unwrap();
        let WakeOutcome::Gated { message_id } = outcome else {
            panic!("expected Gated, got {:?}", outcome);
        };

        let outcome = f
            .controller
            .handle_wake(Wake::NarrationFinished { message_id })
            .await
            .unwrap();
        assert!(matches!(outcome, WakeOutcome::Gated { .. }));

        let messages = f.store.list_messages(f.id, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].speaker, Speaker::Agent(AgentSlot::B));
        assert_eq!(messages[1].content, "Second");
    }

    #[tokio::test]
    async fn test_wake_while_gated_is_ignored() {
        let f = fixture(test_config(true), MockTransport::scripted(vec![Ok("Hi")])).await;
        f.controller.handle_wake(Wake::MessageAppended).await.unwrap();

        let before = f.transport.call_count();
        let outcome = f.controller.handle_wake(Wake::MessageAppended).await.unwrap();
        assert_eq!(outcome, WakeOutcome::Ignored(IgnoreReason::Gated));
        assert_eq!(f.transport.call_count(), before);
    }

    #[tokio::test]
    async fn test_lookahead_at_limit_suppresses_generation() {
        let f = fixture(test_config(false), MockTransport::scripted(vec![])).await;

        // Three unheard agent messages, none narrated; the last one is Ben's
        // so it would otherwise be Ada's turn.
        for (slot, text) in [
            (AgentSlot::A, "one"),
            (AgentSlot::B, "two"),
            (AgentSlot::A, "three"),
        ] {
            f.store
                .append_message(f.id, NewMessage::new(Speaker::Agent(slot), text))
                .await
                .unwrap();
        }
        f.store
            .conditional_update(
                f.id,
                Precondition::any(),
                ConversationPatch::new().with_turn(AgentSlot::B),
            )
            .await
            .unwrap();

        let outcome = f.controller.handle_wake(Wake::MessageAppended).await.unwrap();
        assert_eq!(outcome, WakeOutcome::Ignored(IgnoreReason::LookaheadFull));
        assert_eq!(f.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_acting_agent_already_spoke_is_ignored() {
        let f = fixture(test_config(false), MockTransport::scripted(vec![])).await;
        f.store
            .append_message(f.id, NewMessage::new(Speaker::Agent(AgentSlot::A), "hi"))
            .await
            .unwrap();
        // turn is still A: the snapshot disagrees with the transcript, so the
        // wake is dropped rather than generating a double turn.
        let outcome = f.controller.handle_wake(Wake::MessageAppended).await.unwrap();
        assert_eq!(outcome, WakeOutcome::Ignored(IgnoreReason::NotOurTurn));
        assert_eq!(f.transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_err_the_conversation() {
        let f = fixture(
            test_config(false),
            MockTransport::scripted(vec![Err("rate limited"), Err("rate limited"), Err("rate limited")]),
        )
        .await;

        let outcome = f.controller.handle_wake(Wake::MessageAppended).await.unwrap();
        assert_eq!(outcome, WakeOutcome::Erred);
        assert_eq!(f.transport.call_count(), 3);

        let conversation = f.store.get(f.id).await.unwrap();
        assert_eq!(conversation.status, Status::Erred);
        let context = conversation.error_context.unwrap();
        let expected = Error::Generation {
            slot: AgentSlot::A,
            attempts: 3,
            message: "rate limited".into(),
        };
        assert_eq!(context, expected.to_string());

        // No partial message was persisted and the lock is released.
        assert!(f.store.list_messages(f.id, None).await.unwrap().is_empty());
        assert!(!f.controller.handle().is_generating());

        // Later wakes are inert.
        let outcome = f.controller.handle_wake(Wake::MessageAppended).await.unwrap();
        assert_eq!(outcome, WakeOutcome::Ignored(IgnoreReason::TerminalStatus));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_context_is_bounded() {
        let long = "x".repeat(4 * ERROR_CONTEXT_MAX_LEN);
        let f = fixture(
            test_config(false),
            MockTransport::scripted(vec![
                Err(long.as_str()),
                Err(long.as_str()),
                Err(long.as_str()),
            ]),
        )
        .await;

        f.controller.handle_wake(Wake::MessageAppended).await.unwrap();
        let conversation = f.store.get(f.id).await.unwrap();
        let context = conversation.error_context.unwrap();
        assert!(context.len() <= ERROR_CONTEXT_MAX_LEN);
        assert!(context.starts_with("agent A generation failed after 3 attempts:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_recover() {
        let f = fixture(
            test_config(false),
            MockTransport::scripted(vec![Err("blip"), Err("blip"), Ok("Recovered")]),
        )
        .await;
        let mut rx = f.controller.live().subscribe();

        let outcome = f.controller.handle_wake(Wake::MessageAppended).await.unwrap();
        assert!(matches!(outcome, WakeOutcome::Advanced { .. }));
        assert_eq!(f.transport.call_count(), 3);

        let messages = f.store.list_messages(f.id, None).await.unwrap();
        assert_eq!(messages[0].content, "Recovered");

        let mut retries = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let LiveEvent::Retrying {
                attempt, delay_ms, ..
            } = event
            {
                retries.push((attempt, delay_ms));
            }
        }
        assert_eq!(retries, vec![(1, 2000), (2, 4000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_wakes_run_one_generation() {
        let f = fixture(
            test_config(true),
            MockTransport::with_delay(vec![Ok("Hi")], Duration::from_millis(50)),
        )
        .await;
        let controller = Arc::new(f.controller);

        let wakes: Vec<_> = (0..4)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move { controller.handle_wake(Wake::MessageAppended).await })
            })
            .collect();

        let mut outcomes = Vec::new();
        for wake in wakes {
            outcomes.push(wake.await.unwrap().unwrap());
        }

        assert_eq!(f.transport.call_count(), 1);
        let gated = outcomes
            .iter()
            .filter(|o| matches!(o, WakeOutcome::Gated { .. }))
            .count();
        assert_eq!(gated, 1);
        assert!(outcomes.iter().all(|o| matches!(
            o,
            WakeOutcome::Gated { .. } | WakeOutcome::Ignored(_)
        )));
        assert_eq!(f.store.list_messages(f.id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_durable_and_final() {
        let f = fixture(test_config(false), MockTransport::scripted(vec![Ok("Hi")])).await;

        let outcome = f.controller.handle_wake(Wake::Stop).await.unwrap();
        assert_eq!(outcome, WakeOutcome::Stopped);

        let conversation = f.store.get(f.id).await.unwrap();
        assert_eq!(conversation.status, Status::Stopped);

        let outcome = f.controller.handle_wake(Wake::MessageAppended).await.unwrap();
        assert_eq!(outcome, WakeOutcome::Ignored(IgnoreReason::TerminalStatus));
        assert_eq!(f.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_does_not_overwrite_erred() {
        let f = fixture(test_config(false), MockTransport::scripted(vec![])).await;
        f.store
            .conditional_update(
                f.id,
                Precondition::any(),
                ConversationPatch::new()
                    .with_status(Status::Erred)
                    .with_error_context("agent A generation failed after 3 attempts: down"),
            )
            .await
            .unwrap();

        f.controller.handle_wake(Wake::Stop).await.unwrap();
        let conversation = f.store.get(f.id).await.unwrap();
        assert_eq!(conversation.status, Status::Erred);
        assert!(conversation.error_context.is_some());
    }

    #[tokio::test]
    async fn test_request_framing_for_acting_agent() {
        let f = fixture(
            test_config(false),
            MockTransport::scripted(vec![Ok("Right")]),
        )
        .await;

        f.store
            .append_message(f.id, NewMessage::new(Speaker::System, "Debate tabs."))
            .await
            .unwrap();
        f.store
            .append_message(f.id, NewMessage::new(Speaker::Agent(AgentSlot::B), "Tabs."))
            .await
            .unwrap();
        f.store
            .append_message(f.id, NewMessage::new(Speaker::Agent(AgentSlot::A), "Spaces."))
            .await
            .unwrap();
        f.store
            .conditional_update(
                f.id,
                Precondition::any(),
                ConversationPatch::new().with_turn(AgentSlot::B),
            )
            .await
            .unwrap();

        f.controller.handle_wake(Wake::MessageAppended).await.unwrap();

        let requests = f.transport.requests.lock();
        let (slot, request) = &requests[0];
        assert_eq!(*slot, AgentSlot::B);
        assert_eq!(
            request.system_prompt.as_deref(),
            Some("You are Ben.")
        );
        let roles: Vec<ChatRole> = request.messages.iter().map(|m| m.role).collect();
        // System and Ada's message read as user input; Ben's own turn as
        // assistant output.
        assert_eq!(
            roles,
            vec![ChatRole::User, ChatRole::Assistant, ChatRole::User]
        );
    }

    #[tokio::test]
    async fn test_language_instruction_appended_to_system_prompt() {
        let mut config = test_config(false);
        config.language = Some("French".to_string());
        let f = fixture(config, MockTransport::scripted(vec![Ok("Oui")])).await;

        f.controller.handle_wake(Wake::MessageAppended).await.unwrap();

        let requests = f.transport.requests.lock();
        let prompt = requests[0].1.system_prompt.as_deref().unwrap();
        assert!(prompt.ends_with("Always respond in French."));
    }
}
