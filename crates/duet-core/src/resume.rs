//! Picking a persisted conversation back up.
//!
//! Resume never invents state: a terminal conversation stays terminal, and a
//! live one is only handed back once its pickup is durably visible in the
//! store. A store that stays unreadable long enough yields `TimedOut` rather
//! than guessing.

use std::sync::Arc;
use std::time::Duration;

use crate::conversation::{ConversationId, SessionConfig, Status};
use crate::error::Result;
use crate::store::{ConversationPatch, ConversationStore, Precondition};

const DEFAULT_POLL_ATTEMPTS: u32 = 10;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// What resuming a conversation found
#[derive(Debug, Clone)]
pub enum ResumeOutcome {
    /// The conversation is live and may be re-attached to an actor
    Active {
        config: SessionConfig,
        status: Status,
    },
    /// The conversation ended; it is reported, never restarted
    Terminal {
        status: Status,
        error_context: Option<String>,
    },
    /// The store never settled into an observable state
    TimedOut,
}

/// Re-attaches persisted conversations to a running process.
pub struct ResumeCoordinator {
    store: Arc<dyn ConversationStore>,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl ResumeCoordinator {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            store,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll(mut self, attempts: u32, interval: Duration) -> Self {
        self.poll_attempts = attempts;
        self.poll_interval = interval;
        self
    }

    /// Classify and re-assert a conversation. Idempotent: resuming an
    /// already-resumed conversation reports the same outcome.
    pub async fn resume(&self, id: ConversationId) -> Result<ResumeOutcome> {
        let conversation = self.store.get(id).await?;
        if conversation.status.is_terminal() {
            return Ok(ResumeOutcome::Terminal {
                status: conversation.status,
                error_context: conversation.error_context,
            });
        }

        // Re-assert the live state so the pickup is durably visible. A gated
        // conversation keeps waiting for playback; re-arming is harmless.
        let patch = match conversation.status {
            Status::WaitingForNarration => ConversationPatch::new().with_gate(true),
            _ => ConversationPatch::new(),
        };
        let applied = match self
            .store
            .conditional_update(id, Precondition::status(conversation.status), patch)
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                tracing::warn!(conversation = %id, "resume write not yet observable: {}", e);
                false
            }
        };
        if applied {
            return Ok(ResumeOutcome::Active {
                config: conversation.config,
                status: conversation.status,
            });
        }

        // Lost a race or the store is flaky; poll for the settled state.
        for _ in 0..self.poll_attempts {
            tokio::time::sleep(self.poll_interval).await;
            match self.store.get(id).await {
                Ok(c) if c.status.is_terminal() => {
                    return Ok(ResumeOutcome::Terminal {
                        status: c.status,
                        error_context: c.error_context,
                    });
                }
                Ok(c) => {
                    return Ok(ResumeOutcome::Active {
                        config: c.config,
                        status: c.status,
                    });
                }
                Err(e) => {
                    tracing::warn!(conversation = %id, "resume read not yet observable: {}", e);
                }
            }
        }
        Ok(ResumeOutcome::TimedOut)
    }
}
