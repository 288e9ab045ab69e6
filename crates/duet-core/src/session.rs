//! The per-conversation actor.
//!
//! Each live conversation is owned by exactly one task that drains a bounded
//! mailbox of wakes. Serializing all progress through the mailbox is what
//! makes the controller's read-then-decide guard race-free in practice: there
//! is never a second task calling into the same controller.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::controller::{TurnController, Wake, WakeOutcome};
use crate::handle::SessionHandle;
use crate::live::LiveChannel;

/// Mailbox depth. Wakes are coalescing by nature (each one re-reads current
/// state), so a full mailbox only ever drops redundant pokes.
pub(crate) const MAILBOX_CAPACITY: usize = 64;

/// A spawned conversation: its mailbox, its handle, and its event channel.
pub struct SessionActor {
    wake_tx: mpsc::Sender<Wake>,
    handle: SessionHandle,
    live: LiveChannel,
    task: JoinHandle<()>,
}

impl SessionActor {
    /// Spawn the actor task for a controller
    pub fn spawn(controller: TurnController) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = controller.handle().clone();
        let live = controller.live().clone();
        let task = tokio::spawn(run_loop(controller, wake_rx));
        Self {
            wake_tx,
            handle,
            live,
            task,
        }
    }

    /// Enqueue a wake. Returns false if the actor has already shut down.
    pub async fn wake(&self, wake: Wake) -> bool {
        self.wake_tx.send(wake).await.is_ok()
    }

    /// A sender usable without borrowing the actor
    pub(crate) fn sender(&self) -> mpsc::Sender<Wake> {
        self.wake_tx.clone()
    }

    /// The session's cancellation/in-flight handle
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// The session's live event channel
    pub fn live(&self) -> &LiveChannel {
        &self.live
    }

    /// Forcibly abort the actor task (used on orchestrator teardown)
    pub fn abort_task(&self) {
        self.task.abort();
    }
}

async fn run_loop(controller: TurnController, mut wake_rx: mpsc::Receiver<Wake>) {
    let conversation_id = controller.conversation_id();
    while let Some(wake) = wake_rx.recv().await {
        let stopping = matches!(wake, Wake::Stop);
        match controller.handle_wake(wake).await {
            Ok(mut outcome) => {
                // A completed un-narrated turn immediately wakes the other
                // seat; the lookahead bound keeps the chain finite.
                while let WakeOutcome::Advanced { .. } = outcome {
                    match controller.handle_wake(Wake::MessageAppended).await {
                        Ok(next) => outcome = next,
                        Err(e) => {
                            tracing::error!(
                                conversation = %conversation_id,
                                "wake processing failed: {}",
                                e
                            );
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    conversation = %conversation_id,
                    "wake processing failed: {}",
                    e
                );
            }
        }
        if stopping {
            break;
        }
    }
}
