//! duet - two agents in conversation, narrated turn by turn

mod config;
mod narrator;
mod store;

use clap::Parser;
use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use duet_ai::{ProviderKind, SpeechBackend};
use duet_core::{
    ConversationId, DraftPhase, LiveEvent, MessageId, Narrator, Orchestrator, ResumeOutcome,
    SessionConfig, Speaker, Status,
};
use tokio::sync::broadcast::error::RecvError;

/// How long to wait for synthesis before releasing a gate anyway
const GATE_FALLBACK: Duration = Duration::from_secs(60);

/// duet - two agents in conversation
#[derive(Parser, Debug)]
#[command(name = "duet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path (default: ~/.config/duet/config.toml)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Resume a previous conversation by ID
    #[arg(long)]
    resume: Option<String>,

    /// List saved conversations
    #[arg(long)]
    sessions: bool,

    /// Stop after this many agent messages
    #[arg(long, default_value_t = 12)]
    max_messages: usize,

    /// Disable narration even if voices are configured
    #[arg(long)]
    no_narration: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing; stderr so it never interleaves with the transcript
    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("duet=debug")
            .with_writer(std::io::stderr)
            .init();
    }

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    // Load config file
    let cfg = match &args.config {
        Some(path) => config::Config::load_from(path)?,
        None => config::Config::load(),
    };

    let data_dir = cfg.data_dir();
    let store = Arc::new(store::JsonlStore::open(data_dir.join("conversations"))?);

    // List conversations and exit
    if args.sessions {
        return list_conversations(&store);
    }

    let keys = cfg.resolved_api_keys();

    // Narration is best-effort: no speech key just means gates auto-release.
    let narrator: Option<Arc<dyn Narrator>> = if args.no_narration {
        None
    } else {
        match SpeechBackend::resolve(keys.get(ProviderKind::OpenAi)) {
            Ok(speech) => Some(Arc::new(narrator::FileNarrator::new(
                speech,
                data_dir.join("audio"),
            )?)),
            Err(e) => {
                eprintln!("Warning: narration disabled ({})", e);
                None
            }
        }
    };
    let has_narrator = narrator.is_some();

    let mut orchestrator = Orchestrator::new(store, keys);
    if let Some(narrator) = narrator {
        orchestrator = orchestrator.with_narrator(narrator);
    }

    // Resume or start
    let (id, session_config): (ConversationId, SessionConfig) =
        if let Some(resume_id) = &args.resume {
            let id: ConversationId = resume_id
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid conversation id: {}", resume_id))?;
            match orchestrator.resume(id).await? {
                ResumeOutcome::Active { config, status } => {
                    println!("Resuming conversation {} ({})", id, status_str(status));
                    (id, config)
                }
                ResumeOutcome::Terminal {
                    status,
                    error_context,
                } => {
                    println!("Conversation {} already ended: {}", id, status_str(status));
                    if let Some(context) = error_context {
                        println!("  {}", context);
                    }
                    return Ok(());
                }
                ResumeOutcome::TimedOut => {
                    anyhow::bail!("conversation {} is not readable right now; try again", id);
                }
            }
        } else {
            let session_config = cfg.to_session_config(!args.no_narration)?;
            let id = orchestrator.start_session(session_config.clone()).await?;
            println!("Conversation {}", id);
            (id, session_config)
        };

    let mut rx = orchestrator
        .subscribe(id)
        .ok_or_else(|| anyhow::anyhow!("no live session for {}", id))?;

    // Characters already printed per draft, for incremental output
    let mut printed: HashMap<MessageId, usize> = HashMap::new();
    let mut agent_messages = 0usize;
    let mut pending_gate: Option<MessageId> = None;
    let mut stopping = false;

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if !stopping {
                    eprintln!("\nStopping...");
                    orchestrator.stop(id).await?;
                    stopping = true;
                }
                continue;
            }
            _ = tokio::time::sleep(GATE_FALLBACK), if pending_gate.is_some() => {
                // Synthesis never reported back; release the gate anyway.
                if let Some(message_id) = pending_gate.take() {
                    let _ = orchestrator.notify_narration_finished(id, message_id).await;
                }
                continue;
            }
            event = rx.recv() => match event {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        };

        match event {
            LiveEvent::Draft { draft } => {
                let count = printed.entry(draft.draft_id).or_insert(0);
                if *count == 0 {
                    print!("\n{}: ", speaker_name(&session_config, draft.speaker));
                }
                let chars: Vec<char> = draft.text.chars().collect();
                if chars.len() > *count {
                    let new_text: String = chars[*count..].iter().collect();
                    print!("{}", new_text);
                    std::io::stdout().flush().ok();
                    *count = chars.len();
                }
                if draft.phase != DraftPhase::Streaming {
                    println!();
                }
            }
            LiveEvent::Retrying {
                slot,
                attempt,
                delay_ms,
            } => {
                eprintln!(
                    "\n[{}: retry {} in {}ms]",
                    session_config.agent(slot).name,
                    attempt,
                    delay_ms
                );
            }
            LiveEvent::MessageAppended { message } => {
                printed.remove(&message.id);
                if message.speaker.is_agent() {
                    agent_messages += 1;
                    if agent_messages >= args.max_messages && !stopping {
                        orchestrator.stop(id).await?;
                        stopping = true;
                    }
                }
            }
            LiveEvent::GateArmed { message_id } => {
                if has_narrator {
                    pending_gate = Some(message_id);
                } else {
                    // Nothing will play; keep the conversation moving.
                    let _ = orchestrator.notify_narration_finished(id, message_id).await;
                }
            }
            LiveEvent::NarrationReady {
                message_id,
                audio_ref,
            } => {
                println!("[audio] {}", audio_ref);
                if pending_gate == Some(message_id) {
                    pending_gate = None;
                }
                let _ = orchestrator.notify_narration_finished(id, message_id).await;
            }
            LiveEvent::GateReleased { .. } => {}
            LiveEvent::Erred { context } => {
                eprintln!("\nError: {}", context);
                break;
            }
            LiveEvent::Stopped => break,
        }
    }

    println!("\nConversation saved: {}", id);
    println!("Resume with: duet --resume {}", id);
    Ok(())
}

fn speaker_name(config: &SessionConfig, speaker: Speaker) -> String {
    match speaker {
        Speaker::Agent(slot) => config.agent(slot).name.clone(),
        Speaker::User => "You".to_string(),
        Speaker::System => "System".to_string(),
    }
}

fn status_str(status: Status) -> &'static str {
    match status {
        Status::Running => "running",
        Status::WaitingForNarration => "waiting for narration",
        Status::Stopped => "stopped",
        Status::Erred => "erred",
    }
}

fn list_conversations(store: &store::JsonlStore) -> anyhow::Result<()> {
    let conversations = store.list_conversations()?;
    if conversations.is_empty() {
        println!("No saved conversations found.");
        return Ok(());
    }

    println!("Saved conversations:\n");
    println!(
        "{:<38} {:<24} {:<20} Agents",
        "ID", "Status", "Last activity"
    );
    println!("{}", "-".repeat(100));
    for c in conversations {
        println!(
            "{:<38} {:<24} {:<20} {} / {}",
            c.id,
            status_str(c.status),
            c.last_activity_at.format("%Y-%m-%d %H:%M:%S"),
            c.config.agent_a.name,
            c.config.agent_b.name
        );
    }
    println!("\nResume with: duet --resume <id>");
    Ok(())
}
