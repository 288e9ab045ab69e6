//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use duet_ai::{ModelConfig, ProviderKind, VoiceConfig};
use duet_core::{AgentConfig, AgentSlot, BackoffConfig, SessionConfig};

/// Configuration for duet
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent_a: AgentEntry,
    pub agent_b: AgentEntry,
    /// Initial framing both agents see
    pub opening_prompt: Option<String>,
    /// Language both agents respond in
    pub language: Option<String>,
    /// Which agent speaks first ("a" or "b")
    pub first_turn: Option<String>,
    /// Maximum unheard agent messages before generation pauses
    pub lookahead_limit: Option<usize>,
    /// Provider retries per turn
    pub max_retries: Option<u32>,
    /// Base backoff delay in milliseconds
    pub retry_base_ms: Option<u64>,
    /// Where conversations and audio are stored
    pub data_dir: Option<String>,
    /// API keys (alternative to environment variables)
    #[serde(default)]
    pub api_keys: ApiKeys,
}

/// One agent seat in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentEntry {
    pub name: String,
    /// Provider ("openai" or "anthropic")
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Narration voice; leaving it unset disables the gate for this agent
    pub voice: Option<String>,
    pub tts_model: Option<String>,
    pub speech_speed: Option<f32>,
}

impl Default for AgentEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: String::new(),
            base_url: None,
            max_tokens: None,
            temperature: None,
            voice: None,
            tts_model: None,
            speech_speed: None,
        }
    }
}

/// API key configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
}

impl AgentEntry {
    fn provider_kind(&self) -> anyhow::Result<ProviderKind> {
        match self.provider.to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            other => anyhow::bail!(
                "unknown provider {:?} for agent {:?} (expected \"openai\" or \"anthropic\")",
                other,
                self.name
            ),
        }
    }

    fn to_agent_config(&self, slot: AgentSlot) -> anyhow::Result<AgentConfig> {
        let name = if self.name.is_empty() {
            format!("Agent {}", slot)
        } else {
            self.name.clone()
        };
        let model = ModelConfig {
            provider: self.provider_kind()?,
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        let voice = self.voice.as_ref().map(|v| VoiceConfig {
            model: self
                .tts_model
                .clone()
                .unwrap_or_else(|| "tts-1".to_string()),
            voice: v.clone(),
            speed: self.speech_speed,
        });
        Ok(AgentConfig {
            name,
            model,
            system_prompt: self.system_prompt.clone(),
            voice,
        })
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("duet")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        // Check for DUET_CONFIG_PATH env var first
        if let Ok(path) = std::env::var("DUET_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from a specific file
    pub fn load_from(path: &PathBuf) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path.display(), e))
    }

    /// Load config from the default location, falling back to defaults
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {}", e);
                Self::default()
            }
        }
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        Self::init_at(Self::config_path())
    }

    fn init_at(path: PathBuf) -> std::io::Result<PathBuf> {
        if path.exists() {
            return Ok(path);
        }
        // A bare filename (e.g. via DUET_CONFIG_PATH) has an empty parent.
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }

    /// Resolved API keys: config file first, environment second
    pub fn resolved_api_keys(&self) -> duet_ai::ApiKeys {
        let env = duet_ai::ApiKeys::from_env();
        duet_ai::ApiKeys {
            openai: self.api_keys.openai.clone().or(env.openai),
            anthropic: self.api_keys.anthropic.clone().or(env.anthropic),
        }
    }

    /// Where conversations and narration audio live
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return PathBuf::from(dir);
        }
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("duet")
    }

    /// Build the session configuration. `narration` disabled strips voices.
    pub fn to_session_config(&self, narration: bool) -> anyhow::Result<SessionConfig> {
        let mut agent_a = self.agent_a.to_agent_config(AgentSlot::A)?;
        let mut agent_b = self.agent_b.to_agent_config(AgentSlot::B)?;
        if !narration {
            agent_a.voice = None;
            agent_b.voice = None;
        }

        let first_turn = match self.first_turn.as_deref() {
            Some("b") | Some("B") => AgentSlot::B,
            _ => AgentSlot::A,
        };

        let mut backoff = BackoffConfig::default();
        if let Some(max_retries) = self.max_retries {
            backoff.max_retries = max_retries;
        }
        if let Some(base_ms) = self.retry_base_ms {
            backoff.base = Duration::from_millis(base_ms);
        }

        Ok(SessionConfig {
            agent_a,
            agent_b,
            opening_prompt: self.opening_prompt.clone(),
            language: self.language.clone(),
            first_turn,
            lookahead_limit: self
                .lookahead_limit
                .unwrap_or(duet_core::lookahead::DEFAULT_LOOKAHEAD_LIMIT),
            backoff,
        })
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# duet configuration file
# Place at ~/.config/duet/config.toml (Linux/Mac) or %APPDATA%\duet\config.toml (Windows)

# Initial framing both agents see (optional)
opening_prompt = "Debate whether cities should ban private cars. Keep replies short."

# Language both agents respond in (optional)
# language = "French"

# Which agent speaks first ("a" or "b", default "a")
first_turn = "a"

# How many unheard agent turns may pile up before generation pauses (default 3)
lookahead_limit = 3

# Provider retries per turn (default 2) and base backoff delay (default 1000ms)
# max_retries = 2
# retry_base_ms = 1000

# Where conversations and narration audio are stored (optional)
# data_dir = "~/.local/share/duet"

[agent_a]
name = "Ada"
provider = "openai"
model = "gpt-4o-mini"
system_prompt = "You are Ada, a pragmatic urban planner. Argue from data."
# Uncomment to narrate this agent's turns:
# voice = "alloy"
# tts_model = "tts-1"
# speech_speed = 1.0

[agent_b]
name = "Ben"
provider = "anthropic"
model = "claude-3-5-haiku-latest"
system_prompt = "You are Ben, a skeptical economist. Argue from incentives."
# voice = "onyx"

# API keys (optional - can also use environment variables)
# It's recommended to use environment variables instead for security
[api_keys]
# openai = "sk-..."
# anthropic = "sk-ant-..."
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.agent_a.name, "Ada");
        assert_eq!(config.agent_b.provider, "anthropic");
        assert_eq!(config.lookahead_limit, Some(3));
        assert_eq!(config.first_turn.as_deref(), Some("a"));
    }

    #[test]
    fn test_session_config_mapping() {
        let mut config: Config = toml::from_str(example_config()).unwrap();
        config.agent_a.voice = Some("alloy".to_string());
        config.max_retries = Some(5);
        config.retry_base_ms = Some(250);

        let session = config.to_session_config(true).unwrap();
        assert_eq!(session.agent_a.name, "Ada");
        assert_eq!(session.agent_a.model.provider, ProviderKind::OpenAi);
        assert!(session.agent_a.narration_enabled());
        assert!(!session.agent_b.narration_enabled());
        assert_eq!(session.backoff.max_retries, 5);
        assert_eq!(session.backoff.base, Duration::from_millis(250));

        // Disabling narration strips voices.
        let muted = config.to_session_config(false).unwrap();
        assert!(!muted.agent_a.narration_enabled());
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let mut config = Config::default();
        config.agent_a.provider = "gemini".to_string();
        assert!(config.to_session_config(true).is_err());
    }

    #[test]
    fn test_unnamed_agent_gets_slot_name() {
        let config = Config::default();
        let session = config.to_session_config(true).unwrap();
        assert_eq!(session.agent_a.name, "Agent A");
        assert_eq!(session.agent_b.name, "Agent B");
    }

    #[test]
    fn test_init_creates_missing_directories() {
        let root = std::env::temp_dir().join(format!("duet-config-test-{}", uuid::Uuid::new_v4()));
        let path = Config::init_at(root.join("nested").join("config.toml")).unwrap();
        assert!(path.exists());
        let config: Config = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.agent_a.name, "Ada");
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_init_with_bare_filename() {
        // A path with no directory component must not trip directory creation.
        let name = format!("duet-config-test-{}.toml", uuid::Uuid::new_v4());
        let path = Config::init_at(PathBuf::from(&name)).unwrap();
        assert!(path.exists());
        fs::remove_file(path).unwrap();
    }
}
