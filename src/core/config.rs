use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_stories")]
    pub stories_folder: String,

    /// File holding the system prompt. The built-in prompt is used when unset.
    #[serde(default)]
    pub prompt_file: Option<String>,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub tts: TtsConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub story: StoryConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[value(rename_all = "lower")]
pub enum LlmProvider {
    #[default]
    Gemini,
    Deepseek,
    Ollama,
    OpenAI,
}

impl LlmProvider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            LlmProvider::Deepseek => "https://api.deepseek.com/v1",
            LlmProvider::Ollama => "http://127.0.0.1:11434/v1",
            LlmProvider::OpenAI => "https://api.openai.com/v1",
        }
    }

    /// Environment variable consulted when no key is configured.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            LlmProvider::Gemini => Some("GEMINI_API_KEY"),
            LlmProvider::Deepseek => Some("DEEPSEEK_API_KEY"),
            LlmProvider::Ollama => None,
            LlmProvider::OpenAI => Some("OPENAI_API_KEY"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Gemini => "gemini",
            LlmProvider::Deepseek => "deepseek",
            LlmProvider::Ollama => "ollama",
            LlmProvider::OpenAI => "openai",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default = "default_llm_model")]
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model: default_llm_model(),
            base_url: None,
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl LlmConfig {
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.provider.default_base_url().to_string())
    }

    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_key(self.api_key.as_deref(), self.provider.api_key_env())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[value(rename_all = "lower")]
pub enum TtsProvider {
    #[default]
    ElevenLabs,
    OpenAI,
}

impl TtsProvider {
    pub const ALL: [TtsProvider; 2] = [TtsProvider::ElevenLabs, TtsProvider::OpenAI];

    pub fn as_str(&self) -> &'static str {
        match self {
            TtsProvider::ElevenLabs => "elevenlabs",
            TtsProvider::OpenAI => "openai",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TtsConfig {
    #[serde(default)]
    pub provider: TtsProvider,
    #[serde(default = "default_tts_voice")]
    pub voice: String,
    /// Provider model id. Each provider falls back to its own default when unset.
    pub model: Option<String>,
    #[serde(default = "default_tts_format")]
    pub format: String,
    #[serde(default)]
    pub elevenlabs: ElevenLabsConfig,
    #[serde(default)]
    pub openai: OpenAiTtsConfig,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: TtsProvider::default(),
            voice: default_tts_voice(),
            model: None,
            format: default_tts_format(),
            elevenlabs: ElevenLabsConfig::default(),
            openai: OpenAiTtsConfig::default(),
        }
    }
}

impl TtsConfig {
    pub fn base_url(&self, provider: TtsProvider) -> String {
        match provider {
            TtsProvider::ElevenLabs => self.elevenlabs.base_url.clone(),
            TtsProvider::OpenAI => self.openai.base_url.clone(),
        }
    }

    pub fn resolve_api_key(&self, provider: TtsProvider) -> Option<String> {
        match provider {
            TtsProvider::ElevenLabs => {
                resolve_key(self.elevenlabs.api_key.as_deref(), Some("ELEVENLABS_API_KEY"))
            }
            TtsProvider::OpenAI => {
                resolve_key(self.openai.api_key.as_deref(), Some("OPENAI_API_KEY"))
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ElevenLabsConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_elevenlabs_base_url")]
    pub base_url: String,
    #[serde(default = "default_stability")]
    pub stability: f32,
    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f32,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_elevenlabs_base_url(),
            stability: default_stability(),
            similarity_boost: default_similarity_boost(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAiTtsConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

impl Default for OpenAiTtsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_openai_base_url(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[value(rename_all = "lower")]
pub enum SoundDriver {
    #[default]
    Alsa,
    Rodio,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AudioConfig {
    #[serde(default)]
    pub driver: SoundDriver,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoryConfig {
    #[serde(default = "default_continuation_patterns")]
    pub continuation_patterns: Vec<String>,

    /// How many of the latest paragraphs are handed to the model when continuing.
    #[serde(default = "default_context_paragraphs")]
    pub context_paragraphs: usize,

    #[serde(default)]
    pub ignore_cache: bool,

    pub story_request: Option<String>,

    #[serde(default = "default_story_request_template")]
    pub story_request_template: String,

    #[serde(default)]
    pub query_guard: String,

    #[serde(default)]
    pub flush_trailing_paragraph: bool,

    #[serde(default = "default_true")]
    pub replay_on_continue: bool,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            continuation_patterns: default_continuation_patterns(),
            context_paragraphs: default_context_paragraphs(),
            ignore_cache: false,
            story_request: None,
            story_request_template: default_story_request_template(),
            query_guard: String::new(),
            flush_trailing_paragraph: false,
            replay_on_continue: true,
        }
    }
}

fn resolve_key(configured: Option<&str>, env: Option<&str>) -> Option<String> {
    configured
        .filter(|k| !k.trim().is_empty())
        .map(|k| k.to_string())
        .or_else(|| env.and_then(|name| std::env::var(name).ok()))
        .filter(|k| !k.trim().is_empty())
}

fn default_stories() -> String {
    "stories".to_string()
}
fn default_language() -> String {
    "en".to_string()
}
fn default_llm_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_temperature() -> f32 {
    1.0
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_tts_voice() -> String {
    "nova".to_string()
}
fn default_tts_format() -> String {
    "mp3".to_string()
}
fn default_elevenlabs_base_url() -> String {
    "https://api.elevenlabs.io".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_stability() -> f32 {
    0.5
}
fn default_similarity_boost() -> f32 {
    0.75
}
fn default_continuation_patterns() -> Vec<String> {
    [
        "continue the story",
        "tell me more",
        "what happens next",
        "continue",
        "keep going",
        "more story",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_context_paragraphs() -> usize {
    10
}
fn default_story_request_template() -> String {
    "tell me a story about {request}".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stories_folder: default_stories(),
            prompt_file: None,
            language: default_language(),
            llm: LlmConfig::default(),
            tts: TtsConfig::default(),
            audio: AudioConfig::default(),
            story: StoryConfig::default(),
        }
    }
}

impl Config {
    /// Loads the YAML config. A missing file yields the defaults so that
    /// credentials can come from the environment alone.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        if !path.exists() {
            log::info!("{} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.stories_folder)?;
        Ok(())
    }

    pub fn stories_path(&self) -> PathBuf {
        PathBuf::from(&self.stories_folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
stories_folder: my_stories
llm:
  provider: ollama
  model: llama3.2
tts:
  provider: openai
  format: wav
audio:
  driver: rodio
story:
  context_paragraphs: 4
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.stories_folder, "my_stories");
        assert_eq!(config.llm.provider, LlmProvider::Ollama);
        assert_eq!(config.llm.base_url(), "http://127.0.0.1:11434/v1");
        assert_eq!(config.llm.max_tokens, 2000);
        assert_eq!(config.tts.provider, TtsProvider::OpenAI);
        assert_eq!(config.tts.format, "wav");
        assert_eq!(config.tts.voice, "nova");
        assert_eq!(config.audio.driver, SoundDriver::Rodio);
        assert_eq!(config.story.context_paragraphs, 4);
        assert!(config.story.replay_on_continue);
        assert!(!config.story.flush_trailing_paragraph);
        assert!(config
            .story
            .continuation_patterns
            .contains(&"tell me more".to_string()));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let config = Config::load(Some(&temp_dir.path().join("nope.yml")))?;
        assert_eq!(config.stories_folder, "stories");
        assert_eq!(config.llm.provider, LlmProvider::Gemini);
        Ok(())
    }

    #[test]
    fn test_load_written_config() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("config.yml");
        let mut config = Config::default();
        config.tts.voice = "rachel".to_string();
        config.story.ignore_cache = true;
        fs::write(&path, serde_yaml_ng::to_string(&config)?)?;

        let loaded = Config::load(Some(&path))?;
        assert_eq!(loaded.tts.voice, "rachel");
        assert!(loaded.story.ignore_cache);
        Ok(())
    }

    #[test]
    fn test_configured_key_wins_over_env() {
        let llm = LlmConfig {
            api_key: Some("from-config".to_string()),
            ..LlmConfig::default()
        };
        assert_eq!(llm.resolve_api_key().as_deref(), Some("from-config"));

        let ollama = LlmConfig {
            provider: LlmProvider::Ollama,
            api_key: Some("   ".to_string()),
            ..LlmConfig::default()
        };
        assert_eq!(ollama.resolve_api_key(), None);
    }

    #[test]
    fn test_cli_names_match_yaml_names() {
        assert_eq!(
            <TtsProvider as ValueEnum>::from_str("elevenlabs", false),
            Ok(TtsProvider::ElevenLabs)
        );
        assert_eq!(
            <LlmProvider as ValueEnum>::from_str("openai", false),
            Ok(LlmProvider::OpenAI)
        );
        let yaml: SoundDriver = serde_yaml_ng::from_str("alsa").unwrap();
        assert_eq!(<SoundDriver as ValueEnum>::from_str("alsa", false), Ok(yaml));
    }
}
