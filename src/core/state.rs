use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::config::{Config, TtsProvider};

/// Contents of a story's `info.yaml`, written once when the story is created.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct StoryInfo {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub query_local: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub llm_provider: String,
    #[serde(default)]
    pub llm_url: String,
    #[serde(default)]
    pub llm_model: String,
    #[serde(default)]
    pub llm_temperature: f32,
    #[serde(default)]
    pub llm_max_tokens: u32,
    #[serde(default)]
    pub tts_provider: String,
    #[serde(default)]
    pub tts_url: String,
    #[serde(default)]
    pub tts_model: String,
    #[serde(default)]
    pub tts_voice: String,
    #[serde(default)]
    pub tts_format: String,
}

impl StoryInfo {
    /// `tts_provider` is the provider actually in use, which differs from the
    /// configured one after a fallback.
    pub fn from_config(
        config: &Config,
        tts_provider: TtsProvider,
        query: &str,
        query_local: &str,
    ) -> Self {
        Self {
            query: query.to_string(),
            query_local: query_local.to_string(),
            language: config.language.clone(),
            llm_provider: config.llm.provider.as_str().to_string(),
            llm_url: config.llm.base_url(),
            llm_model: config.llm.model.clone(),
            llm_temperature: config.llm.temperature,
            llm_max_tokens: config.llm.max_tokens,
            tts_provider: tts_provider.as_str().to_string(),
            tts_url: config.tts.base_url(tts_provider),
            tts_model: config.tts.model.clone().unwrap_or_default(),
            tts_voice: config.tts.voice.clone(),
            tts_format: config.tts.format.clone(),
        }
    }
}

/// What the model gets to see of an existing story when continuing it.
#[derive(Clone, Debug, Default)]
pub struct ContinuationContext {
    pub original_query: Option<String>,
    /// Latest paragraphs in index order, trimmed.
    pub paragraphs: Vec<String>,
    pub next_index: usize,
}

#[derive(Clone, Debug)]
pub struct StorySummary {
    pub name: String,
    pub path: PathBuf,
    pub query: Option<String>,
    pub paragraph_count: usize,
}
