use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;

use super::{SynthesisRequest, TtsClient, Voice};
use crate::core::config::TtsProvider;

const DEFAULT_MODEL: &str = "tts-1";
const SUPPORTED_FORMATS: &[&str] = &["mp3", "opus", "aac", "flac", "wav", "pcm"];
const VOICES: &[&str] = &[
    "alloy", "ash", "coral", "echo", "fable", "nova", "onyx", "sage", "shimmer",
];

pub struct OpenAiTtsClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiTtsClient {
    pub fn new(api_key: &str, base_url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

#[async_trait]
impl TtsClient for OpenAiTtsClient {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        if !SUPPORTED_FORMATS.contains(&request.format.as_str()) {
            return Err(anyhow!("OpenAI TTS does not support format '{}'", request.format));
        }
        let url = format!("{}/audio/speech", self.base_url);
        let body = SpeechRequest {
            model: request.model.as_deref().unwrap_or(DEFAULT_MODEL),
            input: &request.text,
            voice: &request.voice,
            response_format: &request.format,
        };

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(anyhow!("OpenAI TTS error: {} - {}", status, error_text));
        }

        Ok(resp.bytes().await?.to_vec())
    }

    async fn list_voices(&self) -> Result<Vec<Voice>> {
        Ok(VOICES
            .iter()
            .map(|id| Voice {
                id: id.to_string(),
                name: id.to_string(),
                description: None,
                gender: None,
                provider: TtsProvider::OpenAI,
            })
            .collect())
    }

    fn supported_formats(&self) -> &'static [&'static str] {
        SUPPORTED_FORMATS
    }

    fn provider(&self) -> TtsProvider {
        TtsProvider::OpenAI
    }
}
