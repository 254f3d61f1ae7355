use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use super::{SynthesisRequest, TtsClient, Voice};
use crate::core::config::TtsProvider;
use crate::utils::audio::{pcm_to_wav, PCM_BITS, PCM_CHANNELS, PCM_SAMPLE_RATE};

const DEFAULT_MODEL: &str = "eleven_multilingual_v2";
const SUPPORTED_FORMATS: &[&str] = &["mp3", "wav", "ogg"];

pub struct ElevenLabsClient {
    base_url: String,
    headers: HeaderMap,
    stability: f32,
    similarity_boost: f32,
    client: reqwest::Client,
}

impl ElevenLabsClient {
    pub fn new(api_key: &str, base_url: &str, stability: f32, similarity_boost: f32) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("audio/mpeg"));
        if let Ok(value) = HeaderValue::from_str(api_key) {
            headers.insert("xi-api-key", value);
        }
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
            stability,
            similarity_boost,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
    style: f32,
    use_speaker_boost: bool,
}

#[derive(Deserialize)]
struct VoicesResponse {
    #[serde(default)]
    voices: Vec<ElevenVoice>,
}

#[derive(Deserialize)]
struct ElevenVoice {
    voice_id: String,
    name: String,
    description: Option<String>,
    #[serde(default)]
    labels: std::collections::HashMap<String, String>,
}

/// ElevenLabs `output_format` query value for a container format.
fn output_format(format: &str) -> Option<&'static str> {
    match format {
        "mp3" => Some("mp3_44100_128"),
        "wav" => Some("pcm_44100"),
        "ogg" => Some("opus_48000_128"),
        _ => None,
    }
}

#[async_trait]
impl TtsClient for ElevenLabsClient {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        let fmt = output_format(&request.format)
            .ok_or_else(|| anyhow!("ElevenLabs cannot produce '{}' audio", request.format))?;
        let url = format!(
            "{}/v1/text-to-speech/{}?output_format={}",
            self.base_url, request.voice, fmt
        );

        let body = SpeechRequest {
            text: &request.text,
            model_id: request.model.as_deref().unwrap_or(DEFAULT_MODEL),
            voice_settings: VoiceSettings {
                stability: self.stability,
                similarity_boost: self.similarity_boost,
                style: 0.0,
                use_speaker_boost: true,
            },
        };

        let resp = self
            .client
            .post(&url)
            .headers(self.headers.clone())
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(anyhow!("ElevenLabs API error: {} - {}", status, error_text));
        }

        let audio = resp.bytes().await?.to_vec();
        // `pcm_44100` comes back without a RIFF header.
        if request.format == "wav" {
            return Ok(pcm_to_wav(&audio, PCM_SAMPLE_RATE, PCM_CHANNELS, PCM_BITS));
        }
        Ok(audio)
    }

    async fn list_voices(&self) -> Result<Vec<Voice>> {
        let url = format!("{}/v1/voices", self.base_url);
        let resp = self
            .client
            .get(&url)
            .headers(self.headers.clone())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(anyhow!("Failed to list ElevenLabs voices: {}", resp.status()));
        }
        let result: VoicesResponse = resp.json().await?;
        Ok(result.voices.into_iter().map(into_voice).collect())
    }

    fn supported_formats(&self) -> &'static [&'static str] {
        SUPPORTED_FORMATS
    }

    fn provider(&self) -> TtsProvider {
        TtsProvider::ElevenLabs
    }
}

fn into_voice(v: ElevenVoice) -> Voice {
    Voice {
        id: v.voice_id,
        name: v.name,
        description: v.description.filter(|d| !d.is_empty()),
        gender: v.labels.get("gender").cloned(),
        provider: TtsProvider::ElevenLabs,
    }
}
