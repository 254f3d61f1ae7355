use crate::core::config::{Config, TtsProvider};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub mod elevenlabs;
pub mod openai;

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Voice {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub gender: Option<String>,
    pub provider: TtsProvider,
}

#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: String,
    pub format: String,
    /// Provider default when unset.
    pub model: Option<String>,
}

impl SynthesisRequest {
    pub fn from_config(config: &Config, text: &str) -> Self {
        Self {
            text: text.to_string(),
            voice: config.tts.voice.clone(),
            format: config.tts.format.clone(),
            model: config.tts.model.clone(),
        }
    }
}

#[async_trait]
pub trait TtsClient: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>>;
    async fn list_voices(&self) -> Result<Vec<Voice>>;
    fn supported_formats(&self) -> &'static [&'static str];
    fn provider(&self) -> TtsProvider;
}

/// Synthesizes `request` and stores the audio at `output`.
pub async fn synthesize_to_file(
    tts: &dyn TtsClient,
    request: &SynthesisRequest,
    output: &Path,
) -> Result<PathBuf> {
    if request.text.trim().is_empty() {
        return Err(anyhow!("Refusing to synthesize empty text for {}", output.display()));
    }
    let audio = tts.synthesize(request).await.map_err(|e| {
        log::error!("TTS synthesis failed with {}: {:#}", tts.provider().as_str(), e);
        e
    })?;
    tokio::fs::write(output, &audio)
        .await
        .with_context(|| format!("Failed to write audio to {}", output.display()))?;
    log::debug!("Audio saved to {}", output.display());
    Ok(output.to_path_buf())
}

fn build_client(config: &Config, provider: TtsProvider, api_key: String) -> Box<dyn TtsClient> {
    let base_url = config.tts.base_url(provider);
    match provider {
        TtsProvider::ElevenLabs => Box::new(elevenlabs::ElevenLabsClient::new(
            &api_key,
            &base_url,
            config.tts.elevenlabs.stability,
            config.tts.elevenlabs.similarity_boost,
        )),
        TtsProvider::OpenAI => Box::new(openai::OpenAiTtsClient::new(&api_key, &base_url)),
    }
}

/// Picks the voice provider once at startup: the configured one if it has
/// credentials, otherwise the first other provider that does.
pub fn create_tts_client(config: &Config) -> Result<Box<dyn TtsClient>> {
    let wanted = config.tts.provider;
    if let Some(key) = config.tts.resolve_api_key(wanted) {
        info!("Initializing TTS client for provider: {}", wanted.as_str());
        return Ok(build_client(config, wanted, key));
    }

    for provider in TtsProvider::ALL.into_iter().filter(|p| *p != wanted) {
        if let Some(key) = config.tts.resolve_api_key(provider) {
            warn!(
                "TTS provider '{}' has no credentials, using {}",
                wanted.as_str(),
                provider.as_str()
            );
            return Ok(build_client(config, provider, key));
        }
    }

    Err(anyhow!(
        "No TTS provider available: configure an API key for '{}'",
        wanted.as_str()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingTts {
        requests: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TtsClient for RecordingTts {
        async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
            self.requests.lock().unwrap().push(request.text.clone());
            Ok(b"ID3fake".to_vec())
        }
        async fn list_voices(&self) -> Result<Vec<Voice>> {
            Ok(vec![])
        }
        fn supported_formats(&self) -> &'static [&'static str] {
            &["mp3"]
        }
        fn provider(&self) -> TtsProvider {
            TtsProvider::OpenAI
        }
    }

    #[tokio::test]
    async fn test_synthesize_to_file_writes_bytes() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let tts = RecordingTts { requests: requests.clone() };
        let out = temp_dir.path().join("paragraph_0.mp3");

        let request = SynthesisRequest::from_config(&Config::default(), "Hello there.");
        let written = synthesize_to_file(&tts, &request, &out).await?;

        assert_eq!(written, out);
        assert_eq!(std::fs::read(&out)?, b"ID3fake");
        assert_eq!(*requests.lock().unwrap(), vec!["Hello there."]);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_text_is_rejected() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let tts = RecordingTts { requests: Arc::new(Mutex::new(Vec::new())) };
        let request = SynthesisRequest::from_config(&Config::default(), "  \n\n");
        let result = synthesize_to_file(&tts, &request, &temp_dir.path().join("x.mp3")).await;
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_configured_provider_with_key_is_used() -> Result<()> {
        let mut config = Config::default();
        config.tts.provider = TtsProvider::OpenAI;
        config.tts.openai.api_key = Some("sk-test".to_string());
        let client = create_tts_client(&config)?;
        assert_eq!(client.provider(), TtsProvider::OpenAI);
        Ok(())
    }

    #[test]
    fn test_falls_back_to_provider_with_key() -> Result<()> {
        let mut config = Config::default();
        config.tts.provider = TtsProvider::ElevenLabs;
        config.tts.elevenlabs.api_key = None;
        config.tts.openai.api_key = Some("sk-test".to_string());
        // ELEVENLABS_API_KEY may be set on a developer machine.
        let expected = if std::env::var("ELEVENLABS_API_KEY").is_ok_and(|k| !k.trim().is_empty()) {
            TtsProvider::ElevenLabs
        } else {
            TtsProvider::OpenAI
        };
        assert_eq!(create_tts_client(&config)?.provider(), expected);
        Ok(())
    }
}
