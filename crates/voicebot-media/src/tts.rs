//! Text-to-speech over HTTP provider APIs.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use tracing::debug;

use voicebot_core::config::TtsConfig;
use voicebot_core::error::{Result, VoicebotError};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io";
pub const GOOGLE_BASE_URL: &str = "https://texttospeech.googleapis.com";

const DEFAULT_ELEVENLABS_VOICE: &str = "EXAVITQu4vr4xnSDxMaL";

/// Turns text into an encoded audio buffer (any container the converter
/// understands).
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsProvider {
    OpenAi,
    ElevenLabs,
    Google,
}

impl TtsProvider {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "openai" => Ok(Self::OpenAi),
            "elevenlabs" => Ok(Self::ElevenLabs),
            "google" => Ok(Self::Google),
            other => Err(VoicebotError::Config(format!("Unknown TTS provider '{other}'"))),
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => OPENAI_BASE_URL,
            Self::ElevenLabs => ELEVENLABS_BASE_URL,
            Self::Google => GOOGLE_BASE_URL,
        }
    }
}

/// [`TextToSpeech`] backed by one of the supported HTTP providers.
pub struct HttpTextToSpeech {
    client: reqwest::Client,
    provider: TtsProvider,
    api_key: Option<String>,
    voice: Option<String>,
    model: Option<String>,
    base_url: String,
}

impl HttpTextToSpeech {
    /// Build from config. A missing API key is not an error here; every
    /// synthesis call fails instead, which routes calls to the silence
    /// fallback.
    pub fn from_config(config: &TtsConfig) -> Result<Self> {
        let provider = TtsProvider::parse(&config.provider)?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| provider.default_base_url().to_string());
        Ok(Self {
            client: reqwest::Client::new(),
            provider,
            api_key: config.resolve_api_key(),
            voice: config.voice.clone(),
            model: config.model.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn provider(&self) -> TtsProvider {
        self.provider
    }

    fn request(&self, text: &str, api_key: &str) -> reqwest::RequestBuilder {
        match self.provider {
            TtsProvider::OpenAi => self
                .client
                .post(format!("{}/v1/audio/speech", self.base_url))
                .bearer_auth(api_key)
                .json(&openai_body(text, self.voice.as_deref(), self.model.as_deref())),
            TtsProvider::ElevenLabs => {
                let voice = self.voice.as_deref().unwrap_or(DEFAULT_ELEVENLABS_VOICE);
                self.client
                    .post(format!("{}/v1/text-to-speech/{voice}", self.base_url))
                    .header("xi-api-key", api_key)
                    .header("Accept", "audio/mpeg")
                    .json(&elevenlabs_body(text, self.model.as_deref()))
            }
            TtsProvider::Google => self
                .client
                .post(format!("{}/v1/text:synthesize", self.base_url))
                .query(&[("key", api_key)])
                .json(&google_body(text, self.voice.as_deref())),
        }
    }
}

#[async_trait]
impl TextToSpeech for HttpTextToSpeech {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| VoicebotError::Synthesis("No TTS API key configured".into()))?;

        debug!(provider = ?self.provider, text_len = text.len(), "Synthesizing speech");

        let resp = self
            .request(text, api_key)
            .send()
            .await
            .map_err(|e| VoicebotError::Synthesis(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VoicebotError::Synthesis(format!(
                "TTS API error {status}: {body}"
            )));
        }

        let audio = match self.provider {
            TtsProvider::Google => {
                let value: Value = resp
                    .json()
                    .await
                    .map_err(|e| VoicebotError::Synthesis(format!("invalid response: {e}")))?;
                decode_google_audio(&value)?
            }
            _ => resp
                .bytes()
                .await
                .map_err(|e| VoicebotError::Synthesis(format!("reading audio failed: {e}")))?
                .to_vec(),
        };

        if audio.is_empty() {
            return Err(VoicebotError::Synthesis("provider returned no audio".into()));
        }
        debug!(bytes = audio.len(), "Speech synthesized");
        Ok(audio)
    }
}

/// Build the configured synthesizer.
pub fn from_config(config: &TtsConfig) -> Result<Arc<dyn TextToSpeech>> {
    Ok(Arc::new(HttpTextToSpeech::from_config(config)?))
}

fn openai_body(text: &str, voice: Option<&str>, model: Option<&str>) -> Value {
    json!({
        "model": model.unwrap_or("tts-1"),
        "input": text,
        "voice": voice.unwrap_or("alloy"),
        "response_format": "mp3",
        "speed": 1.0,
    })
}

fn elevenlabs_body(text: &str, model: Option<&str>) -> Value {
    json!({
        "text": text,
        "model_id": model.unwrap_or("eleven_turbo_v2_5"),
        "voice_settings": {
            "stability": 0.5,
            "similarity_boost": 0.75,
        },
    })
}

fn google_body(text: &str, voice: Option<&str>) -> Value {
    json!({
        "input": { "text": text },
        "voice": {
            "languageCode": "en-US",
            "name": voice.unwrap_or("en-US-Standard-C"),
        },
        "audioConfig": {
            "audioEncoding": "LINEAR16",
            "sampleRateHertz": 8000,
        },
    })
}

fn decode_google_audio(value: &Value) -> Result<Vec<u8>> {
    let content = value
        .get("audioContent")
        .and_then(Value::as_str)
        .ok_or_else(|| VoicebotError::Synthesis("response has no audioContent".into()))?;
    STANDARD
        .decode(content)
        .map_err(|e| VoicebotError::Synthesis(format!("invalid audioContent: {e}")))
}
