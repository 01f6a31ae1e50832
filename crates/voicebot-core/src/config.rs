//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoicebotError};

/// Path the telephony provider connects to. Exempt from the shared secret.
pub const DEFAULT_STREAM_PATH: &str = "/voicebot/ws";

/// Environment variable consulted for the WebSocket shared secret when the
/// config file does not name one.
pub const WS_TOKEN_ENV: &str = "VOICEBOT_WS_TOKEN";

pub const DEFAULT_GREETING_TEXT: &str =
    "Hello! Thank you for calling. How can I help you today?";

/// Top-level voicebot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<GreetingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub converter: Option<ConverterConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub telephony: Option<TelephonyConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// WebSocket path used by the telephony provider.
    #[serde(default = "default_stream_path")]
    pub stream_path: String,

    /// Additional WebSocket paths that require the shared secret.
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,

    /// Externally reachable base URL (e.g. `https://bot.example.com`), used
    /// when answering the connect webhook.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<GatewayAuthConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            stream_path: default_stream_path(),
            protected_paths: default_protected_paths(),
            public_url: None,
            auth: None,
            tls: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_stream_path() -> String {
    DEFAULT_STREAM_PATH.into()
}

fn default_protected_paths() -> Vec<String> {
    vec!["/voice-stream".into()]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl GatewayAuthConfig {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }
}

/// TLS configuration for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM).
    pub cert_path: String,
    /// Path to the TLS private key file (PEM).
    pub key_path: String,
}

/// Greeting pipeline tuning. Defaults match the canonical 8 kHz mono stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreetingConfig {
    #[serde(default = "default_greeting_text")]
    pub text: String,

    #[serde(default = "default_synthesis_timeout_ms")]
    pub synthesis_timeout_ms: u64,

    #[serde(default = "default_conversion_timeout_ms")]
    pub conversion_timeout_ms: u64,

    /// Bytes per outbound media frame. 3200 bytes is 100 ms of audio.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    #[serde(default = "default_fallback_silence_ms")]
    pub fallback_silence_ms: u64,
}

impl Default for GreetingConfig {
    fn default() -> Self {
        Self {
            text: default_greeting_text(),
            synthesis_timeout_ms: default_synthesis_timeout_ms(),
            conversion_timeout_ms: default_conversion_timeout_ms(),
            chunk_size: default_chunk_size(),
            pacing_ms: default_pacing_ms(),
            fallback_silence_ms: default_fallback_silence_ms(),
        }
    }
}

impl GreetingConfig {
    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesis_timeout_ms)
    }

    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_millis(self.conversion_timeout_ms)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn fallback_silence(&self) -> Duration {
        Duration::from_millis(self.fallback_silence_ms)
    }
}

fn default_greeting_text() -> String {
    DEFAULT_GREETING_TEXT.into()
}

fn default_synthesis_timeout_ms() -> u64 {
    10_000
}

fn default_conversion_timeout_ms() -> u64 {
    15_000
}

fn default_chunk_size() -> usize {
    3200
}

fn default_pacing_ms() -> u64 {
    10
}

fn default_fallback_silence_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// "openai" (default), "elevenlabs" or "google".
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Override the provider's API base URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            api_key: None,
            api_key_env: None,
            voice: None,
            model: None,
            base_url: None,
        }
    }
}

impl TtsConfig {
    /// Resolve the API key: direct value, then `api_key_env`, then the
    /// provider's conventional variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env).or_else(|| {
            let fallback = match self.provider.as_str() {
                "openai" => "OPENAI_API_KEY",
                "elevenlabs" => "ELEVENLABS_API_KEY",
                "google" => "GOOGLE_TTS_API_KEY",
                _ => return None,
            };
            resolve_secret_field(&None, &Some(fallback.to_string()))
        })
    }
}

fn default_tts_provider() -> String {
    "openai".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// "ffmpeg" (default) or "passthrough".
    #[serde(default = "default_converter_kind")]
    pub kind: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffmpeg_path: Option<String>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            kind: default_converter_kind(),
            ffmpeg_path: None,
        }
    }
}

impl ConverterConfig {
    /// Configured binary, then `FFMPEG_PATH`, then `ffmpeg` on `PATH`.
    pub fn ffmpeg_binary(&self) -> String {
        resolve_secret_field(&self.ffmpeg_path, &Some("FFMPEG_PATH".to_string()))
            .unwrap_or_else(|| "ffmpeg".into())
    }
}

fn default_converter_kind() -> String {
    "ffmpeg".into()
}

/// Exotel account used for outbound call placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    pub account_sid: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token_env: Option<String>,

    #[serde(default = "default_subdomain")]
    pub subdomain: String,

    /// Virtual number shown to the callee.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,

    /// Voicebot applet (flow) id the call is connected to.
    pub app_id: String,
}

impl TelephonyConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn resolve_api_token(&self) -> Option<String> {
        resolve_secret_field(&self.api_token, &self.api_token_env)
    }
}

fn default_subdomain() -> String {
    "api.exotel.com".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "voicebot_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_log_format() -> String {
    "plain".into()
}

/// Resolve a secret: direct value first, then the named environment variable.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns with their environment values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| VoicebotError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse JSON5 text after `${ENV_VAR}` substitution.
    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| VoicebotError::Config(e.to_string()))
    }

    pub fn default_path() -> PathBuf {
        data_dir().join("voicebot.json")
    }

    pub fn gateway(&self) -> GatewayConfig {
        self.gateway.clone().unwrap_or_default()
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn stream_path(&self) -> String {
        self.gateway
            .as_ref()
            .map(|g| g.stream_path.clone())
            .unwrap_or_else(default_stream_path)
    }

    /// Shared secret for protected WebSocket paths, if any.
    pub fn ws_token(&self) -> Option<String> {
        self.gateway
            .as_ref()
            .and_then(|g| g.auth.as_ref())
            .and_then(|a| a.resolve_token())
            .or_else(|| resolve_secret_field(&None, &Some(WS_TOKEN_ENV.to_string())))
    }

    pub fn greeting(&self) -> GreetingConfig {
        self.greeting.clone().unwrap_or_default()
    }

    pub fn tts(&self) -> TtsConfig {
        self.tts.clone().unwrap_or_default()
    }

    pub fn converter(&self) -> ConverterConfig {
        self.converter.clone().unwrap_or_default()
    }

    /// Validate the config. Returns (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let gateway = self.gateway();
        if gateway.port == 0 {
            errors.push("Gateway port cannot be 0".to_string());
        }
        for path in std::iter::once(&gateway.stream_path).chain(&gateway.protected_paths) {
            if !path.starts_with('/') {
                errors.push(format!("WebSocket path must start with '/': {path}"));
            }
        }
        if gateway.protected_paths.contains(&gateway.stream_path) {
            errors.push(format!(
                "Stream path {} cannot also be a protected path",
                gateway.stream_path
            ));
        }
        if !gateway.protected_paths.is_empty() && self.ws_token().is_none() {
            warnings.push(
                "No WebSocket token configured; protected paths accept any client".to_string(),
            );
        }

        if let Some(tls) = &gateway.tls {
            if !Path::new(&tls.cert_path).exists() {
                errors.push(format!("TLS certificate file not found: {}", tls.cert_path));
            }
            if !Path::new(&tls.key_path).exists() {
                errors.push(format!("TLS key file not found: {}", tls.key_path));
            }
        }

        let greeting = self.greeting();
        if greeting.chunk_size == 0 {
            errors.push("greeting.chunk_size cannot be 0".to_string());
        } else if greeting.chunk_size % 2 != 0 {
            errors.push(format!(
                "greeting.chunk_size must be a whole number of 16-bit samples, got {}",
                greeting.chunk_size
            ));
        }
        if greeting.text.trim().is_empty() {
            errors.push("greeting.text cannot be empty".to_string());
        }

        let tts = self.tts();
        if !matches!(tts.provider.as_str(), "openai" | "elevenlabs" | "google") {
            errors.push(format!("Unknown TTS provider '{}'", tts.provider));
        } else if tts.resolve_api_key().is_none() {
            warnings.push(format!(
                "TTS provider '{}' has no API key configured; greetings will fall back to silence",
                tts.provider
            ));
        }

        let converter = self.converter();
        if !matches!(converter.kind.as_str(), "ffmpeg" | "passthrough") {
            errors.push(format!("Unknown converter kind '{}'", converter.kind));
        }

        if let Some(telephony) = &self.telephony {
            if telephony.resolve_api_key().is_none() || telephony.resolve_api_token().is_none() {
                warnings.push("Telephony credentials incomplete; /call is disabled".to_string());
            }
        }

        (warnings, errors)
    }
}

/// Resolve the data directory (~/.voicebot).
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voicebot")
}
