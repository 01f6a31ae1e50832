use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoicebotError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("Auth error: {0}")]
    Authentication(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("{stage} timed out after {after:?}")]
    TransmissionTimeout { stage: &'static str, after: Duration },

    #[error("Send on closed connection")]
    SendOnClosedConnection,

    #[error("Telephony error: {0}")]
    Telephony(String),

    #[error("Invalid phone number: {0}")]
    InvalidNumber(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoicebotError {
    /// Short machine-friendly label, used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::ProtocolDecode(_) => "protocol_decode",
            Self::Authentication(_) => "authentication",
            Self::Synthesis(_) => "synthesis",
            Self::Conversion(_) => "conversion",
            Self::TransmissionTimeout { .. } => "timeout",
            Self::SendOnClosedConnection => "send_on_closed",
            Self::Telephony(_) => "telephony",
            Self::InvalidNumber(_) => "invalid_number",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, VoicebotError>;
