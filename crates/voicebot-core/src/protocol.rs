//! Telephony media-stream wire protocol.
//!
//! Every frame is a JSON object discriminated by its `event` field. Inbound
//! frames come from the provider (`connected`, `start`, `media`, `stop`,
//! `mark`); outbound frames carry synthesized audio (`media`) and
//! synchronization markers (`mark`) back to it.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoicebotError};

/// Mark sent after the greeting audio has been fully streamed.
pub const MARK_GREETING_DONE: &str = "greeting_done";

/// Mark sent after the fallback silence has been streamed.
pub const MARK_FALLBACK_DONE: &str = "fallback_silence_done";

/// An inbound protocol event.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundEvent {
    Connected(ConnectedEvent),
    Start(StartEvent),
    Media(MediaEvent),
    Stop(StopEvent),
    Mark(MarkEvent),
    /// Any tag this gateway does not handle.
    #[serde(other)]
    Unknown,
}

impl InboundEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::Start(_) => "start",
            Self::Media(_) => "media",
            Self::Stop(_) => "stop",
            Self::Mark(_) => "mark",
            Self::Unknown => "unknown",
        }
    }
}

/// Stream metadata some providers nest under a `start` object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartMeta {
    #[serde(default, alias = "streamSid")]
    pub stream_sid: Option<String>,
    #[serde(default, alias = "callSid")]
    pub call_sid: Option<String>,
    #[serde(default, alias = "accountSid")]
    pub account_sid: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectedEvent {
    #[serde(default, alias = "streamSid")]
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub start: Option<StartMeta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartEvent {
    #[serde(default, alias = "streamSid")]
    pub stream_sid: Option<String>,
    #[serde(default, alias = "callSid")]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub start: Option<StartMeta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaEvent {
    #[serde(default, alias = "streamSid")]
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub start: Option<StartMeta>,
    #[serde(default)]
    pub media: MediaBody,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaBody {
    /// `inbound` (caller audio) or `outbound` (our own audio echoed back).
    #[serde(default)]
    pub track: Option<String>,
    /// Base64-encoded canonical PCM.
    #[serde(default)]
    pub payload: Option<String>,
}

impl MediaBody {
    pub fn is_echo(&self) -> bool {
        self.track.as_deref() == Some("outbound")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopEvent {
    #[serde(default, alias = "streamSid")]
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub stop: Option<StopInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopInfo {
    #[serde(default, alias = "callSid")]
    pub call_sid: Option<String>,
    #[serde(default, alias = "accountSid")]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkEvent {
    #[serde(default, alias = "streamSid")]
    pub stream_sid: Option<String>,
    pub mark: MarkInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkInfo {
    pub name: String,
}

fn pick(top: &Option<String>, nested: &Option<StartMeta>) -> Option<String> {
    top.as_deref()
        .or_else(|| nested.as_ref().and_then(|s| s.stream_sid.as_deref()))
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

impl ConnectedEvent {
    pub fn stream_id(&self) -> Option<String> {
        pick(&self.stream_sid, &self.start)
    }
}

impl StartEvent {
    pub fn stream_id(&self) -> Option<String> {
        pick(&self.stream_sid, &self.start)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_sid
            .as_deref()
            .or_else(|| self.start.as_ref().and_then(|s| s.call_sid.as_deref()))
    }
}

impl MediaEvent {
    pub fn stream_id(&self) -> Option<String> {
        pick(&self.stream_sid, &self.start)
    }
}

/// Decode one inbound text frame.
pub fn decode_inbound(text: &str) -> Result<InboundEvent> {
    serde_json::from_str(text).map_err(|e| VoicebotError::ProtocolDecode(e.to_string()))
}

/// An outbound protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundFrame {
    Media {
        stream_sid: String,
        /// Decimal rendering of the session's sequence counter.
        sequence_number: String,
        media: OutboundMedia,
    },
    Mark {
        stream_sid: String,
        mark: MarkInfo,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMedia {
    pub payload: String,
}

impl OutboundFrame {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_start_with_stream_id() {
        let event = decode_inbound(
            r#"{"event":"start","stream_sid":"MZ123","callSid":"CA1"}"#,
        )
        .unwrap();
        match event {
            InboundEvent::Start(start) => {
                assert_eq!(start.stream_id().as_deref(), Some("MZ123"));
                assert_eq!(start.call_id(), Some("CA1"));
            }
            other => panic!("Expected start, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_camel_case_stream_id() {
        let event = decode_inbound(r#"{"event":"connected","streamSid":"MZ9"}"#).unwrap();
        match event {
            InboundEvent::Connected(c) => assert_eq!(c.stream_id().as_deref(), Some("MZ9")),
            other => panic!("Expected connected, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_nested_start_metadata() {
        let event = decode_inbound(
            r#"{"event":"start","start":{"stream_sid":"MZ7","call_sid":"CA7"}}"#,
        )
        .unwrap();
        let InboundEvent::Start(start) = event else {
            panic!("Expected start");
        };
        assert_eq!(start.stream_id().as_deref(), Some("MZ7"));
        assert_eq!(start.call_id(), Some("CA7"));
    }

    #[test]
    fn test_empty_stream_id_is_unknown() {
        let event = decode_inbound(r#"{"event":"start","stream_sid":""}"#).unwrap();
        let InboundEvent::Start(start) = event else {
            panic!("Expected start");
        };
        assert!(start.stream_id().is_none());
    }

    #[test]
    fn test_decode_media_echo_track() {
        let event = decode_inbound(
            r#"{"event":"media","stream_sid":"MZ1","media":{"track":"outbound","payload":"AAA="}}"#,
        )
        .unwrap();
        let InboundEvent::Media(media) = event else {
            panic!("Expected media");
        };
        assert!(media.media.is_echo());
        assert_eq!(media.media.payload.as_deref(), Some("AAA="));
    }

    #[test]
    fn test_decode_media_tolerates_extra_fields() {
        let event = decode_inbound(
            r#"{"event":"media","sequence_number":"4","media":{"chunk":"2","timestamp":"40","payload":"AAA="}}"#,
        )
        .unwrap();
        let InboundEvent::Media(media) = event else {
            panic!("Expected media");
        };
        assert!(!media.media.is_echo());
        assert!(media.stream_id().is_none());
    }

    #[test]
    fn test_decode_stop_and_mark() {
        let stop = decode_inbound(r#"{"event":"stop","stop":{"reason":"callended"}}"#).unwrap();
        let InboundEvent::Stop(stop) = stop else {
            panic!("Expected stop");
        };
        assert_eq!(
            stop.stop.and_then(|s| s.reason).as_deref(),
            Some("callended")
        );

        let mark = decode_inbound(r#"{"event":"mark","mark":{"name":"greeting_done"}}"#).unwrap();
        assert_eq!(mark.tag(), "mark");
    }

    #[test]
    fn test_unknown_event_is_tolerated() {
        let event = decode_inbound(r#"{"event":"dtmf","digit":"5"}"#).unwrap();
        assert!(matches!(event, InboundEvent::Unknown));
    }

    #[test]
    fn test_malformed_frames_are_decode_errors() {
        for raw in ["not json", r#"{"no_event":true}"#, r#"{"event":"mark"}"#, "[]"] {
            let err = decode_inbound(raw).unwrap_err();
            assert!(
                matches!(err, VoicebotError::ProtocolDecode(_)),
                "Expected decode error for {raw}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_outbound_media_shape() {
        let frame = OutboundFrame::Media {
            stream_sid: "MZ1".into(),
            sequence_number: "0".into(),
            media: OutboundMedia {
                payload: "AAA=".into(),
            },
        };
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "media",
                "stream_sid": "MZ1",
                "sequence_number": "0",
                "media": { "payload": "AAA=" }
            })
        );
    }

    #[test]
    fn test_outbound_mark_shape() {
        let frame = OutboundFrame::Mark {
            stream_sid: "MZ1".into(),
            mark: MarkInfo {
                name: MARK_GREETING_DONE.into(),
            },
        };
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"event": "mark", "stream_sid": "MZ1", "mark": {"name": "greeting_done"}})
        );
    }
}
