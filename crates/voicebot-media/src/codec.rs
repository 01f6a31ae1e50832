//! Audio chunk codec.
//!
//! Canonical audio is signed 16-bit little-endian PCM, 8 kHz, mono. Outbound
//! audio is split into fixed-size chunks, each wrapped in a `media` frame
//! carrying the session's next sequence number.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, error};

use voicebot_core::error::{Result, VoicebotError};
use voicebot_core::protocol::{MarkInfo, OutboundFrame, OutboundMedia};
use voicebot_core::session::Session;

pub const SAMPLE_RATE: u32 = 8000;
pub const BYTES_PER_SAMPLE: usize = 2;

/// 100 ms of canonical PCM.
pub const CHUNK_SIZE: usize = 3200;

/// Split `buffer` into `chunk_size` slices; the last one holds the remainder.
///
/// A zero `chunk_size` is treated as [`CHUNK_SIZE`].
pub fn chunk(buffer: &[u8], chunk_size: usize) -> impl Iterator<Item = &[u8]> {
    let size = if chunk_size == 0 { CHUNK_SIZE } else { chunk_size };
    buffer.chunks(size)
}

/// Zero-valued canonical PCM lasting `duration`.
pub fn silence(duration: Duration) -> Vec<u8> {
    let samples = SAMPLE_RATE as u128 * duration.as_millis() / 1000;
    vec![0u8; samples as usize * BYTES_PER_SAMPLE]
}

/// Build the `media` frame for one chunk and advance the sequence counter.
///
/// Returns `None` when the session is inactive or has no stream id yet.
pub fn encode_frame(session: &Session, chunk: &[u8]) -> Option<OutboundFrame> {
    if !session.is_active() {
        debug!(call_id = session.call_id(), "Session inactive, dropping frame");
        return None;
    }
    let Some(stream_id) = session.stream_id() else {
        error!(call_id = session.call_id(), "No stream id, dropping frame");
        return None;
    };
    let sequence_number = session.next_sequence();
    Some(OutboundFrame::Media {
        stream_sid: stream_id.to_owned(),
        sequence_number: sequence_number.to_string(),
        media: OutboundMedia {
            payload: STANDARD.encode(chunk),
        },
    })
}

/// Build a `mark` frame. Same preconditions as [`encode_frame`].
pub fn encode_mark(session: &Session, name: &str) -> Option<OutboundFrame> {
    if !session.is_active() {
        return None;
    }
    let Some(stream_id) = session.stream_id() else {
        error!(call_id = session.call_id(), mark = name, "No stream id, dropping mark");
        return None;
    };
    Some(OutboundFrame::Mark {
        stream_sid: stream_id.to_owned(),
        mark: MarkInfo { name: name.into() },
    })
}

/// Decode an inbound base64 media payload.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(payload.trim())
        .map_err(|e| VoicebotError::ProtocolDecode(format!("invalid media payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_stream() -> Session {
        let session = Session::new("CA1");
        session.set_stream_id("MZ1");
        session
    }

    #[test]
    fn test_chunk_sizes() {
        let buffer: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let chunks: Vec<&[u8]> = chunk(&buffer, CHUNK_SIZE).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 3200);
        assert_eq!(chunks[1].len(), 1800);
        assert_eq!(chunks.concat(), buffer);
    }

    #[test]
    fn test_chunk_lengths_across_sizes() {
        for (len, size) in [(0, 3200), (1, 3200), (3200, 3200), (6401, 3200), (10, 3), (7, 7)] {
            let buffer = vec![7u8; len];
            let chunks: Vec<&[u8]> = chunk(&buffer, size).collect();
            let full = chunks.iter().filter(|c| c.len() == size).count();
            assert_eq!(full, len / size, "len={len} size={size}");
            let remainder = chunks.iter().filter(|c| c.len() != size).count();
            assert_eq!(remainder, usize::from(len % size != 0));
            if len % size != 0 {
                assert_eq!(chunks.last().unwrap().len(), len % size);
            }
            assert_eq!(chunks.concat(), buffer);
        }
    }

    #[test]
    fn test_fallback_silence_sizing() {
        let buffer = silence(Duration::from_secs(1));
        assert_eq!(buffer.len(), 16000);
        assert!(buffer.iter().all(|b| *b == 0));
        let chunks: Vec<&[u8]> = chunk(&buffer, CHUNK_SIZE).collect();
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.len() == 3200));
    }

    #[test]
    fn test_encode_frame_uses_current_sequence() {
        let session = session_with_stream();
        let first = encode_frame(&session, &[1, 2, 3]).unwrap();
        let second = encode_frame(&session, &[4]).unwrap();

        match (first, second) {
            (
                OutboundFrame::Media {
                    stream_sid,
                    sequence_number: a,
                    media,
                },
                OutboundFrame::Media {
                    sequence_number: b, ..
                },
            ) => {
                assert_eq!(stream_sid, "MZ1");
                assert_eq!(a, "0");
                assert_eq!(b, "1");
                assert_eq!(decode_payload(&media.payload).unwrap(), vec![1, 2, 3]);
            }
            other => panic!("Expected two media frames, got {other:?}"),
        }
        assert_eq!(session.sequence_number(), 2);
    }

    #[test]
    fn test_encode_frame_without_stream_id_is_dropped() {
        let session = Session::new("CA1");
        assert!(encode_frame(&session, &[0; 4]).is_none());
        assert!(encode_mark(&session, "greeting_done").is_none());
        assert_eq!(session.sequence_number(), 0);
    }

    #[test]
    fn test_encode_frame_inactive_session_is_dropped() {
        let session = session_with_stream();
        session.deactivate();
        assert!(encode_frame(&session, &[0; 4]).is_none());
        assert!(encode_mark(&session, "greeting_done").is_none());
        assert_eq!(session.sequence_number(), 0);
    }

    #[test]
    fn test_encode_mark_does_not_advance_sequence() {
        let session = session_with_stream();
        let mark = encode_mark(&session, "greeting_done").unwrap();
        assert_eq!(
            mark,
            OutboundFrame::Mark {
                stream_sid: "MZ1".into(),
                mark: MarkInfo {
                    name: "greeting_done".into()
                },
            }
        );
        assert_eq!(session.sequence_number(), 0);
    }

    #[test]
    fn test_decode_payload_rejects_garbage() {
        assert!(matches!(
            decode_payload("***not base64***"),
            Err(VoicebotError::ProtocolDecode(_))
        ));
        assert_eq!(decode_payload("AAEC").unwrap(), vec![0, 1, 2]);
    }
}
