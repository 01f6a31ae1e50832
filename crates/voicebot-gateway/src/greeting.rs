//! Greeting pipeline: synthesize, convert to canonical PCM, stream.
//!
//! Each stage is bounded by its own timeout. Any synthesis or conversion
//! failure streams a short burst of silence instead so the far end always
//! receives audio, and leaves the session retry-eligible.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use voicebot_core::config::GreetingConfig;
use voicebot_core::error::{Result, VoicebotError};
use voicebot_core::protocol::{MARK_FALLBACK_DONE, MARK_GREETING_DONE};
use voicebot_core::session::{GreetingState, Session};
use voicebot_media::codec;
use voicebot_media::convert::AudioFormatConverter;
use voicebot_media::tts::TextToSpeech;

use crate::outbound::CallConnection;

/// How one greeting attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GreetingOutcome {
    /// Every greeting frame and the `greeting_done` mark were queued.
    Sent { frames: usize },
    /// Synthesis or conversion failed; silence was streamed instead.
    FellBack {
        cause: &'static str,
        frames: usize,
        completed: bool,
    },
    /// The connection or session ended before the greeting finished.
    Aborted { frames: usize },
}

impl GreetingOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sent { .. } => "sent",
            Self::FellBack { .. } => "fallback",
            Self::Aborted { .. } => "aborted",
        }
    }
}

enum Streamed {
    Complete(usize),
    Interrupted(usize),
}

pub struct GreetingPipeline {
    tts: Arc<dyn TextToSpeech>,
    converter: Arc<dyn AudioFormatConverter>,
    settings: GreetingConfig,
}

impl GreetingPipeline {
    pub fn new(
        tts: Arc<dyn TextToSpeech>,
        converter: Arc<dyn AudioFormatConverter>,
        settings: GreetingConfig,
    ) -> Self {
        Self {
            tts,
            converter,
            settings,
        }
    }

    pub fn settings(&self) -> &GreetingConfig {
        &self.settings
    }

    /// Claim the session's greeting and return the task that runs it.
    ///
    /// Returns `None` without side effects if the stream id is unknown, the
    /// connection is closed, or a greeting is already running or sent. The
    /// claim itself is a single compare-and-set on the session, so racing
    /// triggers yield exactly one task.
    pub fn try_start(
        self: &Arc<Self>,
        session: &Arc<Session>,
        conn: &CallConnection,
    ) -> Option<impl Future<Output = GreetingOutcome> + Send + 'static> {
        if session.stream_id().is_none() || !conn.is_open() {
            return None;
        }
        if !session.try_begin_greeting() {
            return None;
        }
        let pipeline = self.clone();
        let session = session.clone();
        let conn = conn.clone();
        Some(async move { pipeline.run(&session, &conn).await })
    }

    async fn run(&self, session: &Session, conn: &CallConnection) -> GreetingOutcome {
        let started = Instant::now();
        info!(
            call_id = session.call_id(),
            stream_id = session.stream_id().unwrap_or_default(),
            "Starting greeting"
        );

        let pcm = match self.produce_pcm(session).await {
            Ok(pcm) => pcm,
            Err(e) => return self.fallback(session, conn, e).await,
        };

        if !conn.is_open() {
            session.finish_greeting(GreetingState::Failed);
            info!(call_id = session.call_id(), "Connection closed before greeting could stream");
            return GreetingOutcome::Aborted { frames: 0 };
        }

        match self.stream_pcm(session, conn, &pcm).await {
            Streamed::Complete(frames) => {
                send_mark(session, conn, MARK_GREETING_DONE);
                session.finish_greeting(GreetingState::Sent);
                info!(
                    call_id = session.call_id(),
                    frames,
                    bytes = pcm.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Greeting sent"
                );
                GreetingOutcome::Sent { frames }
            }
            Streamed::Interrupted(frames) => {
                session.finish_greeting(GreetingState::Failed);
                info!(call_id = session.call_id(), frames, "Greeting interrupted");
                GreetingOutcome::Aborted { frames }
            }
        }
    }

    /// Stages A and B, each under its own deadline.
    async fn produce_pcm(&self, session: &Session) -> Result<Vec<u8>> {
        let limit = self.settings.synthesis_timeout();
        let audio = match timeout(limit, self.tts.synthesize(&self.settings.text)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(VoicebotError::TransmissionTimeout {
                    stage: "synthesis",
                    after: limit,
                });
            }
        };
        debug!(call_id = session.call_id(), bytes = audio.len(), "Greeting synthesized");

        let limit = self.settings.conversion_timeout();
        let pcm = match timeout(limit, self.converter.convert_to_canonical_pcm(&audio)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(VoicebotError::TransmissionTimeout {
                    stage: "conversion",
                    after: limit,
                });
            }
        };
        if pcm.is_empty() {
            return Err(VoicebotError::Conversion("converter returned no PCM".into()));
        }
        debug!(call_id = session.call_id(), bytes = pcm.len(), "Greeting converted");
        Ok(pcm)
    }

    /// Stage C. Liveness is checked before every frame.
    async fn stream_pcm(&self, session: &Session, conn: &CallConnection, pcm: &[u8]) -> Streamed {
        let pacing = self.settings.pacing();
        let mut frames = 0;
        for (i, chunk) in codec::chunk(pcm, self.settings.chunk_size).enumerate() {
            if i > 0 && !pacing.is_zero() {
                sleep(pacing).await;
            }
            match conn.send_media(session, chunk) {
                Ok(true) => {
                    frames += 1;
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_frame_sent();
                }
                Ok(false) => return Streamed::Interrupted(frames),
                Err(e) => {
                    debug!(call_id = session.call_id(), error = %e, frames, "Stopping stream");
                    return Streamed::Interrupted(frames);
                }
            }
        }
        Streamed::Complete(frames)
    }

    /// Mark the attempt failed and stream silence. Never propagates errors.
    async fn fallback(
        &self,
        session: &Session,
        conn: &CallConnection,
        cause: VoicebotError,
    ) -> GreetingOutcome {
        warn!(
            call_id = session.call_id(),
            kind = cause.kind(),
            error = %cause,
            "Greeting failed, streaming fallback silence"
        );
        session.finish_greeting(GreetingState::Failed);

        let silence = codec::silence(self.settings.fallback_silence());
        let (frames, completed) = match self.stream_pcm(session, conn, &silence).await {
            Streamed::Complete(frames) => {
                send_mark(session, conn, MARK_FALLBACK_DONE);
                (frames, true)
            }
            Streamed::Interrupted(frames) => {
                debug!(call_id = session.call_id(), frames, "Fallback silence interrupted");
                (frames, false)
            }
        };
        GreetingOutcome::FellBack {
            cause: cause.kind(),
            frames,
            completed,
        }
    }
}

fn send_mark(session: &Session, conn: &CallConnection, name: &str) {
    match conn.send_mark(session, name) {
        Ok(true) => debug!(call_id = session.call_id(), mark = name, "Mark sent"),
        Ok(false) => {}
        Err(e) => debug!(call_id = session.call_id(), mark = name, error = %e, "Mark not sent"),
    }
}
