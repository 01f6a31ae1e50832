//! Per-connection media-stream handling.
//!
//! One task per WebSocket: it owns the read half, dispatches decoded events
//! to the call's [`Session`], and supervises greeting tasks in a `JoinSet`.
//! All writes go through [`CallConnection`], drained by a separate writer.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use voicebot_core::protocol::{self, InboundEvent, MediaEvent, StopEvent};
use voicebot_core::session::{GreetingState, Session, StreamIdCapture};
use voicebot_media::codec;

use crate::greeting::GreetingOutcome;
use crate::outbound::{CallConnection, write_loop};
use crate::state::GatewayState;

/// Query keys accepted as the call id, in priority order.
const CALL_ID_KEYS: [&str; 4] = ["call_id", "callSid", "CallSid", "callLogId"];
const STREAM_ID_KEYS: [&str; 2] = ["stream_sid", "streamSid"];

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Identifiers taken from the upgrade request's query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub call_id: String,
    pub stream_id: Option<String>,
}

fn first_non_empty(query: &HashMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| query.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .map(str::to_owned)
}

/// A fresh call id for connections that carry none.
pub fn generated_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

impl StreamParams {
    pub fn from_query(query: &HashMap<String, String>) -> Self {
        Self {
            call_id: first_non_empty(query, &CALL_ID_KEYS).unwrap_or_else(generated_call_id),
            stream_id: first_non_empty(query, &STREAM_ID_KEYS),
        }
    }
}

/// Handle an upgraded media-stream WebSocket until it closes.
pub async fn handle_stream_connection(
    state: Arc<GatewayState>,
    socket: WebSocket,
    params: StreamParams,
) {
    let conn_id = Uuid::new_v4().to_string();
    let (ws_tx, mut ws_rx) = socket.split();
    let (conn, out_rx) = CallConnection::new(&conn_id);
    let mut writer = tokio::spawn(write_loop(ws_tx, out_rx, conn.close_token()));

    let session = state.registry.attach(&params.call_id).await;
    if let Some(stream_id) = &params.stream_id {
        session.set_stream_id(stream_id);
    }
    info!(
        conn_id = %conn_id,
        call_id = session.call_id(),
        stream_id = session.stream_id().unwrap_or_default(),
        "Media stream connected"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();

    let mut handler = StreamHandler {
        state: state.clone(),
        session,
        conn,
        greetings: JoinSet::new(),
        attached: true,
    };

    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if handler.on_frame(text.as_str()).await.is_break() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        if handler.on_frame(text).await.is_break() {
                            break;
                        }
                    }
                    Err(_) => {
                        handler.session.touch();
                        warn!(
                            call_id = handler.session.call_id(),
                            bytes = bytes.len(),
                            "Discarding non-UTF-8 binary frame"
                        );
                    }
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    handler.session.touch();
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(
                        call_id = handler.session.call_id(),
                        code = frame.as_ref().map(|f| f.code),
                        "Client closed media stream"
                    );
                    break;
                }
                Some(Err(e)) => {
                    warn!(call_id = handler.session.call_id(), error = %e, "WebSocket read error");
                    break;
                }
                None => break,
            },
            Some(joined) = handler.greetings.join_next(), if !handler.greetings.is_empty() => {
                handler.on_greeting_finished(joined);
            }
            _ = handler.conn.closed() => {
                debug!(call_id = handler.session.call_id(), "Writer closed, ending read loop");
                break;
            }
        }
    }

    handler.cleanup().await;

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        debug!(conn_id = %conn_id, "Writer did not drain in time");
        writer.abort();
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect();

    info!(conn_id = %conn_id, "Media stream disconnected");
}

struct StreamHandler {
    state: Arc<GatewayState>,
    session: Arc<Session>,
    conn: CallConnection,
    greetings: JoinSet<GreetingOutcome>,
    // Cleared once this connection has detached from the session.
    attached: bool,
}

impl StreamHandler {
    async fn on_frame(&mut self, text: &str) -> ControlFlow<()> {
        self.session.touch();

        let event = match protocol::decode_inbound(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(call_id = self.session.call_id(), error = %e, "Discarding malformed frame");
                #[cfg(feature = "metrics")]
                crate::metrics::record_decode_error();
                return ControlFlow::Continue(());
            }
        };
        trace!(call_id = self.session.call_id(), event = event.tag(), "Inbound event");

        match event {
            InboundEvent::Connected(connected) => {
                debug!(call_id = self.session.call_id(), "Stream transport connected");
                if let Some(stream_id) = connected.stream_id() {
                    self.capture_stream_id(&stream_id);
                    self.try_greeting("connected");
                }
            }
            InboundEvent::Start(start) => {
                if let Some(stream_id) = start.stream_id() {
                    self.capture_stream_id(&stream_id);
                }
                info!(
                    call_id = self.session.call_id(),
                    stream_id = self.session.stream_id().unwrap_or_default(),
                    provider_call_id = start.call_id().unwrap_or_default(),
                    "Stream started"
                );
                if self.session.stream_id().is_some() {
                    self.try_greeting("start");
                }
            }
            InboundEvent::Media(media) => self.on_media(media),
            InboundEvent::Stop(stop) => return self.on_stop(stop).await,
            InboundEvent::Mark(mark) => {
                debug!(call_id = self.session.call_id(), mark = %mark.mark.name, "Mark acknowledged");
            }
            InboundEvent::Unknown => {
                debug!(call_id = self.session.call_id(), "Ignoring unknown event");
            }
        }
        ControlFlow::Continue(())
    }

    fn on_media(&mut self, media: MediaEvent) {
        if self.session.stream_id().is_none() {
            if let Some(stream_id) = media.stream_id() {
                if self.capture_stream_id(&stream_id) {
                    self.try_greeting("media");
                }
            }
        }

        if media.media.is_echo() {
            trace!(call_id = self.session.call_id(), "Discarding echoed outbound audio");
            return;
        }

        let Some(payload) = media.media.payload.as_deref() else {
            warn!(call_id = self.session.call_id(), "Media frame without payload");
            return;
        };
        match codec::decode_payload(payload) {
            Ok(audio) if audio.is_empty() => {}
            Ok(audio) => self.session.push_inbound_audio(audio),
            Err(e) => {
                warn!(call_id = self.session.call_id(), error = %e, "Discarding media payload");
            }
        }
    }

    async fn on_stop(&mut self, stop: StopEvent) -> ControlFlow<()> {
        let reason = stop.stop.as_ref().and_then(|s| s.reason.as_deref());
        let (chunks, bytes) = self.session.inbound_stats();
        info!(
            call_id = self.session.call_id(),
            reason = reason.unwrap_or("unspecified"),
            chunks,
            bytes,
            "Stream stopped, inbound audio finalized"
        );
        self.detach().await;
        self.conn.close_normal("Call ended");
        ControlFlow::Break(())
    }

    /// Leave the session once. The last connection out releases it.
    async fn detach(&mut self) {
        if !std::mem::take(&mut self.attached) {
            return;
        }
        if !self.state.registry.detach(&self.session).await {
            debug!(
                call_id = self.session.call_id(),
                remaining = self.session.connection_count(),
                "Session kept for other connections"
            );
        }
    }

    /// Returns `true` if the id was newly captured.
    fn capture_stream_id(&self, stream_id: &str) -> bool {
        match self.session.set_stream_id(stream_id) {
            StreamIdCapture::Captured => {
                info!(call_id = self.session.call_id(), stream_id, "Stream id captured");
                true
            }
            StreamIdCapture::Unchanged | StreamIdCapture::Conflict { .. } => false,
        }
    }

    fn try_greeting(&mut self, trigger: &'static str) {
        if let Some(task) = self.state.greeting.try_start(&self.session, &self.conn) {
            info!(call_id = self.session.call_id(), trigger, "Greeting triggered");
            self.greetings.spawn(task);
        }
    }

    fn on_greeting_finished(&self, joined: Result<GreetingOutcome, tokio::task::JoinError>) {
        match joined {
            Ok(outcome) => {
                info!(
                    call_id = self.session.call_id(),
                    outcome = outcome.label(),
                    "Greeting task finished"
                );
                #[cfg(feature = "metrics")]
                crate::metrics::record_greeting(outcome.label());
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                error!(call_id = self.session.call_id(), error = %e, "Greeting task panicked");
                self.session.finish_greeting(GreetingState::Failed);
            }
        }
    }

    async fn cleanup(mut self) {
        self.conn.mark_closed();
        // Only a greeting this connection started may be failed here; the
        // session can be shared with other connections.
        let owned_greeting = !self.greetings.is_empty();
        self.greetings.shutdown().await;
        if owned_greeting && self.session.greeting_state() == GreetingState::InProgress {
            self.session.finish_greeting(GreetingState::Failed);
        }
        self.detach().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_call_id_key_priority() {
        let params = StreamParams::from_query(&query(&[("callLogId", "log-1"), ("callSid", "CA1")]));
        assert_eq!(params.call_id, "CA1");

        let params = StreamParams::from_query(&query(&[("call_id", "  "), ("callLogId", "log-1")]));
        assert_eq!(params.call_id, "log-1");
    }

    #[test]
    fn test_generated_call_id_when_absent() {
        let a = StreamParams::from_query(&HashMap::new());
        let b = StreamParams::from_query(&HashMap::new());
        assert!(a.call_id.starts_with("call_"));
        assert_ne!(a.call_id, b.call_id);
        assert!(a.stream_id.is_none());
    }

    #[test]
    fn test_stream_id_from_query() {
        let params = StreamParams::from_query(&query(&[("call_id", "CA1"), ("streamSid", "MZ1")]));
        assert_eq!(params.stream_id.as_deref(), Some("MZ1"));
    }
}
