//! Serialized outbound sends for one WebSocket connection.
//!
//! All writers share one unbounded channel drained by a single writer task,
//! so frames reach the socket in the order they were queued.

use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::ws::{CloseFrame, Message, close_code};
use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace};

use voicebot_core::error::{Result, VoicebotError};
use voicebot_core::protocol::OutboundFrame;
use voicebot_core::session::Session;
use voicebot_media::codec;

/// Cloneable handle for sending on one connection.
#[derive(Clone)]
pub struct CallConnection {
    conn_id: Arc<str>,
    tx: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
    // Held while claiming a sequence number and queueing its frame, so wire
    // order always matches sequence order.
    send_lock: Arc<Mutex<()>>,
}

impl CallConnection {
    /// Create a handle and the receiver its writer task drains.
    pub fn new(conn_id: &str) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self {
            conn_id: conn_id.into(),
            tx,
            closed: CancellationToken::new(),
            send_lock: Arc::new(Mutex::new(())),
        };
        (conn, rx)
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Stop accepting sends. Frames already queued are still written.
    pub fn mark_closed(&self) {
        self.closed.cancel();
    }

    /// Encode `chunk` as the session's next media frame and queue it.
    ///
    /// `Ok(false)` means the codec dropped the frame (session inactive or no
    /// stream id). A closed connection is `SendOnClosedConnection`, checked
    /// before a sequence number is claimed.
    pub fn send_media(&self, session: &Session, chunk: &[u8]) -> Result<bool> {
        let _guard = self.send_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_open() {
            return Err(VoicebotError::SendOnClosedConnection);
        }
        match codec::encode_frame(session, chunk) {
            Some(frame) => self.queue(&frame).map(|()| true),
            None => Ok(false),
        }
    }

    /// Queue a `mark` frame for the session.
    pub fn send_mark(&self, session: &Session, name: &str) -> Result<bool> {
        let _guard = self.send_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_open() {
            return Err(VoicebotError::SendOnClosedConnection);
        }
        match codec::encode_mark(session, name) {
            Some(frame) => self.queue(&frame).map(|()| true),
            None => Ok(false),
        }
    }

    /// Queue a normal-closure close frame and stop accepting sends.
    pub fn close_normal(&self, reason: &str) {
        let _guard = self.send_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.is_cancelled() {
            return;
        }
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: reason.into(),
        };
        if self.tx.send(Message::Close(Some(frame))).is_err() {
            debug!(conn_id = %self.conn_id, "Writer already gone, close frame dropped");
        }
        self.closed.cancel();
    }

    fn queue(&self, frame: &OutboundFrame) -> Result<()> {
        let text = frame.to_json()?;
        self.tx
            .send(Message::Text(text.into()))
            .map_err(|_| VoicebotError::SendOnClosedConnection)
    }
}

/// Drain queued messages into the socket until the queue closes, a close
/// frame is written, or the socket fails. Marks the connection closed on exit.
pub async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Message>,
    closed: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            debug!(error = %e, "WebSocket send failed, stopping writer");
            break;
        }
        if is_close {
            trace!("Close frame written");
            break;
        }
    }
    closed.cancel();
}
