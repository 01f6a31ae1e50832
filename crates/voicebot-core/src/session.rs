//! Per-call session state.
//!
//! A [`Session`] is shared between the connection's read loop and the
//! greeting task, so every field uses interior mutability. The greeting
//! state is a single atomic byte; entering `InProgress` is a compare-and-set
//! so racing triggers cannot start two greetings.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum GreetingState {
    NotStarted = 0,
    InProgress = 1,
    Sent = 2,
    /// Retry-eligible: the next qualifying event may start a new attempt.
    Failed = 3,
}

impl GreetingState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::InProgress,
            2 => Self::Sent,
            3 => Self::Failed,
            _ => Self::NotStarted,
        }
    }

    fn can_start(self) -> bool {
        matches!(self, Self::NotStarted | Self::Failed)
    }
}

/// Result of offering a stream id to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamIdCapture {
    /// The id was unset and is now set.
    Captured,
    /// The same id was already set.
    Unchanged,
    /// A different id was already set; the offered one was ignored.
    Conflict { existing: String },
}

#[derive(Debug, Default)]
struct InboundAudio {
    chunks: Vec<Vec<u8>>,
    bytes: usize,
}

/// State for one active call.
#[derive(Debug)]
pub struct Session {
    call_id: String,
    stream_id: OnceLock<String>,
    sequence: AtomicU64,
    connected_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    active: AtomicBool,
    greeting: AtomicU8,
    inbound: Mutex<InboundAudio>,
    // WebSocket connections currently attached under this call id.
    connections: AtomicUsize,
}

/// Serializable point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub call_id: String,
    pub stream_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub sequence_number: u64,
    pub is_active: bool,
    pub greeting_state: GreetingState,
    pub connections: usize,
    pub audio_chunks_buffered: usize,
    pub audio_bytes_buffered: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub fn new(call_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            call_id: call_id.into(),
            stream_id: OnceLock::new(),
            sequence: AtomicU64::new(0),
            connected_at: now,
            last_activity: Mutex::new(now),
            active: AtomicBool::new(true),
            greeting: AtomicU8::new(GreetingState::NotStarted as u8),
            inbound: Mutex::new(InboundAudio::default()),
            connections: AtomicUsize::new(0),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.get().map(String::as_str)
    }

    /// Offer a stream id. The first non-empty id wins and never changes.
    pub fn set_stream_id(&self, stream_id: &str) -> StreamIdCapture {
        if stream_id.is_empty() {
            return StreamIdCapture::Unchanged;
        }
        match self.stream_id.set(stream_id.to_owned()) {
            Ok(()) => StreamIdCapture::Captured,
            Err(_) => {
                let existing = self.stream_id().unwrap_or_default();
                if existing == stream_id {
                    StreamIdCapture::Unchanged
                } else {
                    warn!(
                        call_id = %self.call_id,
                        existing,
                        offered = stream_id,
                        "Ignoring stream id change"
                    );
                    StreamIdCapture::Conflict {
                        existing: existing.to_owned(),
                    }
                }
            }
        }
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *lock(&self.last_activity)
    }

    pub fn touch(&self) {
        *lock(&self.last_activity) = Utc::now();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark the session terminated. Returns `true` on the first call only.
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    /// Sequence number the next outbound frame will carry.
    pub fn sequence_number(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Claim the current sequence number and advance the counter.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel)
    }

    /// Count one more attached connection. Returns the new count.
    pub fn attach(&self) -> usize {
        self.connections.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Count one connection gone. Returns how many remain; never underflows.
    pub fn detach(&self) -> usize {
        match self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    pub fn greeting_state(&self) -> GreetingState {
        GreetingState::from_u8(self.greeting.load(Ordering::Acquire))
    }

    /// Atomically move `NotStarted`/`Failed` to `InProgress`.
    ///
    /// Returns `false` if a greeting is already running or has been sent.
    pub fn try_begin_greeting(&self) -> bool {
        self.greeting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                GreetingState::from_u8(current)
                    .can_start()
                    .then_some(GreetingState::InProgress as u8)
            })
            .is_ok()
    }

    /// Leave `InProgress` for `Sent` or `Failed`.
    pub fn finish_greeting(&self, outcome: GreetingState) {
        debug_assert!(matches!(outcome, GreetingState::Sent | GreetingState::Failed));
        let _ = self.greeting.compare_exchange(
            GreetingState::InProgress as u8,
            outcome as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Append caller audio. Ignored once the session is inactive.
    pub fn push_inbound_audio(&self, chunk: Vec<u8>) {
        if !self.is_active() {
            return;
        }
        let mut inbound = lock(&self.inbound);
        inbound.bytes += chunk.len();
        inbound.chunks.push(chunk);
    }

    /// (chunks, bytes) currently buffered.
    pub fn inbound_stats(&self) -> (usize, usize) {
        let inbound = lock(&self.inbound);
        (inbound.chunks.len(), inbound.bytes)
    }

    /// Deactivate and drop all buffered inbound audio. Returns what was
    /// buffered as (chunks, bytes).
    pub fn release(&self) -> (usize, usize) {
        self.deactivate();
        let mut inbound = lock(&self.inbound);
        let stats = (inbound.chunks.len(), inbound.bytes);
        *inbound = InboundAudio::default();
        stats
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (audio_chunks_buffered, audio_bytes_buffered) = self.inbound_stats();
        SessionSnapshot {
            call_id: self.call_id.clone(),
            stream_id: self.stream_id().map(str::to_owned),
            connected_at: self.connected_at,
            last_activity: self.last_activity(),
            sequence_number: self.sequence_number(),
            is_active: self.is_active(),
            greeting_state: self.greeting_state(),
            connections: self.connection_count(),
            audio_chunks_buffered,
            audio_bytes_buffered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_new_session_defaults() {
        let session = Session::new("CA1");
        assert_eq!(session.call_id(), "CA1");
        assert!(session.stream_id().is_none());
        assert_eq!(session.sequence_number(), 0);
        assert!(session.is_active());
        assert_eq!(session.greeting_state(), GreetingState::NotStarted);
        assert_eq!(session.inbound_stats(), (0, 0));
    }

    #[test]
    fn test_stream_id_is_immutable() {
        let session = Session::new("CA1");
        assert_eq!(session.set_stream_id(""), StreamIdCapture::Unchanged);
        assert!(session.stream_id().is_none());

        assert_eq!(session.set_stream_id("MZ1"), StreamIdCapture::Captured);
        assert_eq!(session.set_stream_id("MZ1"), StreamIdCapture::Unchanged);
        assert_eq!(
            session.set_stream_id("MZ2"),
            StreamIdCapture::Conflict {
                existing: "MZ1".into()
            }
        );
        assert_eq!(session.stream_id(), Some("MZ1"));
    }

    #[test]
    fn test_sequence_claims_current_then_advances() {
        let session = Session::new("CA1");
        assert_eq!(session.next_sequence(), 0);
        assert_eq!(session.next_sequence(), 1);
        assert_eq!(session.sequence_number(), 2);
    }

    #[test]
    fn test_greeting_transitions() {
        let session = Session::new("CA1");
        assert!(session.try_begin_greeting());
        assert_eq!(session.greeting_state(), GreetingState::InProgress);
        assert!(!session.try_begin_greeting());

        session.finish_greeting(GreetingState::Failed);
        assert_eq!(session.greeting_state(), GreetingState::Failed);

        // Failed is retry-eligible
        assert!(session.try_begin_greeting());
        session.finish_greeting(GreetingState::Sent);
        assert_eq!(session.greeting_state(), GreetingState::Sent);
        assert!(!session.try_begin_greeting());
    }

    #[test]
    fn test_finish_without_begin_is_ignored() {
        let session = Session::new("CA1");
        session.finish_greeting(GreetingState::Sent);
        assert_eq!(session.greeting_state(), GreetingState::NotStarted);
    }

    #[test]
    fn test_concurrent_begin_single_winner() {
        let session = Arc::new(Session::new("CA1"));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || session.try_begin_greeting())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_inbound_buffer_and_release() {
        let session = Session::new("CA1");
        session.push_inbound_audio(vec![1, 2, 3]);
        session.push_inbound_audio(vec![4]);
        assert_eq!(session.inbound_stats(), (2, 4));

        assert_eq!(session.release(), (2, 4));
        assert!(!session.is_active());
        assert_eq!(session.inbound_stats(), (0, 0));

        session.push_inbound_audio(vec![5]);
        assert_eq!(session.inbound_stats(), (0, 0));
    }

    #[test]
    fn test_attach_detach_counts() {
        let session = Session::new("CA1");
        assert_eq!(session.attach(), 1);
        assert_eq!(session.attach(), 2);
        assert_eq!(session.detach(), 1);
        assert_eq!(session.detach(), 0);
        assert_eq!(session.detach(), 0);
        assert_eq!(session.connection_count(), 0);
    }

    #[test]
    fn test_deactivate_reports_first_call() {
        let session = Session::new("CA1");
        assert!(session.deactivate());
        assert!(!session.deactivate());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let session = Session::new("CA1");
        session.set_stream_id("MZ1");
        let value = serde_json::to_value(session.snapshot()).unwrap();
        assert_eq!(value["callId"], "CA1");
        assert_eq!(value["streamId"], "MZ1");
        assert_eq!(value["greetingState"], "not_started");
        assert_eq!(value["isActive"], true);
    }
}
