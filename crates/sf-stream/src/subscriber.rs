//! Transport-agnostic stream subscriber protocol.
//!
//! On connect the subscriber receives a `connected` frame, then the entire
//! existing history, then live events until a terminal frame (`ERROR` or
//! `generation_completed`), after which the channel closes. While idle, a
//! keepalive heartbeat is emitted at least every `heartbeat` interval
//! (15 s by default) to defeat intermediary idle-timeouts; heartbeats never
//! occupy event ids.
//!
//! Late-join is the two-step protocol: history is drained via
//! `range(run, 0, …)` first, and the live tail then resumes from the last
//! replayed id, so no event published between the two steps is lost.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::event::Event;
use crate::log::{EventLog, TailFrom};

/// Default keepalive interval; intermediary idle-timeouts start biting
/// somewhere above this.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

const REPLAY_CHUNK: usize = 1024;

// ---------------------------------------------------------------------------
// StreamFrame
// ---------------------------------------------------------------------------

/// One frame on a subscriber channel.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Connected { run_id: Uuid },
    Event(Arc<Event>),
    Heartbeat,
}

impl StreamFrame {
    /// Wire form of the frame.
    pub fn to_wire(&self) -> Value {
        match self {
            StreamFrame::Connected { run_id } => json!({
                "type": "connected",
                "runId": run_id,
                "timestamp": Utc::now(),
            }),
            StreamFrame::Event(event) => {
                serde_json::to_value(event.as_ref()).unwrap_or_else(|_| json!({"type": "ERROR"}))
            }
            StreamFrame::Heartbeat => json!({
                "type": "heartbeat",
                "timestamp": Utc::now(),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Event(event) if event.is_terminal())
    }
}

// ---------------------------------------------------------------------------
// subscribe
// ---------------------------------------------------------------------------

/// Subscribe to a run's event stream. The forwarder task owns the tail and
/// exits when the stream reaches a terminal event or the receiver is
/// dropped; publishing is never blocked by a slow receiver.
pub fn subscribe(log: EventLog, run_id: Uuid, heartbeat: Duration) -> flume::Receiver<StreamFrame> {
    let (tx, rx) = flume::unbounded();

    tokio::spawn(async move {
        if tx.send(StreamFrame::Connected { run_id }).is_err() {
            return;
        }

        // Step 1: replay the full history in chunks.
        let mut last_id = 0u64;
        let mut terminal_seen = false;
        loop {
            let chunk = log.range(run_id, last_id + 1, REPLAY_CHUNK);
            if chunk.is_empty() {
                break;
            }
            for event in chunk {
                last_id = event.id;
                terminal_seen = event.is_terminal();
                if tx.send(StreamFrame::Event(event)).is_err() {
                    return;
                }
                if terminal_seen {
                    break;
                }
            }
            if terminal_seen {
                break;
            }
        }
        if terminal_seen {
            tracing::debug!(run_id = %run_id, "stream closed during replay");
            return;
        }

        // Step 2: live tail from the last replayed id, heartbeating while
        // idle.
        let mut tailer = log.tail(run_id, TailFrom::Offset(last_id), heartbeat);
        loop {
            match tailer.next().await {
                Some(event) => {
                    let terminal = event.is_terminal();
                    if tx.send(StreamFrame::Event(event)).is_err() {
                        return;
                    }
                    if terminal {
                        tracing::debug!(run_id = %run_id, "stream closed on terminal event");
                        return;
                    }
                }
                None => {
                    if tx.send(StreamFrame::Heartbeat).is_err() {
                        return;
                    }
                }
            }
        }
    });

    rx
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    #[tokio::test]
    async fn connected_frame_comes_first() {
        let log = EventLog::new();
        let run = Uuid::new_v4();
        log.publish(run, EventType::GenerationStarted, json!({}));

        let rx = subscribe(log, run, DEFAULT_HEARTBEAT);
        let first = rx.recv_async().await.unwrap();
        assert!(matches!(first, StreamFrame::Connected { .. }));
        let second = rx.recv_async().await.unwrap();
        match second {
            StreamFrame::Event(event) => assert_eq!(event.event_type, EventType::GenerationStarted),
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn replay_then_live_without_gaps() {
        let log = EventLog::new();
        let run = Uuid::new_v4();
        log.publish(run, EventType::GenerationStarted, json!({}));
        log.publish(run, EventType::PhaseStart, json!({}));

        let rx = subscribe(log.clone(), run, DEFAULT_HEARTBEAT);
        // Publish while the subscriber may still be replaying.
        log.publish(run, EventType::PhaseComplete, json!({}));
        log.publish(run, EventType::GenerationCompleted, json!({}));

        let mut ids = Vec::new();
        while let Ok(frame) = rx.recv_async().await {
            if let StreamFrame::Event(event) = frame {
                ids.push(event.id);
            }
        }
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn stream_closes_after_terminal() {
        let log = EventLog::new();
        let run = Uuid::new_v4();
        log.publish(run, EventType::Error, json!({"error": "boom"}));

        let rx = subscribe(log, run, DEFAULT_HEARTBEAT);
        let mut saw_terminal = false;
        while let Ok(frame) = rx.recv_async().await {
            if frame.is_terminal() {
                saw_terminal = true;
            }
        }
        // Channel closed after the terminal frame.
        assert!(saw_terminal);
    }

    #[tokio::test]
    async fn idle_stream_heartbeats() {
        let log = EventLog::new();
        let run = Uuid::new_v4();
        let rx = subscribe(log, run, Duration::from_millis(20));

        let _connected = rx.recv_async().await.unwrap();
        let frame = rx.recv_async().await.unwrap();
        assert!(matches!(frame, StreamFrame::Heartbeat));
    }

    #[test]
    fn heartbeat_wire_shape() {
        let wire = StreamFrame::Heartbeat.to_wire();
        assert_eq!(wire["type"], json!("heartbeat"));
        assert!(wire.get("timestamp").is_some());
    }
}
