use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::event::{Event, EventType};

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Append-only per-run event log.
///
/// Guarantees:
/// - total order per run: ids are assigned under the append lock and
///   strictly increase from 1;
/// - events are visible to `range` and to tailers as soon as `publish`
///   returns;
/// - publishing never blocks on consumers (tailers are woken through a
///   `Notify`, slow ones simply read later).
///
/// In-process retention is unbounded; a durable backend would impose its
/// own retention, in which case a tailer that fell behind must re-enter
/// through `range` (see the subscriber module for the two-step join).
#[derive(Clone, Default)]
pub struct EventLog {
    runs: Arc<DashMap<Uuid, Arc<RunLog>>>,
}

struct RunLog {
    events: RwLock<Vec<Arc<Event>>>,
    notify: Notify,
}

impl RunLog {
    fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            notify: Notify::new(),
        }
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn run_log(&self, run_id: Uuid) -> Arc<RunLog> {
        self.runs
            .entry(run_id)
            .or_insert_with(|| Arc::new(RunLog::new()))
            .clone()
    }

    /// Append an event and return its id.
    pub fn publish(&self, run_id: Uuid, event_type: EventType, data: Value) -> u64 {
        let log = self.run_log(run_id);
        let mut events = log.events.write().expect("event log lock poisoned");
        let id = events.len() as u64 + 1;
        events.push(Arc::new(Event {
            id,
            run_id,
            event_type,
            timestamp: Utc::now(),
            data,
        }));
        drop(events);
        log.notify.notify_waiters();
        tracing::trace!(run_id = %run_id, id, event = %event_type, "event published");
        id
    }

    /// Bounded read of up to `max` events with id >= `from_id`
    /// (`0` reads from the beginning).
    pub fn range(&self, run_id: Uuid, from_id: u64, max: usize) -> Vec<Arc<Event>> {
        let Some(log) = self.runs.get(&run_id).map(|entry| entry.value().clone()) else {
            return Vec::new();
        };
        let events = log.events.read().expect("event log lock poisoned");
        let start = from_id.saturating_sub(1) as usize;
        events.iter().skip(start).take(max).cloned().collect()
    }

    /// Id of the newest event for the run (0 when empty or unknown).
    pub fn head(&self, run_id: Uuid) -> u64 {
        self.runs
            .get(&run_id)
            .map(|log| log.events.read().expect("event log lock poisoned").len() as u64)
            .unwrap_or(0)
    }

    /// Open a blocking tailer. `TailFrom::Latest` is the `$` semantics:
    /// only events published strictly after this call are yielded.
    pub fn tail(&self, run_id: Uuid, from: TailFrom, block: Duration) -> Tailer {
        let log = self.run_log(run_id);
        let cursor = match from {
            TailFrom::Offset(id) => id,
            TailFrom::Latest => log.events.read().expect("event log lock poisoned").len() as u64,
        };
        Tailer {
            log,
            cursor,
            block,
            finished: false,
        }
    }

    /// Drop a run's log (registry eviction).
    pub fn evict(&self, run_id: Uuid) {
        self.runs.remove(&run_id);
    }
}

// ---------------------------------------------------------------------------
// TailFrom
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailFrom {
    /// Resume after the given event id (0 = from the beginning).
    Offset(u64),
    /// Only events strictly after the current head (`$`).
    Latest,
}

// ---------------------------------------------------------------------------
// Tailer
// ---------------------------------------------------------------------------

/// A blocking, long-lived reader over one run's events.
///
/// `next` yields the next unseen event, waiting up to the configured block
/// duration when none is available (a timeout yields `None` but leaves the
/// tailer usable). After a terminal event has been yielded, `next` always
/// returns `None`.
pub struct Tailer {
    log: Arc<RunLog>,
    cursor: u64,
    block: Duration,
    finished: bool,
}

impl Tailer {
    pub async fn next(&mut self) -> Option<Arc<Event>> {
        if self.finished {
            return None;
        }
        let deadline = tokio::time::Instant::now() + self.block;

        loop {
            // Register for wakeups before checking, so a publish between
            // the check and the await is not lost.
            let notified = self.log.notify.notified();

            if let Some(event) = self.peek_next() {
                self.cursor = event.id;
                if event.is_terminal() {
                    self.finished = true;
                }
                return Some(event);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    fn peek_next(&self) -> Option<Arc<Event>> {
        let events = self.log.events.read().expect("event log lock poisoned");
        events.get(self.cursor as usize).cloned()
    }

    /// Id of the last event yielded.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// True once a terminal event has been yielded.
    pub fn finished(&self) -> bool {
        self.finished
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_monotonic_from_one() {
        let log = EventLog::new();
        let run = Uuid::new_v4();
        assert_eq!(log.publish(run, EventType::GenerationStarted, json!({})), 1);
        assert_eq!(log.publish(run, EventType::PhaseStart, json!({})), 2);
        assert_eq!(log.publish(run, EventType::PhaseComplete, json!({})), 3);
        assert_eq!(log.head(run), 3);
    }

    #[test]
    fn range_reads_from_offset() {
        let log = EventLog::new();
        let run = Uuid::new_v4();
        for _ in 0..5 {
            log.publish(run, EventType::PhaseStart, json!({}));
        }
        let all = log.range(run, 0, 100);
        assert_eq!(all.len(), 5);
        let tail = log.range(run, 4, 100);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].id, 4);
        let bounded = log.range(run, 0, 2);
        assert_eq!(bounded.len(), 2);
    }

    #[test]
    fn runs_are_isolated() {
        let log = EventLog::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        log.publish(a, EventType::PhaseStart, json!({}));
        assert_eq!(log.publish(b, EventType::PhaseStart, json!({})), 1);
        assert_eq!(log.range(a, 0, 10).len(), 1);
    }

    #[tokio::test]
    async fn tailer_yields_existing_then_new_events() {
        let log = EventLog::new();
        let run = Uuid::new_v4();
        log.publish(run, EventType::GenerationStarted, json!({}));

        let mut tailer = log.tail(run, TailFrom::Offset(0), Duration::from_millis(500));
        assert_eq!(tailer.next().await.unwrap().id, 1);

        let log_ref = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            log_ref.publish(run, EventType::PhaseStart, json!({}));
        });
        assert_eq!(tailer.next().await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn latest_skips_history() {
        let log = EventLog::new();
        let run = Uuid::new_v4();
        log.publish(run, EventType::GenerationStarted, json!({}));
        log.publish(run, EventType::PhaseStart, json!({}));

        let mut tailer = log.tail(run, TailFrom::Latest, Duration::from_millis(50));
        log.publish(run, EventType::PhaseComplete, json!({}));
        let event = tailer.next().await.unwrap();
        assert_eq!(event.id, 3);
    }

    #[tokio::test]
    async fn tailer_stops_after_terminal_event() {
        let log = EventLog::new();
        let run = Uuid::new_v4();
        log.publish(run, EventType::GenerationCompleted, json!({"totalScenes": 2}));

        let mut tailer = log.tail(run, TailFrom::Offset(0), Duration::from_millis(50));
        let event = tailer.next().await.unwrap();
        assert!(event.is_terminal());
        assert!(tailer.finished());
        assert!(tailer.next().await.is_none());
    }

    #[tokio::test]
    async fn tailer_times_out_but_stays_usable() {
        let log = EventLog::new();
        let run = Uuid::new_v4();
        let mut tailer = log.tail(run, TailFrom::Latest, Duration::from_millis(10));
        assert!(tailer.next().await.is_none());

        log.publish(run, EventType::PhaseStart, json!({}));
        assert!(tailer.next().await.is_some());
    }
}
