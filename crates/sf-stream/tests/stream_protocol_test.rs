use std::time::Duration;

use serde_json::json;
use sf_stream::{subscribe, EventLog, EventType, StreamFrame, TailFrom};
use uuid::Uuid;

#[tokio::test]
async fn publish_order_is_read_order() {
    let log = EventLog::new();
    let run = Uuid::new_v4();

    let sequence = [
        EventType::GenerationStarted,
        EventType::PhaseStart,
        EventType::SceneDraftStart,
        EventType::SceneDraftComplete,
        EventType::PhaseComplete,
    ];
    for event_type in sequence {
        log.publish(run, event_type, json!({}));
    }

    let events = log.range(run, 0, 100);
    let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(types, sequence);
    for window in events.windows(2) {
        assert!(window[0].id < window[1].id);
    }
}

#[tokio::test]
async fn late_joiner_observes_every_event_before_terminal() {
    let log = EventLog::new();
    let run = Uuid::new_v4();

    // Half the history exists before the subscriber connects.
    for _ in 0..10 {
        log.publish(run, EventType::SceneDraftComplete, json!({}));
    }

    let rx = subscribe(log.clone(), run, Duration::from_secs(15));

    let writer = {
        let log = log.clone();
        tokio::spawn(async move {
            for _ in 0..10 {
                log.publish(run, EventType::ScenePolishComplete, json!({}));
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            log.publish(run, EventType::GenerationCompleted, json!({"totalScenes": 20}));
        })
    };

    let mut ids = Vec::new();
    while let Ok(frame) = rx.recv_async().await {
        if let StreamFrame::Event(event) = frame {
            ids.push(event.id);
        }
    }
    writer.await.unwrap();

    assert_eq!(ids, (1..=21).collect::<Vec<u64>>());
}

#[tokio::test]
async fn two_step_join_after_catching_up() {
    let log = EventLog::new();
    let run = Uuid::new_v4();
    for _ in 0..5 {
        log.publish(run, EventType::SceneDraftComplete, json!({}));
    }

    // Step 1: catch up through range.
    let history = log.range(run, 0, 10_000);
    assert_eq!(history.len(), 5);

    // Step 2: switch to `$` tailing; only new events arrive.
    let mut tailer = log.tail(run, TailFrom::Latest, Duration::from_millis(200));
    log.publish(run, EventType::ScenePolishComplete, json!({}));
    let next = tailer.next().await.unwrap();
    assert_eq!(next.id, 6);
}

#[tokio::test]
async fn concurrent_publishers_keep_per_run_order() {
    let log = EventLog::new();
    let run = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..25 {
                log.publish(run, EventType::SceneBeatComplete, json!({}));
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let events = log.range(run, 0, 1000);
    assert_eq!(events.len(), 100);
    let ids: Vec<_> = events.iter().map(|e| e.id).collect();
    assert_eq!(ids, (1..=100).collect::<Vec<u64>>());
}
