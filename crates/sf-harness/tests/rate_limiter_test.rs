use std::sync::Arc;

use sf_core::config::RateWindowConfig;
use sf_harness::rate_limiter::{GateError, Identity, RateLimitGate};

fn window(max: u32) -> RateWindowConfig {
    RateWindowConfig {
        window_secs: 60,
        max,
    }
}

fn gate() -> RateLimitGate {
    RateLimitGate::new(window(100), window(10))
}

#[test]
fn burst_of_1000_admits_exactly_the_limit() {
    let gate = gate();
    let identity = Identity::resolve(Some("burst-user"), None, None);
    let cfg = window(100);

    let mut admitted = 0;
    let mut limited = 0;
    for i in 0..1000u64 {
        match gate.admit_at(&identity, "default", cfg, 1_000 + i) {
            Ok(_) => admitted += 1,
            Err(GateError::RateLimited { .. }) => limited += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(admitted, 100);
    assert_eq!(limited, 900);
}

#[test]
fn following_window_admits_the_limit_again() {
    let gate = gate();
    let identity = Identity::resolve(Some("window-user"), None, None);
    let cfg = window(10);

    for i in 0..10u64 {
        gate.admit_at(&identity, "expensive", cfg, 1_000 + i).unwrap();
    }
    assert!(gate.admit_at(&identity, "expensive", cfg, 1_100).is_err());

    // Entire previous window aged out.
    let later = 1_000 + cfg.window_ms() + 1_000;
    let mut admitted = 0;
    for i in 0..20u64 {
        if gate.admit_at(&identity, "expensive", cfg, later + i).is_ok() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

#[test]
fn identities_do_not_share_windows() {
    let gate = gate();
    let cfg = window(2);
    let alice = Identity::resolve(Some("alice"), None, None);
    let bob = Identity::resolve(Some("bob"), None, None);

    gate.admit_at(&alice, "t", cfg, 1_000).unwrap();
    gate.admit_at(&alice, "t", cfg, 1_001).unwrap();
    assert!(gate.admit_at(&alice, "t", cfg, 1_002).is_err());

    // Bob's window is untouched.
    assert!(gate.admit_at(&bob, "t", cfg, 1_003).is_ok());
}

#[test]
fn rate_limited_error_carries_retry_hint() {
    let gate = gate();
    let identity = Identity::resolve(None, Some("sk-ant-test-key"), None);
    let cfg = window(1);

    gate.admit_at(&identity, "expensive", cfg, 5_000).unwrap();
    match gate.admit_at(&identity, "expensive", cfg, 5_001) {
        Err(GateError::RateLimited {
            retry_after_secs,
            reset_epoch_secs,
            ..
        }) => {
            assert_eq!(retry_after_secs, 60);
            assert!(reset_epoch_secs >= 65);
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_admissions_never_exceed_the_limit() {
    let gate = Arc::new(gate());
    let cfg = window(50);

    let mut handles = Vec::new();
    for worker in 0..8u64 {
        let gate_ref = gate.clone();
        handles.push(tokio::spawn(async move {
            let identity = Identity::resolve(Some("shared"), None, None);
            let mut admitted = 0u32;
            for i in 0..100u64 {
                if gate_ref
                    .admit_at(&identity, "t", cfg, 10_000 + worker * 100 + i)
                    .is_ok()
                {
                    admitted += 1;
                }
            }
            admitted
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    assert_eq!(total, 50);
}
