//! Admission control (P8): bounded limit, latency-driven adjustment,
//! immediate rejection without queueing.

mod common;

use std::time::Duration;

use breccia::{AdmissionConfig, Breccia, ExpectedRevision, StoreConfig};
use common::*;

fn open_with_admission(dir: &std::path::Path, admission: AdmissionConfig) -> Breccia {
    Breccia::open_with_config(StoreConfig::new(dir).with_admission(admission)).unwrap()
}

fn drive_appends(store: &Breccia, count: usize) {
    for i in 0..count {
        match store.append(
            "s",
            format!("cmd-{i}").as_str(),
            ExpectedRevision::Any,
            vec![payload("x")],
            tenant_x(),
        ) {
            Ok(_) | Err(breccia::Error::Overloaded) => {}
            Err(other) => panic!("append failed: {other}"),
        }
    }
}

#[test]
fn metrics_snapshot_reports_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_with_admission(
        dir.path(),
        AdmissionConfig {
            target_p99_ms: 60.0,
            hard_cap: 64,
            initial_limit: 8,
            tick_interval: Duration::from_millis(50),
        },
    );

    let metrics = store.admission_metrics();
    assert_eq!(metrics.current_limit, 8);
    assert_eq!(metrics.target_p99_ms, 60.0);
    assert_eq!(metrics.requests_accepted, 0);
    assert_eq!(metrics.requests_rejected, 0);
    assert_eq!(metrics.adjustments, 0);
}

#[test]
fn limit_stays_within_bounds_under_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_with_admission(
        dir.path(),
        AdmissionConfig {
            target_p99_ms: 60.0,
            hard_cap: 16,
            initial_limit: 4,
            tick_interval: Duration::from_millis(10),
        },
    );

    drive_appends(&store, 300);

    let metrics = store.admission_metrics();
    assert!(metrics.current_limit >= 1, "floor is 1");
    assert!(metrics.current_limit <= 16, "ceiling is the hard cap");
    assert!(metrics.requests_accepted + metrics.requests_rejected >= 300);
}

#[test]
fn unreachable_target_shrinks_the_limit_to_the_floor() {
    let dir = tempfile::tempdir().unwrap();
    // A microsecond target no fsync can meet: every evaluation sees p99
    // far above 1.1 × target and steps the limit down.
    let store = open_with_admission(
        dir.path(),
        AdmissionConfig {
            target_p99_ms: 0.000_1,
            hard_cap: 8,
            initial_limit: 8,
            tick_interval: Duration::from_millis(5),
        },
    );

    drive_appends(&store, 400);

    let metrics = store.admission_metrics();
    assert_eq!(metrics.current_limit, 1, "sustained overshoot bottoms out");
    assert!(metrics.adjustments >= 7, "walked down from 8 to 1");
}

#[test]
fn generous_target_never_rejects_sequential_callers() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_with_admission(
        dir.path(),
        AdmissionConfig {
            target_p99_ms: 10_000.0,
            hard_cap: 8,
            initial_limit: 8,
            tick_interval: Duration::from_millis(50),
        },
    );

    // One caller at a time never exceeds a limit of 8.
    for i in 0..50 {
        store
            .append(
                "s",
                format!("cmd-{i}").as_str(),
                ExpectedRevision::Any,
                vec![payload("x")],
                tenant_x(),
            )
            .unwrap();
    }

    let metrics = store.admission_metrics();
    assert_eq!(metrics.requests_accepted, 50);
    assert_eq!(metrics.requests_rejected, 0);
    assert_eq!(metrics.rejection_rate, 0.0);
}

#[test]
fn rejected_writes_do_not_block() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_with_admission(
        dir.path(),
        AdmissionConfig {
            target_p99_ms: 60.0,
            hard_cap: 1,
            initial_limit: 1,
            tick_interval: Duration::from_millis(50),
        },
    );
    let store = std::sync::Arc::new(store);

    // With a limit of one, concurrent callers must either commit or get
    // an immediate Overloaded — never a deadlock.
    let mut handles = Vec::new();
    for thread in 0..4 {
        let store = std::sync::Arc::clone(&store);
        handles.push(std::thread::spawn(move || {
            let mut outcomes = (0u32, 0u32);
            for i in 0..25 {
                match store.append(
                    format!("t-{thread}").as_str(),
                    format!("c-{thread}-{i}").as_str(),
                    ExpectedRevision::Any,
                    vec![payload("x")],
                    tenant_x(),
                ) {
                    Ok(_) => outcomes.0 += 1,
                    Err(breccia::Error::Overloaded) => outcomes.1 += 1,
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
            outcomes
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        let (ok, _shed) = handle.join().unwrap();
        accepted += ok;
    }
    assert!(accepted >= 25, "at least one thread's worth landed");

    let metrics = store.admission_metrics();
    assert_eq!(metrics.current_limit, 1);
    assert_eq!(metrics.requests_accepted as u32, accepted);
}
