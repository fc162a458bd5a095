//! Projection runtime: catch-up, exactly-once effect, error policy,
//! determinism checking, tenant erasure.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use breccia::{
    Breccia, Error, ErrorAction, Event, ExpectedRevision, HandlerError, ProjectionHandler,
    ProjectionOptions, Row, StagedTable, TableOp, TenantId, Value,
};
use common::*;

/// Counts `Inc` events per id into the `counts` table.
struct CountsHandler;

impl CountsHandler {
    fn parse(event: &Event) -> Result<serde_json::Value, HandlerError> {
        serde_json::from_slice(&event.payload)
            .map_err(|e| HandlerError::new(format!("bad payload: {e}")))
    }
}

impl ProjectionHandler for CountsHandler {
    fn apply(&mut self, event: &Event, table: &mut StagedTable<'_>) -> Result<(), HandlerError> {
        let body = Self::parse(event)?;
        if body["kind"] != "Inc" {
            return Ok(());
        }
        let id = body["id"]
            .as_str()
            .ok_or_else(|| HandlerError::new("Inc without id"))?;

        let key = Value::from(id);
        let current = table
            .get(&key)
            .and_then(|row| match row.get("n") {
                Some(Value::Integer(n)) => Some(*n),
                _ => None,
            })
            .unwrap_or(0);

        let mut row = Row::new();
        row.insert("n".to_string(), Value::Integer(current + 1));
        table.set(key, row);
        Ok(())
    }
}

fn append_incs(store: &Breccia, count: usize, id: &str, tenant: &TenantId) {
    // Commands of 100 events each keep the append path realistic.
    let mut appended = 0;
    let mut batch_no = 0;
    while appended < count {
        let take = (count - appended).min(100);
        store
            .append(
                format!("{id}-events").as_str(),
                format!("inc-{id}-{batch_no}").as_str(),
                ExpectedRevision::Any,
                (0..take).map(|_| inc_payload(id)).collect(),
                tenant.clone(),
            )
            .unwrap();
        appended += take;
        batch_no += 1;
    }
}

#[test]
fn projection_catches_up_and_counts() {
    let (_dir, store) = open_store();
    let tenant = TenantId::new("T");
    append_incs(&store, 1000, "x", &tenant);

    store.init_projections().unwrap();
    store
        .register_projection("counts", counts_schema(), ProjectionOptions::default())
        .unwrap();
    store
        .start_projection("counts", Box::new(CountsHandler))
        .unwrap();

    wait_for_checkpoint(&store, "counts", 1000, Duration::from_secs(20));

    let row = store
        .read_projection_row("counts", &tenant, &Value::from("x"))
        .unwrap()
        .expect("row exists");
    assert_eq!(row.get("id"), Some(&Value::from("x")));
    assert_eq!(row.get("n"), Some(&Value::Integer(1000)));

    store.stop_projection("counts").unwrap();
    assert!(!store.projection_failed("counts").unwrap());
}

#[test]
fn tenant_deletion_erases_only_that_tenant() {
    let (_dir, store) = open_store();
    let tenant_t = TenantId::new("T");
    let tenant_u = TenantId::new("U");
    append_incs(&store, 20, "x", &tenant_t);
    append_incs(&store, 7, "y", &tenant_u);

    store.init_projections().unwrap();
    store
        .register_projection("counts", counts_schema(), ProjectionOptions::default())
        .unwrap();
    store
        .start_projection("counts", Box::new(CountsHandler))
        .unwrap();
    wait_for_checkpoint(&store, "counts", 27, Duration::from_secs(10));
    store.stop_projection("counts").unwrap();

    let deleted = store
        .delete_tenant_from_projection("counts", &tenant_t)
        .unwrap();
    assert_eq!(deleted, 1);
    assert!(store
        .read_projection_row("counts", &tenant_t, &Value::from("x"))
        .unwrap()
        .is_none());

    // The other tenant's rows are untouched.
    let row = store
        .read_projection_row("counts", &tenant_u, &Value::from("y"))
        .unwrap()
        .expect("row exists");
    assert_eq!(row.get("n"), Some(&Value::Integer(7)));
}

/// P7: the committed projection state equals a replay of the filtered log
/// against an empty table.
#[test]
fn committed_state_equals_replay() {
    let (_dir, store) = open_store();
    let tenant = TenantId::new("T");
    for id in ["a", "b", "c"] {
        append_incs(&store, 13, id, &tenant);
    }

    store.init_projections().unwrap();
    store
        .register_projection("counts", counts_schema(), ProjectionOptions::default())
        .unwrap();
    store
        .start_projection("counts", Box::new(CountsHandler))
        .unwrap();
    wait_for_checkpoint(&store, "counts", 39, Duration::from_secs(10));
    store.stop_projection("counts").unwrap();

    // Reference replay straight off the log.
    let mut expected: HashMap<String, i64> = HashMap::new();
    for event in store.read_global(pos(1), usize::MAX).unwrap() {
        let body: serde_json::Value = serde_json::from_slice(&event.payload).unwrap();
        if body["kind"] == "Inc" {
            *expected
                .entry(body["id"].as_str().unwrap().to_string())
                .or_default() += 1;
        }
    }

    for (id, n) in expected {
        let row = store
            .read_projection_row("counts", &tenant, &Value::from(id.as_str()))
            .unwrap()
            .expect("row exists");
        assert_eq!(row.get("n"), Some(&Value::Integer(n)), "id {id}");
    }
}

#[test]
fn worker_resumes_from_checkpoint_without_double_effect() {
    let (_dir, store) = open_store();
    let tenant = TenantId::new("T");
    append_incs(&store, 250, "x", &tenant);

    store.init_projections().unwrap();
    store
        .register_projection("counts", counts_schema(), ProjectionOptions::default())
        .unwrap();
    store
        .start_projection("counts", Box::new(CountsHandler))
        .unwrap();
    wait_for_checkpoint(&store, "counts", 250, Duration::from_secs(10));
    store.stop_projection("counts").unwrap();

    // More events while the worker is down, then a fresh handler instance.
    append_incs(&store, 50, "x", &tenant);
    store
        .start_projection("counts", Box::new(CountsHandler))
        .unwrap();
    wait_for_checkpoint(&store, "counts", 300, Duration::from_secs(10));
    store.stop_projection("counts").unwrap();

    let row = store
        .read_projection_row("counts", &tenant, &Value::from("x"))
        .unwrap()
        .expect("row exists");
    assert_eq!(row.get("n"), Some(&Value::Integer(300)));
}

// ----------------------------------------------------------------------
// Error policy
// ----------------------------------------------------------------------

/// Fails on `Poison` payloads with a configurable verdict.
struct PoisonHandler {
    verdict: ErrorAction,
}

impl ProjectionHandler for PoisonHandler {
    fn apply(&mut self, event: &Event, table: &mut StagedTable<'_>) -> Result<(), HandlerError> {
        if event.payload.as_ref() == b"Poison" {
            // Buffer a partial op first: skip/retry must rewind it.
            let mut junk = Row::new();
            junk.insert("n".to_string(), Value::Integer(-1));
            table.set(Value::from("junk"), junk);
            return Err(HandlerError::new("poisoned event"));
        }

        let key = Value::from("ok");
        let n = table
            .get(&key)
            .and_then(|row| match row.get("n") {
                Some(Value::Integer(n)) => Some(*n),
                _ => None,
            })
            .unwrap_or(0);
        let mut row = Row::new();
        row.insert("n".to_string(), Value::Integer(n + 1));
        table.set(key, row);
        Ok(())
    }

    fn on_error(&self, _error: &HandlerError, _event: &Event) -> ErrorAction {
        self.verdict
    }
}

fn poison_fixture(verdict: ErrorAction) -> (tempfile::TempDir, Breccia) {
    let (dir, store) = open_store();
    store
        .append(
            "s",
            "cmd",
            ExpectedRevision::NoStream,
            vec![payload("fine"), poison_event(), payload("fine")],
            TenantId::new("T"),
        )
        .unwrap();
    store.init_projections().unwrap();
    store
        .register_projection("counts", counts_schema(), ProjectionOptions::default())
        .unwrap();
    store
        .start_projection("counts", Box::new(PoisonHandler { verdict }))
        .unwrap();
    (dir, store)
}

fn poison_event() -> breccia::EventData {
    breccia::EventData::new(&b"Poison"[..])
}

#[test]
fn skip_verdict_drops_only_the_poisoned_event() {
    let (_dir, store) = poison_fixture(ErrorAction::Skip);
    wait_for_checkpoint(&store, "counts", 3, Duration::from_secs(10));
    store.stop_projection("counts").unwrap();
    assert!(!store.projection_failed("counts").unwrap());

    let tenant = TenantId::new("T");
    let row = store
        .read_projection_row("counts", &tenant, &Value::from("ok"))
        .unwrap()
        .expect("row exists");
    assert_eq!(row.get("n"), Some(&Value::Integer(2)));

    // The failed attempt's partial op was rewound, not committed.
    assert!(store
        .read_projection_row("counts", &tenant, &Value::from("junk"))
        .unwrap()
        .is_none());
}

#[test]
fn stop_verdict_fails_the_worker_without_progress() {
    let (_dir, store) = poison_fixture(ErrorAction::Stop);
    wait_until(Duration::from_secs(10), "worker failure", || {
        store.projection_failed("counts").unwrap()
    });

    // The whole batch was abandoned: no checkpoint, no rows.
    assert_eq!(store.get_projection_checkpoint("counts").unwrap(), None);
    assert!(store
        .read_projection_row("counts", &TenantId::new("T"), &Value::from("ok"))
        .unwrap()
        .is_none());
}

#[test]
fn retry_that_keeps_failing_escalates_to_stop() {
    let (_dir, store) = poison_fixture(ErrorAction::Retry);
    wait_until(Duration::from_secs(10), "worker failure", || {
        store.projection_failed("counts").unwrap()
    });
    assert_eq!(store.get_projection_checkpoint("counts").unwrap(), None);
}

/// Fails each poisoned position exactly once, then succeeds: `Retry`
/// recovers and the staged view is re-seeded in between.
struct FailOnceHandler {
    attempts: HashMap<u64, u32>,
}

impl ProjectionHandler for FailOnceHandler {
    fn apply(&mut self, event: &Event, table: &mut StagedTable<'_>) -> Result<(), HandlerError> {
        let key = Value::from("count");
        let n = table
            .get(&key)
            .and_then(|row| match row.get("n") {
                Some(Value::Integer(n)) => Some(*n),
                _ => None,
            })
            .unwrap_or(0);
        let mut row = Row::new();
        row.insert("n".to_string(), Value::Integer(n + 1));
        table.set(key, row);

        if event.payload.as_ref() == b"FailOnce" {
            let attempts = self.attempts.entry(event.global_pos.as_u64()).or_insert(0);
            *attempts += 1;
            if *attempts == 1 {
                return Err(HandlerError::new("transient failure"));
            }
        }
        Ok(())
    }

    fn on_error(&self, _error: &HandlerError, _event: &Event) -> ErrorAction {
        ErrorAction::Retry
    }
}

#[test]
fn retry_reseeds_the_staged_view() {
    let (_dir, store) = open_store();
    let tenant = TenantId::new("T");
    store
        .append(
            "s",
            "cmd",
            ExpectedRevision::NoStream,
            vec![
                payload("a"),
                breccia::EventData::new(&b"FailOnce"[..]),
                payload("b"),
            ],
            tenant.clone(),
        )
        .unwrap();

    store.init_projections().unwrap();
    store
        .register_projection("counts", counts_schema(), ProjectionOptions::default())
        .unwrap();
    store
        .start_projection(
            "counts",
            Box::new(FailOnceHandler {
                attempts: HashMap::new(),
            }),
        )
        .unwrap();
    wait_for_checkpoint(&store, "counts", 3, Duration::from_secs(10));
    store.stop_projection("counts").unwrap();

    // Three events, each counted exactly once: the failed first attempt's
    // increment was rewound before the retry.
    let row = store
        .read_projection_row("counts", &tenant, &Value::from("count"))
        .unwrap()
        .expect("row exists");
    assert_eq!(row.get("n"), Some(&Value::Integer(3)));
}

// ----------------------------------------------------------------------
// Determinism checker
// ----------------------------------------------------------------------

/// Produces different ops on every invocation — the bug the check mode
/// exists to catch.
struct NonDeterministicHandler {
    calls: i64,
}

impl ProjectionHandler for NonDeterministicHandler {
    fn apply(&mut self, _event: &Event, table: &mut StagedTable<'_>) -> Result<(), HandlerError> {
        self.calls += 1;
        let mut row = Row::new();
        row.insert("n".to_string(), Value::Integer(self.calls));
        table.set(Value::from("x"), row);
        Ok(())
    }
}

#[test]
fn determinism_check_fails_unstable_handlers() {
    let (_dir, store) = open_store();
    create_stream(&store, "s", "cmd", &TenantId::new("T"));

    store.init_projections().unwrap();
    store
        .register_projection(
            "counts",
            counts_schema(),
            ProjectionOptions {
                check_determinism: true,
                ..ProjectionOptions::default()
            },
        )
        .unwrap();
    store
        .start_projection("counts", Box::new(NonDeterministicHandler { calls: 0 }))
        .unwrap();

    wait_until(Duration::from_secs(10), "worker failure", || {
        store.projection_failed("counts").unwrap()
    });
    // Neither run's ops were committed.
    assert_eq!(store.get_projection_checkpoint("counts").unwrap(), None);
}

#[test]
fn determinism_check_passes_honest_handlers() {
    let (_dir, store) = open_store();
    let tenant = TenantId::new("T");
    append_incs(&store, 25, "x", &tenant);

    store.init_projections().unwrap();
    store
        .register_projection(
            "counts",
            counts_schema(),
            ProjectionOptions {
                check_determinism: true,
                ..ProjectionOptions::default()
            },
        )
        .unwrap();
    store
        .start_projection("counts", Box::new(CountsHandler))
        .unwrap();
    wait_for_checkpoint(&store, "counts", 25, Duration::from_secs(10));
    store.stop_projection("counts").unwrap();
    assert!(!store.projection_failed("counts").unwrap());

    let row = store
        .read_projection_row("counts", &tenant, &Value::from("x"))
        .unwrap()
        .expect("row exists");
    assert_eq!(row.get("n"), Some(&Value::Integer(25)));
}

// ----------------------------------------------------------------------
// Poll mode
// ----------------------------------------------------------------------

#[test]
fn poll_mode_checkpoint_is_exactly_once() {
    let (_dir, store) = open_store();
    let tenant = TenantId::new("T");
    append_incs(&store, 5, "x", &tenant);

    store.init_projections().unwrap();
    store
        .register_projection("counts", counts_schema(), ProjectionOptions::default())
        .unwrap();

    let batch = store.get_projection_events("counts", 10).unwrap().unwrap();
    assert_eq!(batch.events.len(), 5);
    assert_eq!(batch.last_global_pos, pos(5));

    let mut row = Row::new();
    row.insert("n".to_string(), Value::Integer(5));
    let groups = vec![(
        tenant.clone(),
        vec![TableOp::Upsert {
            key: Value::from("x"),
            row,
        }],
    )];
    store
        .apply_projection_batch("counts", groups.clone(), batch.last_global_pos)
        .unwrap();

    // Re-acknowledging the same watermark is a checkpoint regression.
    let err = store
        .apply_projection_batch("counts", groups, batch.last_global_pos)
        .unwrap_err();
    match err {
        Error::CheckpointRegression {
            projection,
            proposed,
            current,
        } => {
            assert_eq!(projection, "counts");
            assert_eq!(proposed, pos(5));
            assert_eq!(current, Some(pos(5)));
        }
        other => panic!("expected CheckpointRegression, got {other}"),
    }

    // Caught up: no further batches.
    assert!(store.get_projection_events("counts", 10).unwrap().is_none());
}

#[test]
fn poll_mode_is_refused_while_a_worker_runs() {
    let (_dir, store) = open_store();
    append_incs(&store, 5, "x", &TenantId::new("T"));

    store.init_projections().unwrap();
    store
        .register_projection("counts", counts_schema(), ProjectionOptions::default())
        .unwrap();
    store
        .start_projection("counts", Box::new(CountsHandler))
        .unwrap();

    let err = store.get_projection_events("counts", 10).unwrap_err();
    assert!(matches!(
        err,
        Error::Projection(breccia::ProjectionError::WorkerActive(_))
    ));

    store.stop_projection("counts").unwrap();
}
