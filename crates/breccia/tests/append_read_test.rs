//! Append/read contract: optimistic concurrency, idempotency, ordering.

mod common;

use std::collections::HashMap;

use breccia::{Breccia, Error, EventData, ExpectedRevision, StreamRev};
use common::*;
use proptest::prelude::*;

#[test]
fn fresh_append_assigns_first_positions() {
    let (_dir, store) = open_store();

    let result = store
        .append(
            "user-1",
            "cmd-A",
            ExpectedRevision::NoStream,
            vec![payload("{\"hello\":\"world\"}")],
            tenant_x(),
        )
        .unwrap();

    assert_eq!(result.first_rev.as_u64(), 1);
    assert_eq!(result.last_rev.as_u64(), 1);
    assert_eq!(result.first_pos.as_u64(), 1);
    assert_eq!(result.last_pos.as_u64(), 1);

    let events = store.read_stream("user-1", 0, 10, tenant_x()).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload.as_ref(), b"{\"hello\":\"world\"}");
    assert_eq!(events[0].stream_rev.as_u64(), 1);
}

#[test]
fn no_stream_expectation_conflicts_after_create() {
    let (_dir, store) = open_store();
    create_stream(&store, "user-1", "cmd-A", &tenant_x());

    let err = store
        .append(
            "user-1",
            "cmd-B",
            ExpectedRevision::NoStream,
            vec![payload("{}")],
            tenant_x(),
        )
        .unwrap_err();

    match err {
        Error::RevisionConflict {
            expected, actual, ..
        } => {
            assert_eq!(expected, ExpectedRevision::NoStream);
            assert_eq!(actual, Some(StreamRev::new(1)));
        }
        other => panic!("expected RevisionConflict, got {other}"),
    }
}

#[test]
fn exact_expectation_follows_the_stream() {
    let (_dir, store) = open_store();
    create_stream(&store, "user-1", "cmd-A", &tenant_x());

    let result = store
        .append(
            "user-1",
            "cmd-B",
            ExpectedRevision::Exact(StreamRev::new(1)),
            vec![payload("a"), payload("b")],
            tenant_x(),
        )
        .unwrap();
    assert_eq!(result.first_rev.as_u64(), 2);
    assert_eq!(result.last_rev.as_u64(), 3);

    // A stale expectation now conflicts.
    let err = store
        .append(
            "user-1",
            "cmd-C",
            ExpectedRevision::Exact(StreamRev::new(1)),
            vec![payload("c")],
            tenant_x(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::RevisionConflict { .. }));
}

#[test]
fn duplicate_command_id_is_idempotent() {
    let (_dir, store) = open_store();

    let first = store
        .append(
            "user-1",
            "cmd-A",
            ExpectedRevision::NoStream,
            vec![payload("{\"hello\":\"world\"}")],
            tenant_x(),
        )
        .unwrap();

    // Exact repeat: same result, no revision movement.
    let replay = store
        .append(
            "user-1",
            "cmd-A",
            ExpectedRevision::NoStream,
            vec![payload("{\"hello\":\"world\"}")],
            tenant_x(),
        )
        .unwrap();
    assert_eq!(first, replay);
    assert_eq!(
        store.get_stream_revision("user-1", tenant_x()).unwrap(),
        StreamRev::new(1)
    );

    // Same command id, different payload set: refused.
    let err = store
        .append(
            "user-1",
            "cmd-A",
            ExpectedRevision::Any,
            vec![payload("something else")],
            tenant_x(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::CommandIdReuse { .. }));
}

#[test]
fn read_stream_honors_range_and_partial_results() {
    let (_dir, store) = open_store();
    store
        .append(
            "user-1",
            "cmd-A",
            ExpectedRevision::NoStream,
            (0..5).map(|i| payload(&format!("e{i}"))).collect(),
            tenant_x(),
        )
        .unwrap();

    let events = store.read_stream("user-1", 3, 10, tenant_x()).unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].stream_rev.as_u64(), 3);

    let events = store.read_stream("user-1", 2, 2, tenant_x()).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].stream_rev.as_u64(), 3);

    // Past the head: partial (empty), not an error.
    let events = store.read_stream("user-1", 9, 10, tenant_x()).unwrap();
    assert!(events.is_empty());
}

#[test]
fn read_missing_stream_is_not_found() {
    let (_dir, store) = open_store();
    assert!(matches!(
        store.read_stream("ghost", 0, 10, tenant_x()),
        Err(Error::StreamNotFound(_))
    ));
    assert!(matches!(
        store.get_stream_revision("ghost", tenant_x()),
        Err(Error::StreamNotFound(_))
    ));
}

#[test]
fn global_read_is_position_ordered_across_streams() {
    let (_dir, store) = open_store();
    create_stream(&store, "a", "cmd-1", &tenant_x());
    create_stream(&store, "b", "cmd-2", &tenant_x());
    create_stream(&store, "c", "cmd-3", &tenant_x());

    let events = store.read_global(pos(1), 100).unwrap();
    assert_eq!(events.len(), 3);
    let positions: Vec<u64> = events.iter().map(|e| e.global_pos.as_u64()).collect();
    assert_eq!(positions, vec![1, 2, 3]);
    assert_eq!(store.global_head(), Some(pos(3)));

    // Reads beyond the head return the partial tail.
    let events = store.read_global(pos(3), 100).unwrap();
    assert_eq!(events.len(), 1);
}

#[test]
fn oversized_payload_is_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let config = breccia::StoreConfig::new(dir.path()).with_max_payload_bytes(64);
    let store = Breccia::open_with_config(config).unwrap();

    let err = store
        .append(
            "user-1",
            "cmd-A",
            ExpectedRevision::NoStream,
            vec![EventData::new(vec![0u8; 65])],
            tenant_x(),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        Error::PayloadTooLarge { size: 65, max: 64 }
    ));
    assert!(store.global_head().is_none());
}

// ----------------------------------------------------------------------
// Properties P1–P4
// ----------------------------------------------------------------------

fn arb_batches() -> impl Strategy<Value = Vec<Vec<Vec<u8>>>> {
    // Up to 8 appends of 1..4 events each, arbitrary small payloads.
    prop::collection::vec(
        prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 1..4),
        1..8,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// P1/P2: appended events read back exactly, revisions contiguous.
    #[test]
    fn append_then_read_back(batches in arb_batches()) {
        let (_dir, store) = open_store();
        let tenant = tenant_x();

        let mut expected_payloads: Vec<Vec<u8>> = Vec::new();
        for (i, batch) in batches.iter().enumerate() {
            let expected = if i == 0 {
                ExpectedRevision::NoStream
            } else {
                ExpectedRevision::Exact(StreamRev::new(expected_payloads.len() as u64))
            };
            store
                .append(
                    "S",
                    format!("cmd-{i}").as_str(),
                    expected,
                    batch.iter().map(|p| EventData::new(p.clone())).collect(),
                    tenant.clone(),
                )
                .unwrap();
            expected_payloads.extend(batch.iter().cloned());
        }

        let events = store.read_stream("S", 1, usize::MAX, tenant.clone()).unwrap();
        prop_assert_eq!(events.len(), expected_payloads.len());
        for (i, event) in events.iter().enumerate() {
            prop_assert_eq!(event.stream_rev.as_u64(), (i + 1) as u64);
            prop_assert_eq!(event.payload.as_ref(), expected_payloads[i].as_slice());
        }
    }

    /// P3: global positions strictly increase in read order.
    #[test]
    fn global_monotonicity(streams in prop::collection::vec(0usize..4, 1..20)) {
        let (_dir, store) = open_store();
        let tenant = tenant_x();
        let mut revs: HashMap<usize, u64> = HashMap::new();

        for (i, s) in streams.iter().enumerate() {
            let rev = revs.entry(*s).or_insert(0);
            let expected = if *rev == 0 {
                ExpectedRevision::NoStream
            } else {
                ExpectedRevision::Exact(StreamRev::new(*rev))
            };
            store
                .append(
                    format!("s-{s}").as_str(),
                    format!("cmd-{i}").as_str(),
                    expected,
                    vec![payload("x")],
                    tenant.clone(),
                )
                .unwrap();
            *rev += 1;
        }

        let events = store.read_global(pos(1), usize::MAX).unwrap();
        prop_assert_eq!(events.len(), streams.len());
        for pair in events.windows(2) {
            prop_assert!(pair[0].global_pos < pair[1].global_pos);
        }
    }

    /// P4: an exact command repeat changes nothing.
    #[test]
    fn idempotent_replay(payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 1..4)) {
        let (_dir, store) = open_store();
        let tenant = tenant_x();
        let events: Vec<EventData> = payloads.iter().map(|p| EventData::new(p.clone())).collect();

        let first = store
            .append("S", "cmd", ExpectedRevision::NoStream, events.clone(), tenant.clone())
            .unwrap();
        let replay = store
            .append("S", "cmd", ExpectedRevision::NoStream, events, tenant.clone())
            .unwrap();

        prop_assert_eq!(first, replay);
        prop_assert_eq!(
            store.get_stream_revision("S", tenant.clone()).unwrap().as_u64(),
            payloads.len() as u64
        );
        prop_assert_eq!(store.global_head(), Some(pos(payloads.len() as u64)));
    }
}
