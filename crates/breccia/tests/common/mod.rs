//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use breccia::{
    Breccia, ColumnDef, ColumnType, EventData, ExpectedRevision, GlobalPos, Schema, TenantId,
};

/// Opens a store in a fresh temp directory.
pub fn open_store() -> (tempfile::TempDir, Breccia) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Breccia::open(dir.path()).expect("open store");
    (dir, store)
}

pub fn tenant_x() -> TenantId {
    TenantId::new("tenantX")
}

pub fn payload(text: &str) -> EventData {
    EventData::new(text.as_bytes().to_vec())
}

/// One-event append with `NoStream` expectation.
pub fn create_stream(store: &Breccia, stream: &str, cmd: &str, tenant: &TenantId) {
    store
        .append(
            stream,
            cmd,
            ExpectedRevision::NoStream,
            vec![payload("{\"hello\":\"world\"}")],
            tenant.clone(),
        )
        .expect("append");
}

/// The `counts` schema from the projection scenarios: `{id: pk text, n: int}`.
pub fn counts_schema() -> Schema {
    Schema::new(vec![
        ColumnDef::new("id", ColumnType::Text).primary_key(),
        ColumnDef::new("n", ColumnType::Integer),
    ])
    .expect("valid schema")
}

/// Polls until the projection checkpoint reaches `target`, or panics after
/// `timeout`.
pub fn wait_for_checkpoint(store: &Breccia, name: &str, target: u64, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let checkpoint = store
            .get_projection_checkpoint(name)
            .expect("checkpoint query");
        if checkpoint.is_some_and(|c| c.as_u64() >= target) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "projection {name} did not reach checkpoint {target} in time (at {checkpoint:?})"
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Polls until the predicate holds, or panics after `timeout`.
pub fn wait_until(timeout: Duration, what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// An `Inc` event payload as used by the projection scenarios.
pub fn inc_payload(id: &str) -> EventData {
    payload(&format!("{{\"kind\":\"Inc\",\"id\":\"{id}\"}}"))
}

pub fn pos(value: u64) -> GlobalPos {
    GlobalPos::new(value)
}
