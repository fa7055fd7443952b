/// Task dispatch and bulk batching tests
///
/// Run with: cargo test --test task_dispatch_tests
mod common;

use common::{TestRecord, note};
use rustormdb::{
    DispatchTarget, EntityKey, FailurePolicy, LargeObject, MemoryConnection, Operation,
    PersistError, RawStatement, Repository, TaskDispatcher, TaskKind,
};
use std::sync::Arc;

#[test]
fn test_priority_most_specific_first() {
    let mut dispatcher = TaskDispatcher::new();

    let lob = LargeObject::new(vec![1u8]).into_ref();
    let task = dispatcher
        .dispatch(DispatchTarget::Lob(lob), Operation::Persist)
        .unwrap();
    assert_eq!(task.kind(), TaskKind::Lob);

    let task = dispatcher
        .dispatch(
            DispatchTarget::Collection(vec![note("a"), note("b")]),
            Operation::Persist,
        )
        .unwrap();
    assert_eq!(task.kind(), TaskKind::Bulk);

    let task = dispatcher
        .dispatch(
            DispatchTarget::Statement(Arc::new(RawStatement::new("SET x = 1"))),
            Operation::Persist,
        )
        .unwrap();
    assert_eq!(task.kind(), TaskKind::Statement);

    let task = dispatcher
        .dispatch(DispatchTarget::Entity(note("fallback")), Operation::Persist)
        .unwrap();
    assert_eq!(task.kind(), TaskKind::Entity);
}

#[test]
fn test_forced_dispatch_raises_with_reasons() {
    let mut dispatcher = TaskDispatcher::new();
    let mixed = vec![note("a"), TestRecord::new("tag", "tags").into_ref()];

    let err = dispatcher
        .dispatch(DispatchTarget::Collection(mixed), Operation::Persist)
        .unwrap_err();
    match err {
        PersistError::IncompatibleTarget(message) => {
            assert!(message.contains("mixes entity types"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_probe_mode_returns_none() {
    let mut dispatcher = TaskDispatcher::new();
    let probed = dispatcher
        .probe(DispatchTarget::Collection(Vec::new()), Operation::Persist)
        .unwrap();
    assert!(probed.is_none());

    let probed = dispatcher
        .probe(DispatchTarget::Entity(note("fine")), Operation::Delete)
        .unwrap();
    assert!(probed.is_some());
}

#[tokio::test]
async fn test_bulk_insert_through_flush_is_one_statement() {
    let mut repo = Repository::new(MemoryConnection::new());
    let members = vec![note("a"), note("b"), note("c")];

    repo.persist(DispatchTarget::Collection(members.clone()))
        .unwrap();
    let report = repo
        .flush_all(FailurePolicy::Continue, false)
        .await
        .unwrap();

    assert!(report.is_success(None));
    let statements = repo.connection().committed_statements();
    assert_eq!(statements.len(), 1);
    assert!(statements[0].starts_with("INSERT INTO \"notes\""));

    for member in &members {
        let guard = member.read().unwrap();
        assert!(guard.key().is_some());
    }
    // Every member landed in the cache individually.
    let map = repo.identity_map();
    assert_eq!(map.read().unwrap().persisted_len(), 3);
}

#[tokio::test]
async fn test_bulk_delete_through_flush_batches_keys() {
    let mut repo = Repository::new(MemoryConnection::new());
    let members: Vec<_> = (1..=3)
        .map(|n| {
            TestRecord::new("note", "notes")
                .with_key(EntityKey::Int(n))
                .into_ref()
        })
        .collect();
    for member in &members {
        repo.attach(member).unwrap();
    }

    repo.delete(DispatchTarget::Collection(members)).unwrap();
    repo.flush_all(FailurePolicy::Continue, false)
        .await
        .unwrap();

    assert_eq!(
        repo.connection().committed_statements()[0],
        "DELETE FROM \"notes\" WHERE \"id\" IN (1, 2, 3)"
    );
    let map = repo.identity_map();
    assert_eq!(map.read().unwrap().persisted_len(), 0);
}

#[tokio::test]
async fn test_bulk_rollback_restores_all_members() {
    let mut repo = Repository::new(MemoryConnection::new());
    repo.connection_mut().fail_on("poison");
    let members = vec![note("a"), note("b")];

    repo.persist(DispatchTarget::Collection(members.clone()))
        .unwrap();
    repo.unit_of_work()
        .execute_statement(RawStatement::new("UPDATE \"poison\" SET \"x\" = 1"))
        .unwrap();

    let report = repo
        .flush_all(FailurePolicy::Continue, false)
        .await
        .unwrap();
    assert!(!report.is_success(None));

    for member in &members {
        assert!(member.read().unwrap().key().is_none());
    }
    let map = repo.identity_map();
    assert_eq!(map.read().unwrap().persisted_len(), 0);
}
