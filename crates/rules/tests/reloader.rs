mod common;

use std::sync::Arc;

use serde_json::json;

use common::{query_failed, unreachable, users_record, wait_until, MockSource};
use tagwatch_rules::{FetchError, RawRecord, Reloader, RuleKind, TagValue};

#[tokio::test]
async fn reload_maps_source_rows_into_a_snapshot() {
    let source = Arc::new(MockSource::new());
    let reloader = Reloader::new(source.clone());
    assert_eq!(reloader.current().version(), 0);
    assert!(reloader.current().is_empty());

    let snapshot = reloader.reload().await.unwrap();

    assert_eq!(snapshot.version(), 1);
    assert!(Arc::ptr_eq(&snapshot, &reloader.current()));
    let rule = &snapshot.rules()[0];
    assert_eq!(rule.kind, RuleKind::Class);
    assert_eq!(rule.matches, "app.users");
    assert_eq!(rule.tags.get("omit"), Some(&TagValue::Flag));
    assert_eq!(
        snapshot.to_tags_document(),
        json!({ "version": 1, "config": { "class": { "app.users": { "tags": { "omit": true } } } } })
    );
}

#[tokio::test]
async fn sequential_reloads_each_fetch() {
    let source = Arc::new(MockSource::new());
    let reloader = Reloader::new(source.clone());

    reloader.reload().await.unwrap();
    let second = reloader.reload().await.unwrap();

    assert_eq!(second.version(), 2);
    assert_eq!(source.fetches(), 2);
    assert!(!reloader.store().is_reloading());
}

#[tokio::test]
async fn burst_during_fetch_costs_one_extra_fetch() {
    let source = Arc::new(MockSource::new().gate_fetches());
    let reloader = Reloader::new(source.clone());

    let first = reloader.request();
    wait_until("first fetch to start", || source.fetches() == 1).await;

    let followers: Vec<_> = (0..10).map(|_| reloader.request()).collect();
    source.release_fetches(2);

    let leader = first.wait().await.unwrap();
    assert_eq!(leader.version(), 1);

    let mut results = Vec::new();
    for ticket in followers {
        results.push(ticket.wait().await.unwrap());
    }
    assert!(results.iter().all(|s| s.version() == 2));
    assert!(results.iter().all(|s| Arc::ptr_eq(s, &results[0])));

    assert_eq!(source.fetches(), 2);
    let stats = reloader.stats();
    assert_eq!(stats.requests, 11);
    assert_eq!(stats.coalesced, 9);
    assert_eq!(stats.fetches, 2);
    assert!(!reloader.store().is_reloading());
}

#[tokio::test]
async fn failed_reload_keeps_last_good_snapshot() {
    let source = Arc::new(MockSource::new().script(vec![
        Ok(vec![users_record()]),
        Err(unreachable()),
    ]));
    let reloader = Reloader::new(source.clone());

    let good = reloader.reload().await.unwrap();
    let err = reloader.reload().await.unwrap_err();

    assert!(matches!(err, FetchError::Unreachable { .. }));
    assert_eq!(err.source_id(), "mock://tags");
    assert!(Arc::ptr_eq(&good, &reloader.current()));
    let stats = reloader.stats();
    assert_eq!(stats.failures, 1);
    assert!(stats.last_error.as_deref().unwrap().contains("connection refused"));

    // A later reload recovers without any reset.
    let recovered = reloader.reload().await.unwrap();
    assert_eq!(recovered.version(), 2);
    assert!(reloader.stats().last_error.is_none());
}

#[tokio::test]
async fn queued_rerun_runs_after_failed_fetch() {
    let source = Arc::new(
        MockSource::new()
            .gate_fetches()
            .script(vec![Err(query_failed())]),
    );
    let reloader = Reloader::new(source.clone());

    let first = reloader.request();
    wait_until("first fetch to start", || source.fetches() == 1).await;
    let second = reloader.request();
    source.release_fetches(2);

    assert!(matches!(first.wait().await, Err(FetchError::Query { .. })));
    let snapshot = second.wait().await.unwrap();
    assert_eq!(snapshot.version(), 1);
    assert_eq!(source.fetches(), 2);
}

#[tokio::test]
async fn malformed_record_rejects_the_whole_fetch() {
    let bogus = RawRecord {
        kind: "table".to_string(),
        identifier: "app.orders".to_string(),
        description: None,
        tags: json!({}),
    };
    let source = Arc::new(MockSource::new().script(vec![Ok(vec![users_record(), bogus])]));
    let reloader = Reloader::new(source.clone());

    match reloader.reload().await {
        Err(FetchError::Malformed { index, identifier, reason, .. }) => {
            assert_eq!(index, 1);
            assert_eq!(identifier, "app.orders");
            assert!(reason.contains("unknown kind 'table'"));
        }
        other => panic!("expected a malformed-record error, got {other:?}"),
    }
    assert_eq!(reloader.current().version(), 0);
}

#[tokio::test]
async fn dropped_caller_does_not_cancel_the_fetch() {
    let source = Arc::new(MockSource::new().gate_fetches());
    let reloader = Reloader::new(source.clone());

    let caller = tokio::spawn({
        let reloader = reloader.clone();
        async move { reloader.reload().await }
    });
    wait_until("fetch to start", || source.fetches() == 1).await;
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    source.release_fetches(1);
    wait_until("fetch to publish", || reloader.current().version() == 1).await;
    wait_until("reload slot to clear", || !reloader.store().is_reloading()).await;

    // The slot was released, so the next request starts a fresh fetch.
    source.release_fetches(1);
    assert_eq!(reloader.reload().await.unwrap().version(), 2);
    assert_eq!(source.fetches(), 2);
}
