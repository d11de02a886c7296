//! Task list unloading: idle eviction and lease takeover
//!
//! Persisted tasks must survive every way a manager can go away.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{add_request, ctx, harness, poll_request, schedule_id, Harness, DOMAIN};
use everruns_matching::metrics::{Counter, Scope};
use everruns_matching::{
    DescribeTaskListRequest, DomainEntry, FixedRateLimiter, Handler, InMemoryDomainCache,
    MatchingConfig, MatchingEngine, NoopMetrics, RequestContext, TaskListId, TaskListKind,
    TaskListRegistry,
};

fn evicting_config() -> MatchingConfig {
    MatchingConfig::default()
        .with_sync_match_wait(Duration::ZERO)
        .with_idle_check_interval(Duration::from_secs(1))
        .with_max_task_list_idle_time(Duration::from_secs(5))
}

fn orders() -> TaskListId {
    TaskListId::new(DOMAIN, "orders", TaskListKind::Activity)
}

async fn add_tasks(h: &Harness, schedule_ids: std::ops::RangeInclusive<i64>) {
    for i in schedule_ids {
        let matched = h
            .handler
            .add_activity_task(&ctx(Duration::from_secs(5)), add_request("orders", i))
            .await
            .unwrap();
        assert!(!matched);
    }
}

async fn poll_once(h: &Harness) -> i64 {
    let outcome = h
        .handler
        .poll_for_activity_task(&ctx(Duration::from_secs(5)), poll_request("orders", "p1"))
        .await
        .unwrap();
    schedule_id(outcome)
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_evicted_task_list_serves_persisted_tasks_in_order() {
    let h = harness(evicting_config());
    add_tasks(&h, 1..=10).await;
    assert_eq!(h.registry.len(), 1);

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(h.registry.is_empty());
    assert_eq!(
        h.metrics
            .counter(Scope::TaskListManager, Counter::TaskListUnloaded),
        1
    );

    for expected in 1..=10 {
        assert_eq!(poll_once(&h).await, expected);
    }
    assert_eq!(h.registry.len(), 1);
    assert_eq!(h.store.range_id(&orders()), Some(2));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_eviction_after_partial_delivery() {
    let h = harness(evicting_config());
    add_tasks(&h, 1..=5).await;
    assert_eq!(poll_once(&h).await, 1);
    assert_eq!(poll_once(&h).await, 2);

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(h.registry.is_empty());
    assert_eq!(h.store.ack_level(&orders()), Some(2));

    for expected in 3..=5 {
        assert_eq!(poll_once(&h).await, expected);
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_task_list_with_waiting_poller_is_not_evicted() {
    let h = harness(evicting_config());

    let handler = Arc::clone(&h.handler);
    let poll = tokio::spawn(async move {
        handler
            .poll_for_activity_task(&ctx(Duration::from_secs(60)), poll_request("orders", "p1"))
            .await
    });
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.registry.len(), 1);

    let matched = h
        .handler
        .add_activity_task(&ctx(Duration::from_secs(5)), add_request("orders", 8))
        .await
        .unwrap();
    assert!(matched);
    assert_eq!(schedule_id(poll.await.unwrap().unwrap()), 8);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_stale_owner_reloads_after_takeover() {
    let h = harness(evicting_config().with_max_task_list_idle_time(Duration::from_secs(3600)));
    add_tasks(&h, 1..=1).await;
    assert_eq!(h.store.range_id(&orders()), Some(1));

    // A second host sharing the store takes the task list over
    let domains = Arc::new(
        InMemoryDomainCache::new().with_domain(DomainEntry::active(DOMAIN, "orders")),
    );
    let other = Handler::new(
        Arc::new(MatchingEngine::new(
            MatchingConfig::default(),
            Arc::new(TaskListRegistry::new()),
            h.store.clone(),
            domains,
            Arc::new(NoopMetrics),
        )),
        h.store.clone(),
        Arc::new(FixedRateLimiter::allowing()),
        Arc::new(NoopMetrics),
    );
    other.start();
    other
        .describe_task_list(
            &RequestContext::new(),
            DescribeTaskListRequest {
                domain_id: DOMAIN.into(),
                task_list: "orders".into(),
                kind: TaskListKind::Activity,
                include_task_list_status: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(h.store.range_id(&orders()), Some(2));

    // The first host's write is fenced off, so it reloads and retries
    add_tasks(&h, 2..=2).await;
    assert_eq!(h.store.range_id(&orders()), Some(3));
    assert_eq!(h.store.write_count(), 2);

    assert_eq!(poll_once(&h).await, 1);
    assert_eq!(poll_once(&h).await, 2);
}
