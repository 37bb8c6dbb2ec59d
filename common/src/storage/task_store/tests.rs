use std::collections::HashSet;

use serde_json::json;
use uuid::Uuid;

use super::*;
use crate::storage::types::task::TaskPriority;

async fn store() -> TaskStore {
    let database = Uuid::new_v4().to_string();
    let db = SurrealDbClient::memory("test_ns", &database)
        .await
        .expect("in-memory surrealdb");
    db.ensure_initialized().await.expect("schema");
    TaskStore::new(Arc::new(db)).with_retry_policy(RetryPolicy::immediate())
}

const LEASE: Duration = Duration::from_secs(60);

#[tokio::test]
async fn create_assigns_defaults_and_get_round_trips() {
    let store = store().await;
    let created = store
        .create(NewTask::new(TaskType::Noop, json!({"hello": "world"})))
        .await
        .expect("create");

    let fetched = store.get(&created.id).await.expect("get");
    assert_eq!(fetched.status, TaskStatus::Pending);
    assert_eq!(fetched.retry_count, 0);
    assert_eq!(fetched.payload, json!({"hello": "world"}));
    assert_eq!(fetched.priority, TaskPriority::Normal);

    let missing = store.get("does-not-exist").await;
    assert!(matches!(missing, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn create_rejects_invalid_requests() {
    let store = store().await;

    let negative = store
        .create(NewTask::new(TaskType::Noop, json!({})).with_max_retries(-2))
        .await;
    assert!(matches!(negative, Err(AppError::Validation(_))));

    let unknown = NewTask::from_tag("reindex_everything", json!({}));
    assert!(matches!(unknown, Err(AppError::Validation(_))));

    assert!(store.list(None, 10).await.expect("list").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_share_a_task() {
    let store = store().await;
    for _ in 0..4 {
        store
            .create(NewTask::new(TaskType::Noop, json!({})))
            .await
            .expect("create");
    }

    let mut handles = Vec::new();
    for worker in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim_next(&[], &format!("worker-{worker}"), LEASE)
                .await
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        if let Some(task) = handle.await.expect("join").expect("claim") {
            assert!(seen.insert(task.id.clone()), "task {} claimed twice", task.id);
        }
    }

    // Whatever lost a collision is still there for a later poll.
    while let Some(task) = store.claim_next(&[], "sweeper", LEASE).await.expect("claim") {
        assert!(seen.insert(task.id.clone()), "task {} claimed twice", task.id);
    }
    assert_eq!(seen.len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn single_task_goes_to_exactly_one_of_many_claimers() {
    let store = store().await;

    for round in 0..30 {
        store
            .create(NewTask::new(TaskType::Noop, json!({ "round": round })))
            .await
            .expect("create");

        let handles: Vec<_> = (0..16)
            .map(|worker| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .claim_next(&[], &format!("w{worker}"), LEASE)
                        .await
                })
            })
            .collect();

        let mut winners = Vec::new();
        for handle in handles {
            if let Some(task) = handle.await.expect("join").expect("claim") {
                winners.push(task);
            }
        }
        assert_eq!(winners.len(), 1, "round {round}: {} claimers won", winners.len());

        let winner = &winners[0];
        let worker_id = winner.locked_by.clone().expect("lease holder");
        store
            .complete(&winner.id, &worker_id, json!({}))
            .await
            .expect("complete");
    }
}

#[tokio::test]
async fn claim_prefers_priority_over_age() {
    let store = store().await;
    let now = Utc::now();

    let mut old_low = NewTask::new(TaskType::Noop, json!({"name": "B"}))
        .with_priority(TaskPriority::Low)
        .into_task(now - ChronoDuration::seconds(10))
        .expect("task");
    old_low.id = "b".into();
    let mut urgent = NewTask::new(TaskType::Noop, json!({"name": "A"}))
        .with_priority(TaskPriority::Urgent)
        .into_task(now)
        .expect("task");
    urgent.id = "a".into();

    store.db().store_item(old_low).await.expect("store");
    store.db().store_item(urgent).await.expect("store");

    let first = store
        .claim_next(&[], "w1", LEASE)
        .await
        .expect("claim")
        .expect("task");
    assert_eq!(first.id, "a");
    assert_eq!(first.status, TaskStatus::Processing);
    assert_eq!(first.locked_by.as_deref(), Some("w1"));
    assert_eq!(first.retry_count, 1);
    assert!(first.started_at.is_some());

    let second = store
        .claim_next(&[], "w1", LEASE)
        .await
        .expect("claim")
        .expect("task");
    assert_eq!(second.id, "b");
}

#[tokio::test]
async fn claim_filters_by_type_and_schedule() {
    let store = store().await;
    let now = Utc::now();

    store
        .create(NewTask::new(TaskType::PurgeTasks, json!({"days": 7})))
        .await
        .expect("create");
    let later = store
        .create(NewTask::new(TaskType::Noop, json!({})).scheduled_for(now + ChronoDuration::minutes(5)))
        .await
        .expect("create");

    let none = store
        .claim_next_at(&[TaskType::Noop], "w1", LEASE, now)
        .await
        .expect("claim");
    assert!(none.is_none());

    let purge = store
        .claim_next_at(&[TaskType::PurgeTasks], "w1", LEASE, now)
        .await
        .expect("claim")
        .expect("task");
    assert_eq!(purge.task_type, TaskType::PurgeTasks);

    let due = store
        .claim_next_at(&[TaskType::Noop], "w1", LEASE, now + ChronoDuration::minutes(6))
        .await
        .expect("claim")
        .expect("task");
    assert_eq!(due.id, later.id);
}

#[tokio::test]
async fn retries_are_exhausted_after_max_retries_plus_one_claims() {
    let store = store().await;
    let task = store
        .create(NewTask::new(TaskType::Noop, json!({})).with_max_retries(2))
        .await
        .expect("create");

    for attempt in 1..=3u32 {
        let claimed = store
            .claim_next(&[], "w1", LEASE)
            .await
            .expect("claim")
            .expect("eligible");
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.retry_count, attempt);

        let failed = store.fail(&task.id, "w1", "boom").await.expect("fail");
        let expected = if attempt < 3 {
            TaskStatus::Retry
        } else {
            TaskStatus::Failed
        };
        assert_eq!(failed.status, expected);
        assert!(failed.locked_at.is_none());
        assert!(failed.locked_by.is_none());
        assert!(failed.completed_at.is_some());
    }

    let done = store.get(&task.id).await.expect("get");
    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.retry_count, 3);
    assert_eq!(done.error_message.as_deref(), Some("boom"));

    assert!(store
        .claim_next(&[], "w1", LEASE)
        .await
        .expect("claim")
        .is_none());
}

#[tokio::test]
async fn retry_waits_for_backoff_delay() {
    let store = store().await.with_retry_policy(RetryPolicy {
        base_delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(300),
    });
    let task = store
        .create(NewTask::new(TaskType::Noop, json!({})))
        .await
        .expect("create");

    store.claim_next(&[], "w1", LEASE).await.expect("claim");
    let failed = store.fail(&task.id, "w1", "transient").await.expect("fail");
    assert_eq!(failed.status, TaskStatus::Retry);
    let scheduled = failed.scheduled_for.expect("retry time");
    assert!(scheduled > Utc::now() + ChronoDuration::seconds(20));

    assert!(store
        .claim_next(&[], "w1", LEASE)
        .await
        .expect("claim")
        .is_none());

    let retried = store
        .claim_next_at(&[], "w1", LEASE, scheduled + ChronoDuration::seconds(1))
        .await
        .expect("claim")
        .expect("eligible after delay");
    assert_eq!(retried.retry_count, 2);
}

#[tokio::test]
async fn expired_lease_can_be_reclaimed_by_another_worker() {
    let store = store().await;
    let task = store
        .create(NewTask::new(TaskType::Noop, json!({})))
        .await
        .expect("create");
    let lease = Duration::from_secs(5);
    let t0 = Utc::now();

    let first = store
        .claim_next_at(&[], "w1", lease, t0)
        .await
        .expect("claim")
        .expect("task");
    assert_eq!(first.locked_by.as_deref(), Some("w1"));

    let while_held = store
        .claim_next_at(&[], "w2", lease, t0 + ChronoDuration::seconds(3))
        .await
        .expect("claim");
    assert!(while_held.is_none());

    let reclaimed = store
        .claim_next_at(&[], "w2", lease, t0 + ChronoDuration::seconds(6))
        .await
        .expect("claim")
        .expect("lease expired");
    assert_eq!(reclaimed.id, task.id);
    assert_eq!(reclaimed.locked_by.as_deref(), Some("w2"));
    assert_eq!(reclaimed.retry_count, 2);
}

#[tokio::test]
async fn late_settle_from_an_expired_lease_is_rejected() {
    let store = store().await;
    let task = store
        .create(NewTask::new(TaskType::Noop, json!({})).with_max_retries(3))
        .await
        .expect("create");
    let lease = Duration::from_secs(5);
    let t0 = Utc::now();

    store
        .claim_next_at(&[], "w1", lease, t0)
        .await
        .expect("claim")
        .expect("task");
    store
        .claim_next_at(&[], "w2", lease, t0 + ChronoDuration::seconds(6))
        .await
        .expect("claim")
        .expect("lease expired");

    let late_complete = store.complete(&task.id, "w1", json!({"ok": true})).await;
    assert!(matches!(late_complete, Err(AppError::LeaseConflict(_))));
    let late_fail = store.fail(&task.id, "w1", "too slow").await;
    assert!(matches!(late_fail, Err(AppError::LeaseConflict(_))));
    let late_release = store.release(&task.id, "w1").await;
    assert!(matches!(late_release, Err(AppError::LeaseConflict(_))));

    let held = store.get(&task.id).await.expect("get");
    assert_eq!(held.status, TaskStatus::Processing);
    assert_eq!(held.locked_by.as_deref(), Some("w2"));

    let done = store
        .complete(&task.id, "w2", json!({"ok": true}))
        .await
        .expect("holder completes");
    assert_eq!(done.status, TaskStatus::Completed);
}

#[tokio::test]
async fn complete_is_idempotent_and_merges_result() {
    let store = store().await;
    let task = store
        .create(
            NewTask::new(TaskType::Noop, json!({}))
                .with_metadata(json!({"source": "test"})),
        )
        .await
        .expect("create");

    let pending = store.complete(&task.id, "w1", json!({"ok": true})).await;
    assert!(matches!(pending, Err(AppError::InvalidTransition(_))));

    store.claim_next(&[], "w1", LEASE).await.expect("claim");
    let done = store
        .complete(&task.id, "w1", json!({"ok": true}))
        .await
        .expect("complete");
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.metadata, json!({"source": "test", "ok": true}));
    assert!(done.locked_by.is_none());
    assert!(done.completed_at.is_some());

    let again = store
        .complete(&task.id, "w1", json!({"ok": false}))
        .await
        .expect("second complete");
    assert_eq!(again.status, TaskStatus::Completed);
    assert_eq!(again.metadata, done.metadata);
    assert_eq!(again.completed_at, done.completed_at);
}

#[tokio::test]
async fn fail_permanently_skips_remaining_retries() {
    let store = store().await;
    let task = store
        .create(NewTask::new(TaskType::Noop, json!({})).with_max_retries(5))
        .await
        .expect("create");
    store.claim_next(&[], "w1", LEASE).await.expect("claim");

    let failed = store
        .fail_permanently(&task.id, "w1", "payload missing field")
        .await
        .expect("fail");
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.retry_count, 1);
}

#[tokio::test]
async fn reschedule_and_release() {
    let store = store().await;
    let task = store
        .create(NewTask::new(TaskType::Noop, json!({})).with_max_retries(0))
        .await
        .expect("create");

    store.claim_next(&[], "w1", LEASE).await.expect("claim");
    let released = store.release(&task.id, "w1").await.expect("release");
    assert_eq!(released.status, TaskStatus::Pending);
    assert_eq!(released.retry_count, 0);
    assert!(released.locked_at.is_none());

    store.claim_next(&[], "w1", LEASE).await.expect("claim");
    let failed = store.fail(&task.id, "w1", "nope").await.expect("fail");
    assert_eq!(failed.status, TaskStatus::Failed);

    let revived = store
        .reschedule(&task.id, Duration::from_secs(0))
        .await
        .expect("reschedule");
    assert_eq!(revived.status, TaskStatus::Pending);
    assert_eq!(revived.retry_count, 0);
    assert!(revived.completed_at.is_none());

    let claimed = store
        .claim_next_at(&[], "w2", LEASE, Utc::now() + ChronoDuration::seconds(1))
        .await
        .expect("claim")
        .expect("claimable again");
    assert_eq!(claimed.id, task.id);

    let busy = store.reschedule(&task.id, Duration::from_secs(10)).await;
    assert!(matches!(busy, Err(AppError::InvalidTransition(_))));
}

#[tokio::test]
async fn purge_removes_only_old_finished_tasks() {
    let store = store().await;
    let now = Utc::now();

    let mut old_done = NewTask::new(TaskType::Noop, json!({}))
        .into_task(now - ChronoDuration::days(40))
        .expect("task");
    old_done.status = TaskStatus::Completed;
    old_done.completed_at = Some(now - ChronoDuration::days(35));

    let mut old_failed = NewTask::new(TaskType::Noop, json!({}))
        .into_task(now - ChronoDuration::days(40))
        .expect("task");
    old_failed.status = TaskStatus::Failed;
    old_failed.completed_at = Some(now - ChronoDuration::days(31));

    let mut recent_done = NewTask::new(TaskType::Noop, json!({}))
        .into_task(now)
        .expect("task");
    recent_done.status = TaskStatus::Completed;
    recent_done.completed_at = Some(now - ChronoDuration::days(1));

    let old_pending = NewTask::new(TaskType::Noop, json!({}))
        .into_task(now - ChronoDuration::days(90))
        .expect("task");

    for task in [old_done, old_failed, recent_done, old_pending] {
        store.db().store_item(task).await.expect("store");
    }

    let deleted = store.purge_older_than(30).await.expect("purge");
    assert_eq!(deleted, 2);

    let counts = store.counts_by_status().await.expect("counts");
    assert_eq!(counts.get(&TaskStatus::Completed), Some(&1));
    assert_eq!(counts.get(&TaskStatus::Pending), Some(&1));
    assert_eq!(counts.get(&TaskStatus::Failed), None);

    let pending = store
        .list(Some(TaskStatus::Pending), 10)
        .await
        .expect("list");
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn children_and_dependencies() {
    let store = store().await;
    let parent = store
        .create(NewTask::new(TaskType::IngestBatch, json!({})))
        .await
        .expect("create");
    let child = store
        .spawn_child(&parent, NewTask::new(TaskType::Noop, json!({})))
        .await
        .expect("spawn");
    assert_eq!(child.parent_task_id.as_deref(), Some(parent.id.as_str()));

    let dependent = store
        .create(
            NewTask::new(TaskType::Noop, json!({}))
                .with_priority(TaskPriority::Low)
                .depends_on(vec![child.id.clone(), "ghost".to_string()]),
        )
        .await
        .expect("create");

    let unfinished = store
        .unfinished_dependencies(&dependent)
        .await
        .expect("deps");
    assert_eq!(unfinished, vec![child.id.clone(), "ghost".to_string()]);

    store
        .claim_next(&[TaskType::Noop], "w1", LEASE)
        .await
        .expect("claim");
    store.complete(&child.id, "w1", json!({})).await.expect("complete");

    let unfinished = store
        .unfinished_dependencies(&dependent)
        .await
        .expect("deps");
    assert_eq!(unfinished, vec!["ghost".to_string()]);
}

#[test]
fn retry_policy_doubles_and_caps() {
    let policy = RetryPolicy {
        base_delay: Duration::from_secs(10),
        max_delay: Duration::from_secs(60),
    };
    assert_eq!(policy.delay_for(1), Duration::from_secs(10));
    assert_eq!(policy.delay_for(2), Duration::from_secs(20));
    assert_eq!(policy.delay_for(3), Duration::from_secs(40));
    assert_eq!(policy.delay_for(4), Duration::from_secs(60));
    assert_eq!(RetryPolicy::immediate().delay_for(7), Duration::ZERO);
}
