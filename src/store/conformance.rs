// Behaviour every AtomicStore must share. Each check runs against the
// in-process store in the regular suite and against Redis in the ignored one.

use super::{AtomicStore, KeySpace, MergeOutcome, Reservation, ReservationOutcome};
use crate::queue::jobs::{Job, JobData, JobStatus, QuickPayload, StatusUpdate};
use crate::queue::priority::{CleanupReport, JobQueue, Popped, DEFAULT_JOB_TTL};
use crate::queue::JobType;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

fn queue(store: Arc<dyn AtomicStore>, keys: &KeySpace) -> JobQueue {
    JobQueue::new(store, keys.clone(), DEFAULT_JOB_TTL)
}

fn quick(prompt: &str, created_ms: i64) -> Job {
    let data = JobData::Quick(QuickPayload {
        prompt: prompt.to_string(),
        context: None,
    });
    Job::with_created_at(data, "conformance", Utc.timestamp_millis_opt(created_ms).unwrap())
}

pub async fn status_merge_keeps_created_at_and_refuses_final(
    store: Arc<dyn AtomicStore>,
    keys: KeySpace,
) {
    let queue = queue(store, &keys);
    let job = quick("merge", 1_700_000_000_123);
    queue.enqueue_job(&job).await.unwrap();

    let started = Utc.timestamp_millis_opt(1_700_000_001_000).unwrap();
    assert_eq!(
        queue.update_status(job.id, &StatusUpdate::processing(started)).await.unwrap(),
        MergeOutcome::Applied
    );
    let record = queue.status(job.id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Processing);
    assert_eq!(record.created_at, job.created_at);
    assert_eq!(record.started_at, Some(started));

    let completed = StatusUpdate::completed(serde_json::json!({"content": "done"}), "groq");
    assert_eq!(queue.update_status(job.id, &completed).await.unwrap(), MergeOutcome::Applied);
    assert_eq!(
        queue.update_status(job.id, &StatusUpdate::failed("too late")).await.unwrap(),
        MergeOutcome::Final
    );

    let record = queue.status(job.id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.created_at, job.created_at);
    assert_eq!(record.started_at, Some(started));
    assert_eq!(record.provider.as_deref(), Some("groq"));
    assert_eq!(record.error, None);

    let unknown = uuid::Uuid::new_v4();
    assert_eq!(
        queue.update_status(unknown, &StatusUpdate::failed("nobody")).await.unwrap(),
        MergeOutcome::Missing
    );
}

pub async fn pop_serves_oldest_first_and_skips_orphans(
    store: Arc<dyn AtomicStore>,
    keys: KeySpace,
) {
    let queue = queue(store.clone(), &keys);
    let newest = quick("newest", 1_700_000_000_900);
    let oldest = quick("oldest", 1_700_000_000_100);
    let middle = quick("middle", 1_700_000_000_500);
    let vanished = quick("vanished", 1_700_000_000_300);
    for job in [&newest, &oldest, &middle, &vanished] {
        queue.enqueue_job(job).await.unwrap();
    }
    assert_eq!(queue.position(JobType::Quick, oldest.id).await.unwrap(), Some(1));
    assert_eq!(queue.position(JobType::Quick, newest.id).await.unwrap(), Some(4));

    store.delete(&keys.job(&vanished.id)).await.unwrap();

    let mut order = Vec::new();
    loop {
        match queue.pop_next(JobType::Quick).await.unwrap() {
            Popped::Job(job) => order.push(job.id),
            Popped::Orphan(id) => assert_eq!(id, vanished.id),
            Popped::Empty => break,
        }
    }
    assert_eq!(order, vec![oldest.id, middle.id, newest.id]);
    assert_eq!(queue.position(JobType::Quick, vanished.id).await.unwrap(), None);
    assert!(queue.dequeue(JobType::Quick).await.unwrap().is_none());

    // Served and discarded ids left nothing behind in the legacy list
    assert_eq!(
        queue.cleanup_orphans(JobType::Quick).await.unwrap(),
        CleanupReport::default()
    );
}

pub async fn cleanup_reconciles_legacy_list(store: Arc<dyn AtomicStore>, keys: KeySpace) {
    let queue = queue(store.clone(), &keys);
    let kept = quick("kept", 1_700_000_000_100);
    let dangling = quick("dangling", 1_700_000_000_200);
    let unindexed = quick("unindexed", 1_700_000_000_300);
    for job in [&kept, &dangling, &unindexed] {
        queue.enqueue_job(job).await.unwrap();
    }

    let index_key = keys.priority_index(JobType::Quick.as_str());
    store.delete(&keys.job(&dangling.id)).await.unwrap();
    store
        .remove_from_index(&index_key, &[unindexed.id.to_string()])
        .await
        .unwrap();

    let report = queue.cleanup_orphans(JobType::Quick).await.unwrap();
    assert_eq!(report.dangling_removed, 1);
    assert_eq!(report.legacy_removed, 2);

    assert_eq!(
        queue.cleanup_orphans(JobType::Quick).await.unwrap(),
        CleanupReport::default()
    );
    assert_eq!(queue.position(JobType::Quick, kept.id).await.unwrap(), Some(1));
    assert_eq!(queue.dequeue(JobType::Quick).await.unwrap().map(|job| job.id), Some(kept.id));
}

pub async fn usage_prunes_the_request_window(store: Arc<dyn AtomicStore>, keys: KeySpace) {
    let reservation = |now_ms: i64, request_id: &str| Reservation {
        window_key: keys.request_window("conformance"),
        tokens_key: keys.token_counter("conformance"),
        now_ms,
        window_ms: 60_000,
        rpm_limit: 10,
        tpm_limit: 1_000,
        tokens: 10,
        request_id: request_id.to_string(),
        safety_ttl: Duration::from_secs(120),
    };

    for (now_ms, id) in [(1_000, "r1"), (2_000, "r2"), (3_000, "r3")] {
        assert!(matches!(
            store.reserve(&reservation(now_ms, id)).await.unwrap(),
            ReservationOutcome::Admitted { .. }
        ));
    }

    let window = keys.request_window("conformance");
    let tokens = keys.token_counter("conformance");
    assert_eq!(store.usage(&window, &tokens, 0).await.unwrap(), (3, 30));
    assert_eq!(store.usage(&window, &tokens, 1_500).await.unwrap(), (2, 30));
    // Pruned entries stay gone even for an earlier window start
    assert_eq!(store.usage(&window, &tokens, 0).await.unwrap(), (2, 30));
    assert_eq!(store.usage(&window, &tokens, 3_000).await.unwrap(), (0, 30));
}
