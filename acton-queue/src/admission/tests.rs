use super::*;
use crate::clock::TokioClock;
use crate::executor::MockExecutor;
use crate::store::{JobStore, MemoryStore};
use proptest::prelude::*;
use serde_json::json;

fn queue_with(store: Arc<MemoryStore>, settings: AdmissionSettings) -> AdmissionQueue {
    AdmissionQueue::with_clock(store, settings, Arc::new(TokioClock::new()))
}

fn queue() -> (AdmissionQueue, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (queue_with(store.clone(), AdmissionSettings::default()), store)
}

async fn submit_starts(queue: &AdmissionQueue, n: usize) -> Vec<Job> {
    let mut jobs = Vec::with_capacity(n);
    for i in 0..n {
        jobs.push(
            queue
                .submit(JobKind::Start, &format!("session-{i}"), json!({}))
                .await
                .unwrap(),
        );
    }
    jobs
}

#[tokio::test(start_paused = true)]
async fn test_five_starts_with_cap_three() {
    let (queue, _store) = queue();
    let jobs = submit_starts(&queue, 5).await;

    for job in &jobs[..3] {
        assert_eq!(job.state, JobState::Active);
    }
    assert_eq!(jobs[3].state, JobState::Waiting);
    assert_eq!(jobs[4].state, JobState::Waiting);

    let stats = queue.stats(Some(JobKind::Start)).await.unwrap();
    assert_eq!(stats.active_count, 3);
    assert_eq!(stats.waiting_count, 2);
    assert_eq!(
        stats.positions,
        vec![
            QueuePosition { job_id: jobs[3].id, kind: JobKind::Start, position: 0 },
            QueuePosition { job_id: jobs[4].id, kind: JobKind::Start, position: 1 },
        ]
    );

    let finished = queue.complete(jobs[0].id, None).await.unwrap().unwrap();
    assert_eq!(finished.state, JobState::Completed);
    assert_eq!(finished.promoted.as_ref().map(|j| j.id), Some(jobs[3].id));

    let promoted = queue.get_status(jobs[3].id).await.unwrap().unwrap();
    assert_eq!(promoted.state, JobState::Active);
    assert!(promoted.started_at.is_some());

    let stats = queue.stats(Some(JobKind::Start)).await.unwrap();
    assert_eq!((stats.active_count, stats.waiting_count), (3, 1));
    assert_eq!(stats.positions[0].job_id, jobs[4].id);
    queue.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_job_and_promotes_next() {
    let (queue, _store) = queue();
    let jobs = submit_starts(&queue, 4).await;

    tokio::time::sleep(Duration::from_secs(16)).await;

    for job in &jobs[..3] {
        let stored = queue.get_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert!(stored.error.unwrap().contains("timed out"));
    }
    let fourth = queue.get_status(jobs[3].id).await.unwrap().unwrap();
    assert_eq!(fourth.state, JobState::Active, "timeout frees a slot for the next job");

    // The promoted job gets its own full window
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        queue.get_status(jobs[3].id).await.unwrap().unwrap().state,
        JobState::Active
    );
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(
        queue.get_status(jobs[3].id).await.unwrap().unwrap().state,
        JobState::Failed
    );
    queue.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_complete_after_timeout_is_noop() {
    let (queue, _store) = queue();
    let job = queue.submit(JobKind::Stop, "session-1", json!({})).await.unwrap();

    tokio::time::sleep(Duration::from_secs(16)).await;

    assert!(queue.complete(job.id, Some(json!({}))).await.unwrap().is_none());
    let stored = queue.get_status(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_completion_disarms_timeout() {
    let (queue, store) = queue();
    let jobs = submit_starts(&queue, 2).await;
    queue.complete(jobs[0].id, None).await.unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;

    let stored = store.get_job(jobs[0].id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert!(stored.error.is_none());
    assert_eq!(queue.inner.timers.armed_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_job_is_not_found() {
    let (queue, _store) = queue();
    let err = queue.complete(JobId::new(), None).await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn test_delete_never_waits() {
    let (queue, _store) = queue();
    for i in 0..5 {
        let job = queue
            .submit(JobKind::Delete, &format!("session-{i}"), json!({}))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Active);
    }
    let stats = queue.stats(Some(JobKind::Delete)).await.unwrap();
    assert_eq!((stats.active_count, stats.waiting_count), (5, 0));
    queue.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_per_kind_caps_are_independent() {
    let store = Arc::new(MemoryStore::new());
    let mut settings = AdmissionSettings::default();
    settings.concurrency.insert("logout".into(), 1);
    let queue = queue_with(store, settings);

    let first = queue.submit(JobKind::Logout, "a", json!({})).await.unwrap();
    let second = queue.submit(JobKind::Logout, "b", json!({})).await.unwrap();
    let other = queue.submit(JobKind::Restart, "c", json!({})).await.unwrap();

    assert_eq!(first.state, JobState::Active);
    assert_eq!(second.state, JobState::Waiting);
    assert_eq!(other.state, JobState::Active);
    queue.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_find_active_by_subject() {
    let (queue, _store) = queue();
    queue.submit(JobKind::Start, "session-a", json!({})).await.unwrap();
    let restart = queue.submit(JobKind::Restart, "session-b", json!({})).await.unwrap();

    let found = queue.find_active_by_subject("session-b", None).await.unwrap();
    assert_eq!(found.map(|j| j.id), Some(restart.id));

    assert!(queue
        .find_active_by_subject("session-b", Some(JobKind::Start))
        .await
        .unwrap()
        .is_none());
    assert!(queue.find_active_by_subject("nobody", None).await.unwrap().is_none());
    queue.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_reap_stale_recovers_jobs_from_dead_process() {
    let store = Arc::new(MemoryStore::new());
    let clock: SharedClock = Arc::new(TokioClock::new());
    let crashed = AdmissionQueue::with_clock(store.clone(), AdmissionSettings::default(), clock.clone());
    let jobs = submit_starts(&crashed, 4).await;
    // Timers die with the process
    crashed.shutdown();

    let restarted = AdmissionQueue::with_clock(store.clone(), AdmissionSettings::default(), clock);
    assert_eq!(restarted.reap_stale().await.unwrap(), 0, "nothing is stale yet");

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(restarted.reap_stale().await.unwrap(), 3);

    let fourth = store.get_job(jobs[3].id).await.unwrap().unwrap();
    assert_eq!(fourth.state, JobState::Active);
    assert_eq!(restarted.inner.timers.armed_count(), 1, "promoted job gets a timeout");
    restarted.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_purges_old_records() {
    let store = Arc::new(MemoryStore::new());
    let mut settings = AdmissionSettings::default();
    settings.completed_ttl_secs = 48 * 3600;
    let queue = queue_with(store.clone(), settings);

    let job = queue.submit(JobKind::Start, "s", json!({})).await.unwrap();
    queue.complete(job.id, None).await.unwrap();
    let ticker = queue.start_maintenance().await.unwrap();

    tokio::time::sleep(Duration::from_secs(8 * 3600 + 1)).await;
    assert!(store.get_job(job.id).await.unwrap().is_some(), "inside retention");

    tokio::time::sleep(Duration::from_secs(8 * 3600)).await;
    assert!(store.get_job(job.id).await.unwrap().is_none());

    ticker.stop().await;
    queue.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_purge_expired_respects_retention() {
    let store = Arc::new(MemoryStore::new());
    let mut settings = AdmissionSettings::default();
    settings.completed_ttl_secs = 48 * 3600;
    let queue = queue_with(store.clone(), settings);

    let job = queue.submit(JobKind::Start, "s", json!({})).await.unwrap();
    queue.complete(job.id, None).await.unwrap();

    assert_eq!(queue.purge_expired().await.unwrap(), 0);
    tokio::time::sleep(Duration::from_secs(12 * 3600 + 1)).await;
    assert_eq!(queue.purge_expired().await.unwrap(), 1);
    queue.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_rejects_new_work() {
    let (queue, _store) = queue();
    queue.submit(JobKind::Start, "s", json!({})).await.unwrap();
    queue.shutdown();

    let err = queue.submit(JobKind::Start, "t", json!({})).await.unwrap_err();
    assert!(matches!(err, QueueError::ShuttingDown));
    assert_eq!(queue.inner.timers.armed_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_completes_with_executor_result() {
    let (queue, _store) = queue();
    let mut executor = MockExecutor::new();
    executor
        .expect_execute()
        .times(1)
        .returning(|_, _| Ok(json!({"status": "WORKING"})));

    let job = queue
        .run(JobKind::Start, "session-1", json!({}), &executor)
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result, Some(json!({"status": "WORKING"})));
    queue.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_run_waits_for_admission_and_records_failure() {
    let store = Arc::new(MemoryStore::new());
    let mut settings = AdmissionSettings::default();
    settings.default_concurrency = 1;
    let queue = queue_with(store, settings);

    let blocker = queue.submit(JobKind::Create, "first", json!({})).await.unwrap();
    let releaser = queue.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        releaser.complete(blocker.id, None).await.unwrap();
    });

    let mut executor = MockExecutor::new();
    executor
        .expect_execute()
        .times(1)
        .returning(|_, _| Err(crate::error::UpstreamError::Rejected("name taken".into())));

    let job = queue
        .run(JobKind::Create, "second", json!({}), &executor)
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.error.unwrap().contains("name taken"));
    queue.shutdown();
}

#[derive(Debug, Clone)]
enum Op {
    Submit,
    CompleteOldest,
    FailNewest,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Submit),
        1 => Just(Op::CompleteOldest),
        1 => Just(Op::FailNewest),
    ]
}

proptest! {
    #[test]
    fn test_active_never_exceeds_cap(cap in 1usize..5, ops in proptest::collection::vec(op(), 1..60)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        runtime.block_on(async {
            let store = Arc::new(MemoryStore::new());
            let mut settings = AdmissionSettings::default();
            settings.default_concurrency = cap;
            let queue = queue_with(store.clone(), settings);

            for op in ops {
                let active = store.list_ids(JobKind::Start, QueueList::Active).await.unwrap();
                match op {
                    Op::Submit => {
                        queue.submit(JobKind::Start, "s", json!({})).await.unwrap();
                    }
                    Op::CompleteOldest => {
                        if let Some(id) = active.first() {
                            queue.complete(*id, None).await.unwrap();
                        }
                    }
                    Op::FailNewest => {
                        if let Some(id) = active.last() {
                            queue.fail(*id, "boom").await.unwrap();
                        }
                    }
                }

                let depth = store.depth(JobKind::Start).await.unwrap();
                assert!(depth.active <= cap);
                if depth.waiting > 0 {
                    assert_eq!(depth.active, cap, "a slot is free while jobs wait");
                }
            }
            queue.shutdown();
        });
    }
}
