//! End-to-end flows through the public API on the in-memory store
//!
//! Timer-driven scenarios run on paused tokio time.

use acton_queue::clock::{SharedClock, TokioClock};
use acton_queue::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn clock() -> SharedClock {
    Arc::new(TokioClock::new())
}

#[tokio::test(start_paused = true)]
async fn test_five_starts_with_cap_three() {
    let store = Arc::new(MemoryStore::new());
    let queue = AdmissionQueue::with_clock(store, AdmissionSettings::default(), clock());

    let mut jobs = Vec::new();
    for i in 0..5 {
        jobs.push(queue.submit(JobKind::Start, &format!("session-{i}"), json!({})).await.unwrap());
    }

    let states: Vec<JobState> = jobs.iter().map(|job| job.state).collect();
    assert_eq!(
        states,
        vec![
            JobState::Active,
            JobState::Active,
            JobState::Active,
            JobState::Waiting,
            JobState::Waiting
        ]
    );

    let stats = queue.get_stats(Some(JobKind::Start)).await.unwrap();
    assert_eq!((stats.active_count, stats.waiting_count), (3, 2));
    assert_eq!(stats.positions[0].job_id, jobs[3].id);
    assert_eq!(stats.positions[1].position, 1);

    let finished = queue.complete(jobs[0].id, None).await.unwrap().unwrap();
    assert_eq!(finished.promoted.map(|job| job.id), Some(jobs[3].id));

    // Nobody completes the rest: the timeout sweeps fail them and drain the line
    tokio::time::sleep(Duration::from_secs(40)).await;
    for job in &jobs[1..] {
        let stored = queue.get_status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed, "{}", stored.subject_id);
    }
    let stats = queue.get_stats(None).await.unwrap();
    assert_eq!((stats.active_count, stats.waiting_count), (0, 0));
    queue.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_admission_run_with_executor() {
    let store = Arc::new(MemoryStore::new());
    let queue = AdmissionQueue::with_clock(store, AdmissionSettings::default(), clock());
    let executor = FnExecutor::new(|subject: String, _payload: serde_json::Value| async move {
        Ok::<_, UpstreamError>(json!({ "session": subject }))
    });

    let job = queue.run(JobKind::Restart, "session-9", json!({}), &executor).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result, Some(json!({ "session": "session-9" })));
    queue.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_pool_drains_crawl_queue() {
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(FnExecutor::new(|url: String, _payload: serde_json::Value| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok::<_, UpstreamError>(json!({ "markdown": format!("# {url}") }))
    }));
    let pool = RateLimitedWorkerPool::builder(store, executor)
        .settings(PoolSettings {
            concurrency: 5,
            ..PoolSettings::default()
        })
        .clock(clock())
        .build();

    let mut ids = Vec::new();
    for i in 0..30 {
        ids.push(pool.enqueue(&format!("https://example.com/{i}"), json!({})).await.unwrap().id);
    }
    assert!(pool.wait_idle(Duration::from_secs(30)).await.unwrap());

    for id in ids {
        let job = pool.get_status(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
    }
    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.minute_count, 30);
    assert_eq!(stats.local_in_flight, 0);
    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_batcher_coalesces_greeting() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let executor = Arc::new(FnExecutor::new(move |conversation: String, payload: serde_json::Value| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().push((conversation, payload["text"].as_str().unwrap_or_default().to_string()));
            Ok::<_, UpstreamError>(serde_json::Value::Null)
        }
    }));
    let batcher = ConversationBatcher::with_executor(Arc::new(MemoryStore::new()), executor, BatcherSettings::default());

    for (i, text) in ["hi", "how", "are you"].into_iter().enumerate() {
        batcher.push("whatsapp:123", BufferedMessage::new(i.to_string(), text)).unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(
        *seen.lock(),
        vec![("whatsapp:123".to_string(), "hi\nhow\nare you".to_string())]
    );
    batcher.shutdown().await;
}
