use super::*;
use crate::config::StoreRetryConfig;
use crate::domain::{BackoffPolicy, Priority};
use crate::port::id_provider::mocks::SequenceIdProvider;
use crate::port::job_processor::mocks::{MockBehavior, MockProcessor};
use crate::port::queue_store::mocks::InMemoryQueueStore;
use crate::port::time_provider::SystemTimeProvider;
use crate::port::{processor_fn, JobError};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::time::sleep;

fn test_config() -> EngineConfig {
    EngineConfig {
        store_retry: StoreRetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
        ..Default::default()
    }
}

fn engine_on(store: Arc<InMemoryQueueStore>, config: EngineConfig) -> QueueEngine {
    QueueEngine::new(
        config,
        store,
        Arc::new(SequenceIdProvider::new("job")),
        Arc::new(SystemTimeProvider),
    )
}

fn settings(name: &str) -> QueueSettings {
    QueueSettings::new(name).with_backoff(BackoffPolicy::fixed(10))
}

async fn setup(settings: QueueSettings) -> (QueueEngine, Arc<InMemoryQueueStore>) {
    let store = Arc::new(InMemoryQueueStore::new());
    let engine = engine_on(Arc::clone(&store), test_config());
    engine.create_queue(settings).await.unwrap();
    (engine, store)
}

async fn wait_for_stats(
    engine: &QueueEngine,
    queue: &str,
    done: impl Fn(&QueueStats) -> bool,
) -> QueueStats {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = engine.get_stats(queue).await.unwrap();
        if done(&stats) || Instant::now() > deadline {
            return stats;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

async fn enqueue(engine: &QueueEngine, queue: &str, options: JobOptions) -> String {
    engine
        .enqueue(queue, "work", json!({}), options)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_priority_order_within_queue() {
    let (engine, _) = setup(settings("q")).await;
    let processor = Arc::new(MockProcessor::new_success());
    engine
        .register_processor("q", "work", processor.clone())
        .unwrap();

    engine.pause("q").unwrap();
    let n1 = enqueue(&engine, "q", JobOptions::default()).await;
    let n2 = enqueue(&engine, "q", JobOptions::default()).await;
    let high = enqueue(
        &engine,
        "q",
        JobOptions::default().with_priority(Priority::HIGH),
    )
    .await;
    engine.resume("q").unwrap();

    let stats = wait_for_stats(&engine, "q", |s| s.completed == 3).await;
    assert_eq!(stats.completed, 3);
    assert_eq!(processor.calls(), vec![high, n1, n2]);
}

#[tokio::test]
async fn test_retry_exhaustion_archives_failed_job() {
    let (engine, _) = setup(settings("q").with_max_attempts(3)).await;
    let processor = Arc::new(MockProcessor::new_fail("boom"));
    engine
        .register_processor("q", "work", processor.clone())
        .unwrap();

    let id = enqueue(&engine, "q", JobOptions::default()).await;

    let stats = wait_for_stats(&engine, "q", |s| s.failed_total == 1).await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.failed_total, 1);
    assert_eq!(processor.call_count(), 3);

    let failed = engine.get_failed_jobs("q", 10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].attempts_made, 3);
    assert!(failed[0].failed_at.is_some());
    assert!(failed[0].last_error.as_deref().unwrap().contains("boom"));
}

#[tokio::test]
async fn test_job_succeeds_after_transient_failures() {
    let (engine, _) = setup(settings("q").with_max_attempts(3)).await;
    let processor = Arc::new(MockProcessor::new(MockBehavior::FailTimes(
        2,
        "flaky".to_string(),
    )));
    engine
        .register_processor("q", "work", processor.clone())
        .unwrap();

    enqueue(&engine, "q", JobOptions::default()).await;

    let stats = wait_for_stats(&engine, "q", |s| s.completed == 1).await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);

    let completed = engine.get_completed_jobs("q", 10).await.unwrap();
    assert_eq!(completed[0].attempts_made, 3);
    assert!(completed[0].completed_at.is_some());
}

#[tokio::test]
async fn test_exhausted_job_appears_once_in_dead_letter_queue() {
    let (engine, store) = setup(
        settings("q")
            .with_max_attempts(2)
            .with_dead_letter_queue("q-dead"),
    )
    .await;
    engine
        .register_processor("q", "work", Arc::new(MockProcessor::new_fail("boom")))
        .unwrap();

    let id = enqueue(&engine, "q", JobOptions::default()).await;

    let source = wait_for_stats(&engine, "q", |s| s.dead_lettered == 1 && s.active == 0).await;
    assert_eq!(source.dead_lettered, 1);
    assert_eq!(source.failed, 0);

    let dead = engine.get_stats("q-dead").await.unwrap();
    assert_eq!(dead.waiting, 1);
    assert_eq!(dead.concurrency, 0);
    assert!(engine.get_failed_jobs("q", 10).await.unwrap().is_empty());
    assert!(engine.get_job("q", &id).await.unwrap().is_none());

    let records = store.hvals("quell:q-dead:jobs").await.unwrap();
    assert_eq!(records.len(), 1);
    let dead_job: Job = serde_json::from_str(&records[0]).unwrap();
    assert_eq!(dead_job.metadata["original_queue"], json!("q"));
    assert_eq!(dead_job.metadata["original_job_id"], json!(id));
    assert!(dead_job.metadata["failure_reason"]
        .as_str()
        .unwrap()
        .contains("boom"));
    assert!(dead_job.metadata["failed_at"].is_i64());
}

#[tokio::test]
async fn test_active_never_exceeds_concurrency() {
    let (engine, _) = setup(settings("q").with_concurrency(2)).await;

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
    engine
        .register_processor(
            "q",
            "work",
            processor_fn(move |_job, _ctx| {
                let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, JobError>(None)
                }
            }),
        )
        .unwrap();

    for _ in 0..8 {
        enqueue(&engine, "q", JobOptions::default()).await;
    }

    let mut observed_max = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = engine.get_stats("q").await.unwrap();
        observed_max = observed_max.max(stats.active);
        if stats.completed == 8 || Instant::now() > deadline {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(engine.get_stats("q").await.unwrap().completed, 8);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(observed_max <= 2);
}

#[tokio::test]
async fn test_pause_and_resume_are_idempotent() {
    let (engine, _) = setup(settings("q")).await;

    engine.pause("q").unwrap();
    engine.pause("q").unwrap();
    assert_eq!(engine.queue_status("q").unwrap(), QueueStatus::Paused);

    engine.resume("q").unwrap();
    engine.resume("q").unwrap();
    assert_eq!(engine.queue_status("q").unwrap(), QueueStatus::Active);
}

#[tokio::test]
async fn test_paused_queue_accepts_but_does_not_dispatch() {
    let (engine, _) = setup(settings("q")).await;
    let processor = Arc::new(MockProcessor::new_success());
    engine
        .register_processor("q", "work", processor.clone())
        .unwrap();

    engine.pause("q").unwrap();
    enqueue(&engine, "q", JobOptions::default()).await;
    sleep(Duration::from_millis(150)).await;

    assert_eq!(processor.call_count(), 0);
    assert_eq!(engine.get_stats("q").await.unwrap().waiting, 1);

    engine.resume("q").unwrap();
    let stats = wait_for_stats(&engine, "q", |s| s.completed == 1).await;
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_unknown_queue_is_rejected() {
    let (engine, _) = setup(settings("q")).await;

    let err = engine
        .enqueue("missing", "work", json!({}), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidQueue(_)));

    let err = engine
        .register_processor("missing", "work", Arc::new(MockProcessor::new_success()))
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidQueue(_)));
}

#[tokio::test]
async fn test_drain_waits_for_in_flight_then_stops() {
    let (engine, _) = setup(settings("q")).await;
    engine
        .register_processor(
            "q",
            "work",
            Arc::new(MockProcessor::new(MockBehavior::Sleep(100))),
        )
        .unwrap();

    enqueue(&engine, "q", JobOptions::default()).await;
    wait_for_stats(&engine, "q", |s| s.active == 1).await;

    engine.drain("q").await.unwrap();

    let stats = engine.get_stats("q").await.unwrap();
    assert_eq!(stats.status, QueueStatus::Stopped);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.active, 0);

    let err = engine
        .enqueue("q", "work", json!({}), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidQueue(_)));

    // draining twice is harmless
    engine.drain("q").await.unwrap();
}

#[tokio::test]
async fn test_drain_keeps_pending_jobs_for_restart() {
    let store = Arc::new(InMemoryQueueStore::new());
    let engine = engine_on(Arc::clone(&store), test_config());
    engine.create_queue(settings("q")).await.unwrap();

    for _ in 0..3 {
        enqueue(&engine, "q", JobOptions::default().with_delay(60_000)).await;
    }
    engine.drain("q").await.unwrap();

    let restarted = engine_on(Arc::clone(&store), test_config());
    let report = restarted.create_queue(settings("q")).await.unwrap();
    assert_eq!(report.restored, 3);
    assert_eq!(report.requeued, 0);
    assert_eq!(restarted.get_stats("q").await.unwrap().delayed, 3);
}

#[tokio::test]
async fn test_restore_requeues_orphaned_active_job() {
    let store = Arc::new(InMemoryQueueStore::new());
    let mut orphan = Job::new(
        "orphan-1",
        1_000,
        "q",
        JobName::new("work"),
        JobPayload::new(json!({})),
    );
    orphan.attempts_made = 1;
    orphan.processed_at = Some(2_000);
    store
        .hset(
            "quell:q:jobs",
            "orphan-1",
            &serde_json::to_string(&orphan).unwrap(),
        )
        .await
        .unwrap();
    store
        .hset("quell:q:jobs", "junk", "{not json")
        .await
        .unwrap();

    let engine = engine_on(Arc::clone(&store), test_config());
    let report = engine
        .create_queue(settings("q").with_concurrency(0))
        .await
        .unwrap();

    assert_eq!(report.restored, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(report.skipped, 1);

    let job = engine.get_job("q", "orphan-1").await.unwrap().unwrap();
    assert!(job.processed_at.is_none());
    assert_eq!(job.attempts_made, 1);
    assert_eq!(engine.get_stats("q").await.unwrap().waiting, 1);
}

#[tokio::test]
async fn test_missing_processor_fails_job() {
    let (engine, _) = setup(settings("q").with_max_attempts(1)).await;

    enqueue(&engine, "q", JobOptions::default()).await;

    let stats = wait_for_stats(&engine, "q", |s| s.failed == 1).await;
    assert_eq!(stats.failed, 1);
    let failed = engine.get_failed_jobs("q", 1).await.unwrap();
    assert!(failed[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("No processor registered"));
}

#[tokio::test]
async fn test_processor_panic_is_contained() {
    let (engine, _) = setup(settings("q").with_max_attempts(1)).await;
    let processor = Arc::new(MockProcessor::new(MockBehavior::Panic(
        "kaboom".to_string(),
    )));
    engine
        .register_processor("q", "work", processor.clone())
        .unwrap();

    enqueue(&engine, "q", JobOptions::default()).await;
    wait_for_stats(&engine, "q", |s| s.failed == 1).await;

    let failed = engine.get_failed_jobs("q", 1).await.unwrap();
    assert!(failed[0].last_error.as_deref().unwrap().contains("kaboom"));

    // the worker survived
    processor.set_behavior(MockBehavior::Success);
    enqueue(&engine, "q", JobOptions::default()).await;
    let stats = wait_for_stats(&engine, "q", |s| s.completed == 1).await;
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_stalled_job_is_aborted_and_failed() {
    let (engine, _) = setup(
        settings("q")
            .with_max_attempts(1)
            .with_stalled_check(50, 1),
    )
    .await;
    engine
        .register_processor("q", "work", Arc::new(MockProcessor::new(MockBehavior::Hang)))
        .unwrap();

    enqueue(&engine, "q", JobOptions::default()).await;

    let stats = wait_for_stats(&engine, "q", |s| s.failed == 1).await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.active, 0);

    let failed = engine.get_failed_jobs("q", 1).await.unwrap();
    let expected = JobError::Stalled { count: 2, limit: 1 }.to_string();
    assert_eq!(failed[0].last_error.as_deref(), Some(expected.as_str()));
}

#[tokio::test]
async fn test_heartbeat_keeps_long_job_alive() {
    let (engine, _) = setup(
        settings("q")
            .with_max_attempts(1)
            .with_stalled_check(100, 1),
    )
    .await;
    engine
        .register_processor(
            "q",
            "work",
            processor_fn(|_job, ctx| async move {
                for _ in 0..20 {
                    sleep(Duration::from_millis(15)).await;
                    ctx.heartbeat();
                }
                Ok::<_, JobError>(None)
            }),
        )
        .unwrap();

    enqueue(&engine, "q", JobOptions::default()).await;

    let stats = wait_for_stats(&engine, "q", |s| s.completed == 1 || s.failed == 1).await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_retry_failed_jobs_with_filter() {
    let (engine, _) = setup(settings("q").with_max_attempts(1)).await;
    let processor = Arc::new(MockProcessor::new_fail("down"));
    engine
        .register_processor("q", "work", processor.clone())
        .unwrap();

    engine
        .enqueue("q", "work", json!({"retry": true}), JobOptions::default())
        .await
        .unwrap();
    engine
        .enqueue("q", "work", json!({"retry": false}), JobOptions::default())
        .await
        .unwrap();
    wait_for_stats(&engine, "q", |s| s.failed == 2 && s.active == 0).await;

    processor.set_behavior(MockBehavior::Success);
    let only_flagged: &JobFilter = &|job: &Job| job.payload.as_value()["retry"] == json!(true);
    let retried = engine
        .retry_failed_jobs("q", Some(only_flagged))
        .await
        .unwrap();
    assert_eq!(retried, 1);

    let stats = wait_for_stats(&engine, "q", |s| s.completed == 1).await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);

    let completed = engine.get_completed_jobs("q", 1).await.unwrap();
    assert_eq!(completed[0].payload.as_value()["retry"], json!(true));
    assert_eq!(completed[0].attempts_made, 1);
    assert!(completed[0].last_error.is_none());
}

#[tokio::test]
async fn test_delayed_job_waits_for_its_time() {
    let (engine, _) = setup(settings("q")).await;
    let processor = Arc::new(MockProcessor::new_success());
    engine
        .register_processor("q", "work", processor.clone())
        .unwrap();

    enqueue(&engine, "q", JobOptions::default().with_delay(200)).await;

    let stats = engine.get_stats("q").await.unwrap();
    assert_eq!(stats.delayed, 1);
    assert_eq!(stats.waiting, 0);
    assert_eq!(processor.call_count(), 0);

    let stats = wait_for_stats(&engine, "q", |s| s.completed == 1).await;
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_completed_archive_retention_and_order() {
    let (engine, _) = setup(settings("q").with_retention(Some(2), None)).await;
    engine
        .register_processor("q", "work", Arc::new(MockProcessor::new_success()))
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(enqueue(&engine, "q", JobOptions::default()).await);
    }

    let stats = wait_for_stats(&engine, "q", |s| s.completed_total == 5).await;
    assert_eq!(stats.completed_total, 5);
    assert_eq!(stats.completed, 2);

    let newest: Vec<_> = engine
        .get_completed_jobs("q", 10)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(newest, vec![ids[4].clone(), ids[3].clone()]);
    assert!(engine.get_job("q", &ids[0]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_aggressive_compaction_trims_archives() {
    let store = Arc::new(InMemoryQueueStore::new());
    let engine = engine_on(
        Arc::clone(&store),
        EngineConfig {
            compaction_floor: 1,
            ..test_config()
        },
    );
    engine.create_queue(settings("q")).await.unwrap();
    engine
        .register_processor("q", "work", Arc::new(MockProcessor::new_success()))
        .unwrap();
    for _ in 0..3 {
        enqueue(&engine, "q", JobOptions::default()).await;
    }
    wait_for_stats(&engine, "q", |s| s.completed == 3).await;

    let standard = engine.compact(false).await.unwrap();
    assert_eq!(standard.archived_removed, 0);

    let aggressive = engine.compact(true).await.unwrap();
    assert_eq!(aggressive.queues, 1);
    assert_eq!(aggressive.archived_removed, 2);
    assert_eq!(engine.get_stats("q").await.unwrap().completed, 1);
}

#[tokio::test]
async fn test_pause_sheddable_and_resume() {
    let store = Arc::new(InMemoryQueueStore::new());
    let engine = engine_on(store, test_config());
    engine.create_queue(settings("chat")).await.unwrap();
    engine
        .create_queue(settings("bulk").sheddable())
        .await
        .unwrap();

    let paused = engine.pause_sheddable();
    assert_eq!(paused, vec!["bulk".to_string()]);
    assert_eq!(engine.queue_status("bulk").unwrap(), QueueStatus::Paused);
    assert_eq!(engine.queue_status("chat").unwrap(), QueueStatus::Active);

    // already paused: nothing new to shed
    assert!(engine.pause_sheddable().is_empty());

    engine.resume_shed(&paused);
    assert_eq!(engine.queue_status("bulk").unwrap(), QueueStatus::Active);
}

#[tokio::test]
async fn test_store_outage_surfaces_as_unavailable() {
    let (engine, store) = setup(settings("q")).await;

    store.fail_next(10);
    let err = engine
        .enqueue("q", "work", json!({}), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::StoreUnavailable(_)));
    assert!(err.is_transient());

    store.fail_next(0);
    let stats = engine.get_stats("q").await.unwrap();
    assert_eq!(stats.waiting, 0);
}

#[tokio::test]
async fn test_brief_store_outage_is_retried() {
    let (engine, store) = setup(settings("q").with_concurrency(0)).await;

    store.fail_next(2);
    engine
        .enqueue("q", "work", json!({}), JobOptions::default())
        .await
        .unwrap();
    assert_eq!(engine.get_stats("q").await.unwrap().waiting, 1);
}

#[tokio::test]
async fn test_duplicate_queue_is_rejected() {
    let (engine, _) = setup(settings("q")).await;
    let err = engine.create_queue(settings("q")).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
}

#[tokio::test]
async fn test_active_jobs_usage_source() {
    let (engine, _) = setup(settings("q")).await;
    engine
        .register_processor(
            "q",
            "work",
            Arc::new(MockProcessor::new(MockBehavior::Sleep(200))),
        )
        .unwrap();
    enqueue(&engine, "q", JobOptions::default()).await;
    wait_for_stats(&engine, "q", |s| s.active == 1).await;

    assert_eq!(engine.active_jobs(), 1);
    engine.shutdown().await;
}
