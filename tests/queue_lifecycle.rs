//! Integration tests for the durable job queue: claim ordering,
//! dependencies, leases, retry backoff, and the dead letter.

mod helpers;

use std::time::Duration;

use chrono::Utc;
use national_treasure::models::{JobStatus, JobType};
use national_treasure::queue::{JobQueue, QueueError};
use national_treasure::EngineConfig;

use helpers::create_test_pool;

const LEASE: Duration = Duration::from_secs(60);

async fn queue_with(config: EngineConfig) -> JobQueue {
    let pool = create_test_pool().await;
    JobQueue::new(pool, &config)
}

async fn default_queue() -> JobQueue {
    queue_with(EngineConfig::default()).await
}

fn payload(tag: &str) -> serde_json::Value {
    serde_json::json!({ "schema_version": 1, "url": format!("https://{tag}.test/") })
}

/// Makes a job claimable again regardless of its retry schedule.
async fn make_available_now(queue: &JobQueue, job_id: &str) {
    sqlx::query("UPDATE jobs SET available_at = ? WHERE id = ?")
        .bind(Utc::now().timestamp_millis())
        .bind(job_id)
        .execute(queue.pool())
        .await
        .expect("Failed to rewind available_at");
}

#[tokio::test]
async fn claim_orders_by_priority_then_age() {
    let queue = default_queue().await;

    let low = queue
        .enqueue(JobType::Capture, payload("low"), 0, None)
        .await
        .unwrap();
    let high_old = queue
        .enqueue(JobType::Capture, payload("high-old"), 5, None)
        .await
        .unwrap();
    let high_new = queue
        .enqueue(JobType::Capture, payload("high-new"), 5, None)
        .await
        .unwrap();

    let first = queue.claim("w1", LEASE).await.unwrap().unwrap();
    let second = queue.claim("w1", LEASE).await.unwrap().unwrap();
    let third = queue.claim("w1", LEASE).await.unwrap().unwrap();

    assert_eq!(first.id, high_old);
    assert_eq!(second.id, high_new);
    assert_eq!(third.id, low);
    assert!(queue.claim("w1", LEASE).await.unwrap().is_none());
}

#[tokio::test]
async fn claimed_job_carries_lease_and_owner() {
    let queue = default_queue().await;
    queue
        .enqueue(JobType::Capture, payload("a"), 0, None)
        .await
        .unwrap();

    let job = queue.claim("w1", LEASE).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.locked_by.as_deref(), Some("w1"));
    let locked_at = job.locked_at.expect("locked_at set");
    let deadline = job.lease_deadline.expect("lease_deadline set");
    assert!(deadline > locked_at);
}

#[tokio::test]
async fn dependency_gates_until_parent_done() {
    let queue = default_queue().await;

    let x = queue
        .enqueue(JobType::Capture, payload("x"), 0, None)
        .await
        .unwrap();
    let y = queue
        .enqueue(JobType::Capture, payload("y"), 10, Some(&x))
        .await
        .unwrap();

    // Y outranks X on priority but is invisible until X is done.
    let first = queue.claim("w1", LEASE).await.unwrap().unwrap();
    assert_eq!(first.id, x);
    assert!(queue.claim("w2", LEASE).await.unwrap().is_none());

    queue
        .succeed(&x, "w1", serde_json::json!({"ok": true}))
        .await
        .unwrap();

    let next = queue.claim("w2", LEASE).await.unwrap().unwrap();
    assert_eq!(next.id, y);
}

#[tokio::test]
async fn missing_dependency_target_is_rejected() {
    let queue = default_queue().await;
    let err = queue
        .enqueue(JobType::Capture, payload("z"), 0, Some("job_nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));
}

#[tokio::test]
async fn lease_expiry_recovers_with_one_attempt_consumed() {
    let queue = default_queue().await;
    let id = queue
        .enqueue(JobType::Capture, payload("crashy"), 0, None)
        .await
        .unwrap();

    // Worker 1 claims with a tiny lease and "crashes".
    let job = queue
        .claim("w1", Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, id);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let recovered = queue.recover_stale(Utc::now()).await.unwrap();
    assert_eq!(recovered, vec![id.clone()]);

    let job = queue.job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.locked_by.is_none());

    // Worker 2 finishes it; the dead letter stays empty.
    let job = queue.claim("w2", LEASE).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    queue
        .succeed(&id, "w2", serde_json::json!({"ok": true}))
        .await
        .unwrap();
    assert!(queue.dead_letters(10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn heartbeat_keeps_the_job_off_the_recovery_sweep() {
    let queue = default_queue().await;
    let id = queue
        .enqueue(JobType::Capture, payload("slow"), 0, None)
        .await
        .unwrap();

    queue
        .claim("w1", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    queue.heartbeat(&id, "w1", LEASE).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert!(queue.recover_stale(Utc::now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn retry_backoff_doubles_then_dead_letters() {
    // max_attempts = 4 gives the 30s / 60s / 120s schedule before death.
    let config = EngineConfig {
        max_attempts: 4,
        ..EngineConfig::default()
    };
    let queue = queue_with(config).await;
    let id = queue
        .enqueue(JobType::Capture, payload("blocked"), 0, None)
        .await
        .unwrap();

    for (attempt, expected_secs) in [(1u32, 30i64), (2, 60), (3, 120)] {
        let job = queue.claim("w1", LEASE).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        let status = queue.fail(&id, "w1", "blocked by cloudflare").await.unwrap();
        assert_eq!(status, JobStatus::Pending);

        let job = queue.job(&id).await.unwrap().unwrap();
        assert_eq!(job.attempts, attempt);
        let delay = (job.available_at - Utc::now()).num_seconds();
        assert!(
            (delay - expected_secs).abs() <= 2,
            "attempt {attempt}: expected ~{expected_secs}s backoff, got {delay}s"
        );

        make_available_now(&queue, &id).await;
    }

    // Fourth failure exhausts the attempts.
    queue.claim("w1", LEASE).await.unwrap().unwrap();
    let status = queue.fail(&id, "w1", "blocked by cloudflare").await.unwrap();
    assert_eq!(status, JobStatus::Dead);

    let job = queue.job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert!(job.attempts >= job.max_attempts);

    let dead = queue.dead_letters(10, 0).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id, id);
    assert_eq!(dead[0].attempts, 4);
    assert_eq!(dead[0].error, "blocked by cloudflare");
}

#[tokio::test]
async fn mutations_require_ownership() {
    let queue = default_queue().await;
    let id = queue
        .enqueue(JobType::Capture, payload("owned"), 0, None)
        .await
        .unwrap();
    queue.claim("w1", LEASE).await.unwrap().unwrap();

    let err = queue.heartbeat(&id, "w2", LEASE).await.unwrap_err();
    assert!(matches!(err, QueueError::OwnershipMismatch { .. }));

    let err = queue
        .succeed(&id, "w2", serde_json::json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::OwnershipMismatch { .. }));

    let err = queue.fail(&id, "w2", "nope").await.unwrap_err();
    assert!(matches!(err, QueueError::OwnershipMismatch { .. }));

    // The real owner can still complete, exactly once.
    queue
        .succeed(&id, "w1", serde_json::json!({"done": true}))
        .await
        .unwrap();
    let err = queue
        .succeed(&id, "w1", serde_json::json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::OwnershipMismatch { .. }));
}

#[tokio::test]
async fn pending_cap_rejects_enqueues() {
    let config = EngineConfig {
        max_pending: 2,
        ..EngineConfig::default()
    };
    let queue = queue_with(config).await;

    queue
        .enqueue(JobType::Capture, payload("a"), 0, None)
        .await
        .unwrap();
    queue
        .enqueue(JobType::Capture, payload("b"), 0, None)
        .await
        .unwrap();
    let err = queue
        .enqueue(JobType::Capture, payload("c"), 0, None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Full(2)));
}

#[tokio::test]
async fn cancel_is_pending_only() {
    let queue = default_queue().await;
    let a = queue
        .enqueue(JobType::Capture, payload("a"), 0, None)
        .await
        .unwrap();
    let b = queue
        .enqueue(JobType::Capture, payload("b"), 10, None)
        .await
        .unwrap();

    queue.claim("w1", LEASE).await.unwrap().unwrap(); // takes b
    let err = queue.cancel(&b).await.unwrap_err();
    assert!(matches!(err, QueueError::NotCancellable(_)));

    queue.cancel(&a).await.unwrap();
    let job = queue.job(&a).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.last_error.as_deref(), Some("cancelled"));
    // Dead jobs always satisfy the dead-state invariant, cancellation
    // included: attempts at the cap and a dead-letter snapshot.
    assert!(job.attempts >= job.max_attempts);
    let dead = queue.dead_letters(10, 0).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id, a);
    assert_eq!(dead[0].error, "cancelled");
}

#[tokio::test]
async fn dead_letter_revival_resets_attempts_and_keeps_the_trail() {
    let queue = default_queue().await;
    let id = queue
        .enqueue(JobType::Capture, payload("doomed"), 0, None)
        .await
        .unwrap();

    queue.claim("w1", LEASE).await.unwrap().unwrap();
    queue
        .fail_permanent(&id, "w1", "malformed URL")
        .await
        .unwrap();

    let job = queue.job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.attempts, job.max_attempts);

    let revived = queue.retry_dead_letter(&id).await.unwrap();
    assert_eq!(revived, id);

    let job = queue.job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert!(job.last_error.is_none());

    let dead = queue.dead_letters(10, 0).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].revived_at.is_some());

    // Reviving twice is refused: the snapshot is already consumed.
    let err = queue.retry_dead_letter(&id).await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));
}

#[tokio::test]
async fn named_queues_are_isolated() {
    let pool = create_test_pool().await;
    let config = EngineConfig::default();
    let captures = JobQueue::new(pool.clone(), &config);
    let scrapes = JobQueue::new(pool, &config).with_queue_name("scrapes");

    captures
        .enqueue(JobType::Capture, payload("a"), 0, None)
        .await
        .unwrap();
    scrapes
        .enqueue(JobType::Scrape, payload("b"), 0, None)
        .await
        .unwrap();

    let job = scrapes.claim("w1", LEASE).await.unwrap().unwrap();
    assert_eq!(job.job_type, JobType::Scrape);
    assert!(scrapes.claim("w1", LEASE).await.unwrap().is_none());
    assert!(captures.claim("w1", LEASE).await.unwrap().is_some());
}

#[tokio::test]
async fn batch_enqueue_is_atomic_and_visible() {
    let queue = default_queue().await;
    let ids = queue
        .enqueue_batch(
            vec![
                (JobType::Capture, payload("one")),
                (JobType::Capture, payload("two")),
                (JobType::Scrape, payload("three")),
            ],
            3,
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);

    let depths = queue.depth_by_status().await.unwrap();
    assert_eq!(depths.get("pending"), Some(&3));
    assert_eq!(depths.get("running"), Some(&0));
    assert_eq!(depths.get("dead"), Some(&0));
}
