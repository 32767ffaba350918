//! End-to-end tests of the publish pipeline on the in-memory store.
//!
//! Time-dependent tests run on a paused runtime with [`TokioClock`], so the
//! store, the limiter and the retry sleeps all observe the same time.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cadence_common::{Config, MediaConfig, PlatformLimit, RetrySettings, SchedulerSettings};
use cadence_core::test_utils::{CountingMediaResolver, MemoryRepository, ScriptedPublisher};
use cadence_core::{
    Credential, HttpMediaResolver, MediaRef, MediaResolver, PublishError, PublishPayload,
    PublisherRegistry, WorkItem, WorkItemId, WorkStatus,
};
use cadence_queue::store::STALLED_ERROR;
use cadence_queue::{
    Clock, JobHandler, JobOutcome, JobState, MemoryStore, Outcome, PublishPipeline, ScheduleId,
    ScheduledJob, TokioClock, WorkerContext,
};
use chrono::Duration as ChronoDuration;

const LIMITED: &str = "mastodon";
const UNLIMITED: &str = "pixelfed";
const ACCOUNT: &str = "acct-1";

fn test_config() -> Config {
    Config {
        scheduler: SchedulerSettings {
            concurrency: 4,
            poll_interval_ms: 100,
            ..SchedulerSettings::default()
        },
        retry: RetrySettings {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        },
        rate_limits: HashMap::from([(
            LIMITED.to_string(),
            PlatformLimit {
                capacity: 2,
                window_secs: 60,
            },
        )]),
        ..Config::default()
    }
}

struct Harness {
    repo: MemoryRepository,
    publisher: ScriptedPublisher,
    media: CountingMediaResolver,
    pipeline: PublishPipeline,
}

impl Harness {
    fn new(publisher: ScriptedPublisher) -> Self {
        Self::with_media(publisher, CountingMediaResolver::new())
    }

    fn with_media(publisher: ScriptedPublisher, media: CountingMediaResolver) -> Self {
        let repo = MemoryRepository::new();
        repo.insert_credential(
            ACCOUNT,
            Credential::new("old-token", Some("refresh-0".to_string())),
        );
        let pipeline = build_pipeline(&repo, &publisher, Arc::new(media.clone()));
        Self {
            repo,
            publisher,
            media,
            pipeline,
        }
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.pipeline.scheduler().clock()
    }

    fn add_post(&self, post_id: &str, platform: &str) -> WorkItemId {
        let id = WorkItemId::for_post(post_id);
        self.repo.insert_work(
            WorkItem::queued(id.clone(), format!("posts/{post_id}"), self.clock().now()),
            payload(platform, vec![MediaRef::Url(
                "https://cdn.example.com/a.png".to_string(),
            )]),
        );
        id
    }
}

fn build_pipeline(
    repo: &MemoryRepository,
    publisher: &ScriptedPublisher,
    media: Arc<dyn MediaResolver>,
) -> PublishPipeline {
    let publisher = Arc::new(publisher.clone());
    let context = WorkerContext {
        work_items: Arc::new(repo.clone()),
        credentials: Arc::new(repo.clone()),
        publishers: PublisherRegistry::new()
            .with(LIMITED, publisher.clone())
            .with(UNLIMITED, publisher),
        media,
    };
    PublishPipeline::new(
        &test_config(),
        Arc::new(MemoryStore::new()),
        Arc::new(TokioClock::new()),
        context,
    )
}

fn payload(platform: &str, media: Vec<MediaRef>) -> PublishPayload {
    PublishPayload {
        platform: platform.to_string(),
        account_id: ACCOUNT.to_string(),
        owner_id: "user-1".to_string(),
        text: "hello fediverse".to_string(),
        media,
    }
}

fn unavailable() -> PublishError {
    PublishError::Http {
        status: 503,
        message: "Service Unavailable".to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_reschedule_runs_only_the_latest_schedule() {
    let h = Harness::new(ScriptedPublisher::new());
    let id = h.add_post("1", UNLIMITED);
    let start = tokio::time::Instant::now();
    let scheduler = h.pipeline.scheduler();

    let first = scheduler
        .schedule(&id, h.clock().now() + ChronoDuration::seconds(5), 5)
        .await
        .unwrap();
    let second = scheduler
        .schedule(&id, h.clock().now() + ChronoDuration::seconds(10), 5)
        .await
        .unwrap();
    assert_ne!(first, second);
    assert!(scheduler.get_job(&first).await.unwrap().is_none());

    let handle = h.pipeline.spawn();

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(h.publisher.posts().is_empty());

    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.shutdown().await;

    let posts = h.publisher.posts();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].at.duration_since(start) >= Duration::from_secs(10));

    let item = h.repo.work_item(&id).unwrap();
    assert_eq!(item.status, WorkStatus::Published);
    assert_eq!(item.external_id.as_deref(), Some("ext-1"));
    assert_eq!(
        scheduler.get_job(&second).await.unwrap().unwrap().state,
        JobState::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_schedule_never_runs() {
    let h = Harness::new(ScriptedPublisher::new());
    let id = h.add_post("1", UNLIMITED);
    let scheduler = h.pipeline.scheduler();

    let schedule = scheduler
        .schedule(&id, h.clock().now() + ChronoDuration::seconds(1), 5)
        .await
        .unwrap();
    assert!(scheduler.cancel(&schedule).await.unwrap());

    let handle = h.pipeline.spawn();
    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.shutdown().await;

    assert!(h.publisher.posts().is_empty());
    assert_eq!(h.repo.work_item(&id).unwrap().status, WorkStatus::Queued);
}

#[tokio::test(start_paused = true)]
async fn test_auth_expiry_refreshes_credentials_and_fails_item() {
    let publisher =
        ScriptedPublisher::new().with_posts([Err(PublishError::AuthExpired("token revoked".to_string()))]);
    let h = Harness::new(publisher);
    let id = h.add_post("1", UNLIMITED);

    let outcome = h.pipeline.worker().process(&id).await;

    assert!(matches!(outcome, Outcome::AuthFailure { recovered: true, .. }));
    assert_eq!(h.publisher.posts().len(), 1);
    assert_eq!(h.publisher.refreshes(), vec!["refresh-0".to_string()]);

    let credential = h.repo.credential(ACCOUNT).unwrap();
    assert_eq!(credential.access_token, "access-1");
    assert_eq!(credential.refresh_token.as_deref(), Some("refresh-1"));
    assert!(!credential.needs_manual_reauth);

    let item = h.repo.work_item(&id).unwrap();
    assert_eq!(item.status, WorkStatus::Failed);
    let error = item.last_error.unwrap();
    assert!(error.contains("authentication expired"));
    assert!(error.contains("schedule the post again"));
    assert_eq!(h.media.cleanups(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scheduling_again_after_refresh_publishes_with_new_token() {
    let publisher =
        ScriptedPublisher::new().with_posts([Err(PublishError::AuthExpired("token revoked".to_string()))]);
    let h = Harness::new(publisher);
    let id = h.add_post("1", UNLIMITED);

    let outcome = h.pipeline.worker().process(&id).await;
    assert!(matches!(outcome, Outcome::AuthFailure { recovered: true, .. }));

    h.pipeline
        .schedule(&id, h.clock().now() + ChronoDuration::seconds(1), 5)
        .await
        .unwrap();
    let requeued = h.repo.work_item(&id).unwrap();
    assert_eq!(requeued.status, WorkStatus::Queued);
    assert_eq!(requeued.last_error, None);

    let handle = h.pipeline.spawn();
    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.shutdown().await;

    let posts = h.publisher.posts();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].access_token, "old-token");
    assert_eq!(posts[1].access_token, "access-1");

    let item = h.repo.work_item(&id).unwrap();
    assert_eq!(item.status, WorkStatus::Published);
    assert_eq!(item.last_error, None);
    assert_eq!(item.retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_scheduling_a_published_item_does_not_publish_twice() {
    let h = Harness::new(ScriptedPublisher::new());
    let id = h.add_post("1", UNLIMITED);
    assert!(h.pipeline.worker().process(&id).await.is_success());

    h.pipeline
        .schedule(&id, h.clock().now() + ChronoDuration::seconds(1), 5)
        .await
        .unwrap();
    assert_eq!(h.repo.work_item(&id).unwrap().status, WorkStatus::Published);

    let handle = h.pipeline.spawn();
    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.shutdown().await;

    assert_eq!(h.publisher.posts().len(), 1);
    assert_eq!(h.pipeline.metrics().snapshot().publish_skipped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_expired_token_is_refreshed_before_posting() {
    let h = Harness::new(ScriptedPublisher::new());
    let mut credential = Credential::new("old-token", Some("refresh-0".to_string()));
    credential.expires_at = Some(h.clock().now() - ChronoDuration::minutes(1));
    h.repo.insert_credential(ACCOUNT, credential);
    let id = h.add_post("1", UNLIMITED);

    let outcome = h.pipeline.worker().process(&id).await;

    assert!(outcome.is_success());
    assert_eq!(h.publisher.refreshes(), vec!["refresh-0".to_string()]);
    let posts = h.publisher.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].access_token, "access-1");

    let stored = h.repo.credential(ACCOUNT).unwrap();
    assert!(!stored.is_expired_at(h.clock().now()));
    assert_eq!(h.repo.work_item(&id).unwrap().status, WorkStatus::Published);
}

#[tokio::test(start_paused = true)]
async fn test_expired_token_without_refresh_token_fails_before_posting() {
    let h = Harness::new(ScriptedPublisher::new());
    let mut credential = Credential::new("old-token", None);
    credential.expires_at = Some(h.clock().now() - ChronoDuration::minutes(1));
    h.repo.insert_credential(ACCOUNT, credential);
    let id = h.add_post("1", UNLIMITED);

    let outcome = h.pipeline.worker().process(&id).await;

    assert!(matches!(outcome, Outcome::AuthFailure { recovered: false, .. }));
    assert!(h.publisher.posts().is_empty());
    assert_eq!(h.media.resolved(), 0);
    assert!(h.repo.credential(ACCOUNT).unwrap().needs_manual_reauth);

    let item = h.repo.work_item(&id).unwrap();
    assert_eq!(item.status, WorkStatus::Failed);
    assert!(item.last_error.unwrap().contains("manual reauthorization"));
}

#[tokio::test(start_paused = true)]
async fn test_auth_expiry_without_refresh_token_flags_account() {
    let publisher =
        ScriptedPublisher::new().with_posts([Err(PublishError::AuthExpired("expired".to_string()))]);
    let h = Harness::new(publisher);
    h.repo.insert_credential(ACCOUNT, Credential::new("old-token", None));
    let id = h.add_post("1", UNLIMITED);

    let outcome = h.pipeline.worker().process(&id).await;

    assert!(matches!(outcome, Outcome::AuthFailure { recovered: false, .. }));
    assert!(h.publisher.refreshes().is_empty());
    assert!(h.repo.credential(ACCOUNT).unwrap().needs_manual_reauth);

    let item = h.repo.work_item(&id).unwrap();
    assert_eq!(item.status, WorkStatus::Failed);
    assert!(item.last_error.unwrap().contains("manual reauthorization"));
}

#[tokio::test(start_paused = true)]
async fn test_flagged_account_fails_without_calling_platform() {
    let h = Harness::new(ScriptedPublisher::new());
    let mut credential = Credential::new("old-token", Some("refresh-0".to_string()));
    credential.mark_needs_manual_reauth();
    h.repo.insert_credential(ACCOUNT, credential);
    let id = h.add_post("1", UNLIMITED);

    let outcome = h.pipeline.worker().process(&id).await;

    assert!(matches!(outcome, Outcome::AuthFailure { recovered: false, .. }));
    assert!(h.publisher.posts().is_empty());
    assert_eq!(h.media.resolved(), 0);
    assert_eq!(h.repo.work_item(&id).unwrap().status, WorkStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_are_retried_until_success() {
    let publisher =
        ScriptedPublisher::new().with_posts([Err(unavailable()), Err(unavailable()), Err(unavailable())]);
    let h = Harness::new(publisher);
    let id = h.add_post("1", UNLIMITED);

    let outcome = h.pipeline.worker().process(&id).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.job_outcome(), JobOutcome::Completed);
    assert_eq!(h.publisher.posts().len(), 4);

    let item = h.repo.work_item(&id).unwrap();
    assert_eq!(item.status, WorkStatus::Published);
    assert_eq!(item.retry_count, 3);
    assert_eq!(item.last_error, None);

    let metrics = h.pipeline.metrics().snapshot();
    assert_eq!(metrics.retries, 3);
    assert_eq!(metrics.publish_attempts, 4);
    assert_eq!(metrics.publish_succeeded, 1);

    assert_eq!(h.media.resolved(), 1);
    assert_eq!(h.media.cleanups(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_fail_the_item() {
    let publisher = ScriptedPublisher::new().with_posts((0..5).map(|_| Err(unavailable())));
    let h = Harness::new(publisher);
    let id = h.add_post("1", UNLIMITED);

    let outcome = h.pipeline.worker().process(&id).await;

    assert!(matches!(outcome, Outcome::RetryableFailure(_)));
    assert_eq!(h.publisher.posts().len(), 5);

    let item = h.repo.work_item(&id).unwrap();
    assert_eq!(item.status, WorkStatus::Failed);
    assert_eq!(item.retry_count, 4);
    assert!(item.last_error.unwrap().contains("503"));
    assert_eq!(h.media.cleanups(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_error_is_not_retried() {
    let publisher =
        ScriptedPublisher::new().with_posts([Err(PublishError::BadRequest("text too long".to_string()))]);
    let h = Harness::new(publisher);
    let id = h.add_post("1", UNLIMITED);

    let outcome = h.pipeline.worker().process(&id).await;

    assert_eq!(
        outcome,
        Outcome::TerminalFailure("bad request: text too long".to_string())
    );
    assert_eq!(h.publisher.posts().len(), 1);
    assert_eq!(h.repo.work_item(&id).unwrap().status, WorkStatus::Failed);
    assert_eq!(h.media.cleanups(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_publishable_item_is_skipped() {
    let h = Harness::new(ScriptedPublisher::new());
    let id = h.add_post("1", UNLIMITED);
    h.repo.set_status(&id, WorkStatus::Published);

    let outcome = h.pipeline.worker().process(&id).await;

    assert!(matches!(outcome, Outcome::Skipped(_)));
    assert_eq!(outcome.job_outcome(), JobOutcome::Completed);
    assert!(h.publisher.posts().is_empty());
    assert_eq!(h.media.resolved(), 0);
    assert!(h.repo.status_history().is_empty());

    let missing = h
        .pipeline
        .worker()
        .process(&WorkItemId::for_post("gone"))
        .await;
    assert!(matches!(missing, Outcome::Skipped(_)));
}

#[tokio::test(start_paused = true)]
async fn test_media_failure_fails_before_posting() {
    let h = Harness::with_media(ScriptedPublisher::new(), CountingMediaResolver::failing());
    let id = h.add_post("1", UNLIMITED);

    let outcome = h.pipeline.worker().process(&id).await;

    assert!(matches!(outcome, Outcome::TerminalFailure(ref e) if e.contains("media")));
    assert!(h.publisher.posts().is_empty());
    assert_eq!(h.repo.work_item(&id).unwrap().status, WorkStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_delays_posts_past_capacity() {
    let h = Harness::new(ScriptedPublisher::new());
    let ids: Vec<_> = (1..=3)
        .map(|i| h.add_post(&i.to_string(), LIMITED))
        .collect();
    let worker = h.pipeline.worker();

    let outcomes = futures::future::join_all(ids.iter().map(|id| worker.process(id))).await;
    assert!(outcomes.iter().all(Outcome::is_success));

    let mut times: Vec<_> = h.publisher.posts().iter().map(|call| call.at).collect();
    times.sort();
    assert_eq!(times.len(), 3);
    assert_eq!(times[0], times[1]);
    assert!(times[2].duration_since(times[0]) >= Duration::from_secs(60));

    assert!(h.pipeline.metrics().snapshot().rate_limit_waits >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_job_fails_running_item() {
    let h = Harness::new(ScriptedPublisher::new());
    let id = h.add_post("1", UNLIMITED);
    h.repo.set_status(&id, WorkStatus::Running);
    let job = ScheduledJob::delayed(ScheduleId::new("stalled-1"), id.clone(), 0, 5, 0);

    h.pipeline.worker().abandon(&job).await;

    let item = h.repo.work_item(&id).unwrap();
    assert_eq!(item.status, WorkStatus::Failed);
    assert_eq!(item.last_error.as_deref(), Some(STALLED_ERROR));

    // Terminal items are left alone.
    h.repo.set_status(&id, WorkStatus::Published);
    h.pipeline.worker().abandon(&job).await;
    assert_eq!(h.repo.work_item(&id).unwrap().status, WorkStatus::Published);
}

#[tokio::test(start_paused = true)]
async fn test_queue_counts_serialize_camel_case() {
    let h = Harness::new(ScriptedPublisher::new());
    let id = h.add_post("1", UNLIMITED);
    h.pipeline
        .scheduler()
        .schedule(&id, h.clock().now() + ChronoDuration::minutes(1), 5)
        .await
        .unwrap();

    let counts = h.pipeline.scheduler().metrics().await.unwrap();
    let json = serde_json::to_value(counts).unwrap();
    assert_eq!(json["delayed"], 1);
    assert_eq!(json["waiting"], 0);
    assert_eq!(json["active"], 0);
}

#[tokio::test]
async fn test_downloaded_media_is_removed_after_publish() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/media/a.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0_u8; 64]))
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempfile::tempdir().unwrap();
    let resolver = HttpMediaResolver::new(&MediaConfig {
        temp_dir: temp.path().to_path_buf(),
        fetch_timeout_secs: 5,
    })
    .unwrap();

    let repo = MemoryRepository::new();
    repo.insert_credential(ACCOUNT, Credential::new("token", None));
    let publisher = ScriptedPublisher::new();
    let pipeline = build_pipeline(&repo, &publisher, Arc::new(resolver));

    let id = WorkItemId::for_post("media");
    repo.insert_work(
        WorkItem::queued(id.clone(), "posts/media", pipeline.scheduler().clock().now()),
        payload(UNLIMITED, vec![MediaRef::Url(format!("{}/media/a.png", server.uri()))]),
    );

    let outcome = pipeline.worker().process(&id).await;
    assert!(outcome.is_success());

    let posts = publisher.posts();
    assert_eq!(posts.len(), 1);
    let media = &posts[0].content.media;
    assert_eq!(media.len(), 1);
    assert!(media[0].starts_with(temp.path()));
    assert!(!media[0].exists());
}
