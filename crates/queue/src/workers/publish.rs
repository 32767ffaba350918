//! Publish worker.
//!
//! Runs one claimed work item: load, resolve media, post with retries, then
//! persist the outcome. Each claim is executed at most once; failures are
//! recorded on the work item and never re-enqueued.

use std::sync::Arc;

use async_trait::async_trait;
use cadence_common::{PipelineMetrics, Timer};
use cadence_core::{
    Credential, CredentialRepository, MediaResolver, PostContent, PublishError, PublishedPost,
    Publisher, PublisherRegistry, StatusDetail, WorkItem, WorkItemId, WorkItemRepository,
    WorkStatus,
};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::credentials::{CredentialRefresher, RefreshOutcome};
use crate::jobs::{JobOutcome, ScheduledJob};
use crate::pool::JobHandler;
use crate::rate_limit::{PlatformRateLimiter, RateLimitKey};
use crate::retry::{Retrier, RetryPolicy, Retryable};
use crate::store::STALLED_ERROR;

/// How one execution of a work item ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Published; the work item is `PUBLISHED`.
    Success(PublishedPost),
    /// Nothing to do, e.g. the work item was cancelled after it was claimed.
    Skipped(String),
    /// Retryable errors persisted through every attempt.
    RetryableFailure(String),
    /// A non-retryable error.
    TerminalFailure(String),
    /// The platform rejected the credentials, or the account is flagged for
    /// manual reauthorization.
    AuthFailure {
        /// Error recorded on the work item.
        error: String,
        /// Whether usable credentials are now stored.
        recovered: bool,
    },
}

impl Outcome {
    /// Whether the post was published.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Queue-level result of this outcome.
    #[must_use]
    pub fn job_outcome(&self) -> JobOutcome {
        match self {
            Self::Success(_) | Self::Skipped(_) => JobOutcome::Completed,
            Self::RetryableFailure(error)
            | Self::TerminalFailure(error)
            | Self::AuthFailure { error, .. } => JobOutcome::Failed(error.clone()),
        }
    }
}

/// External collaborators of the publish worker.
#[derive(Clone)]
pub struct WorkerContext {
    /// Work item and payload storage.
    pub work_items: Arc<dyn WorkItemRepository>,
    /// Credential storage.
    pub credentials: Arc<dyn CredentialRepository>,
    /// Platform publishers.
    pub publishers: PublisherRegistry,
    /// Media materialisation.
    pub media: Arc<dyn MediaResolver>,
}

/// Executes claimed publish jobs.
pub struct PublishWorker {
    context: WorkerContext,
    refresher: CredentialRefresher,
    limiter: Arc<PlatformRateLimiter>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    metrics: Arc<PipelineMetrics>,
}

impl PublishWorker {
    /// Create a worker.
    #[must_use]
    pub fn new(
        context: WorkerContext,
        limiter: Arc<PlatformRateLimiter>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let refresher =
            CredentialRefresher::new(context.credentials.clone(), clock.clone(), metrics.clone());
        Self {
            context,
            refresher,
            limiter,
            policy,
            clock,
            metrics,
        }
    }

    /// Publish one work item and persist the result.
    pub async fn process(&self, work_item_id: &WorkItemId) -> Outcome {
        let item = match self.context.work_items.load_work_item(work_item_id).await {
            Ok(Some(item)) => item,
            Ok(None) => return self.skip(work_item_id, "work item no longer exists".to_string()),
            Err(e) => {
                error!(work_item_id = %work_item_id, error = %e, "Failed to load work item");
                PipelineMetrics::incr(&self.metrics.publish_failed);
                return Outcome::TerminalFailure(format!("failed to load work item: {e}"));
            }
        };

        if !item.is_publishable() {
            return self.skip(work_item_id, format!("work item is {}", item.status));
        }

        let payload = match self.context.work_items.load_payload(&item).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                let outcome = Outcome::TerminalFailure(format!(
                    "payload {} not found",
                    item.payload_ref
                ));
                return self.fail(&item, 0, outcome).await;
            }
            Err(e) => {
                let outcome = Outcome::TerminalFailure(format!("failed to load payload: {e}"));
                return self.fail(&item, 0, outcome).await;
            }
        };

        let Some(publisher) = self.context.publishers.get(&payload.platform) else {
            let outcome = Outcome::TerminalFailure(format!(
                "no publisher registered for platform {}",
                payload.platform
            ));
            return self.fail(&item, 0, outcome).await;
        };

        let credential = match self
            .context
            .credentials
            .load_credential(&payload.account_id)
            .await
        {
            Ok(Some(credential)) if credential.needs_manual_reauth => {
                let outcome = Outcome::AuthFailure {
                    error: "account requires manual reauthorization".to_string(),
                    recovered: false,
                };
                return self.fail(&item, 0, outcome).await;
            }
            Ok(Some(credential)) => credential,
            Ok(None) => {
                let outcome = Outcome::AuthFailure {
                    error: "no credential stored for account; reauthorization required"
                        .to_string(),
                    recovered: false,
                };
                return self.fail(&item, 0, outcome).await;
            }
            Err(e) => {
                let outcome = Outcome::TerminalFailure(format!("failed to load credential: {e}"));
                return self.fail(&item, 0, outcome).await;
            }
        };

        let credential = if credential.is_expired_at(self.clock.now()) {
            match self
                .refresh_expired(&payload.account_id, publisher.as_ref(), &credential)
                .await
            {
                Ok(credential) => credential,
                Err(outcome) => return self.fail(&item, 0, outcome).await,
            }
        } else {
            credential
        };

        if let Err(e) = self
            .context
            .work_items
            .update_work_item_status(work_item_id, WorkStatus::Running, StatusDetail::default())
            .await
        {
            warn!(work_item_id = %work_item_id, error = %e, "Failed to mark work item running");
        }

        let media = match self
            .context
            .media
            .resolve(&payload.media, &payload.owner_id)
            .await
        {
            Ok(media) => media,
            Err(e) => {
                let outcome = Outcome::TerminalFailure(format!("media resolution failed: {e}"));
                return self.fail(&item, 0, outcome).await;
            }
        };

        let content = PostContent {
            text: payload.text.clone(),
            media: media.paths().to_vec(),
        };

        let mut retries = 0;
        let result = {
            let publisher = publisher.as_ref();
            let account = payload.account_id.as_str();
            let token = credential.access_token.as_str();
            let content = &content;
            let metrics = &self.metrics;

            Retrier::new(self.policy)
                .pace_with(
                    &self.limiter,
                    RateLimitKey::post(&payload.platform, &payload.account_id),
                )
                .on_retry(|attempt, err: &PublishError| {
                    retries = attempt;
                    PipelineMetrics::incr(&metrics.retries);
                    warn!(
                        work_item_id = %work_item_id,
                        platform = %payload.platform,
                        attempt,
                        error = %err,
                        "Retrying publish"
                    );
                })
                .run(move || async move {
                    let timer = Timer::start();
                    let result = publisher.post(account, token, content).await;
                    metrics.record_publish_attempt(timer.elapsed());
                    result
                })
                .await
        };
        media.release();

        match result {
            Ok(post) => {
                if let Err(e) = self
                    .context
                    .work_items
                    .update_work_item_status(
                        work_item_id,
                        WorkStatus::Published,
                        StatusDetail::published(&post, retries),
                    )
                    .await
                {
                    error!(
                        work_item_id = %work_item_id,
                        external_id = %post.external_id,
                        error = %e,
                        "Published but failed to persist status"
                    );
                }
                PipelineMetrics::incr(&self.metrics.publish_succeeded);
                info!(
                    work_item_id = %work_item_id,
                    platform = %payload.platform,
                    external_id = %post.external_id,
                    retries,
                    "Published work item"
                );
                Outcome::Success(post)
            }
            Err(e) if e.is_auth() => {
                let recovered = match self
                    .refresher
                    .recover(&payload.account_id, publisher.as_ref(), &credential.access_token)
                    .await
                {
                    Ok(RefreshOutcome::Refreshed | RefreshOutcome::AlreadyRefreshed) => true,
                    Ok(RefreshOutcome::ManualReauthRequired(reason)) => {
                        warn!(
                            work_item_id = %work_item_id,
                            account_id = %payload.account_id,
                            reason = %reason,
                            "Credential recovery impossible"
                        );
                        false
                    }
                    Err(err) => {
                        error!(
                            work_item_id = %work_item_id,
                            account_id = %payload.account_id,
                            error = %err,
                            "Credential recovery failed"
                        );
                        false
                    }
                };
                let error = if recovered {
                    format!("{e}; credentials refreshed, schedule the post again to publish")
                } else {
                    format!("{e}; account requires manual reauthorization")
                };
                self.fail(&item, retries, Outcome::AuthFailure { error, recovered })
                    .await
            }
            Err(e) if e.is_retryable() => {
                self.fail(&item, retries, Outcome::RetryableFailure(e.to_string()))
                    .await
            }
            Err(e) => {
                self.fail(&item, retries, Outcome::TerminalFailure(e.to_string()))
                    .await
            }
        }
    }

    /// Refresh a token that is already past its expiry instead of spending a
    /// post attempt on it.
    async fn refresh_expired(
        &self,
        account_id: &str,
        publisher: &dyn Publisher,
        credential: &Credential,
    ) -> Result<Credential, Outcome> {
        info!(account_id = %account_id, "Access token expired, refreshing before publish");
        let reason = match self
            .refresher
            .recover(account_id, publisher, &credential.access_token)
            .await
        {
            Ok(RefreshOutcome::Refreshed | RefreshOutcome::AlreadyRefreshed) => {
                match self.context.credentials.load_credential(account_id).await {
                    Ok(Some(refreshed)) => return Ok(refreshed),
                    Ok(None) => "credential disappeared after refresh".to_string(),
                    Err(e) => format!("failed to reload credential: {e}"),
                }
            }
            Ok(RefreshOutcome::ManualReauthRequired(reason)) => reason,
            Err(e) => format!("credential recovery failed: {e}"),
        };
        Err(Outcome::AuthFailure {
            error: format!("access token expired ({reason}); account requires manual reauthorization"),
            recovered: false,
        })
    }

    fn skip(&self, work_item_id: &WorkItemId, reason: String) -> Outcome {
        PipelineMetrics::incr(&self.metrics.publish_skipped);
        info!(work_item_id = %work_item_id, reason = %reason, "Skipped work item");
        Outcome::Skipped(reason)
    }

    async fn fail(&self, item: &WorkItem, retries: u32, outcome: Outcome) -> Outcome {
        let JobOutcome::Failed(message) = outcome.job_outcome() else {
            return outcome;
        };

        PipelineMetrics::incr(&self.metrics.publish_failed);
        error!(work_item_id = %item.id, retries, error = %message, "Work item failed");

        if let Err(e) = self
            .context
            .work_items
            .update_work_item_status(
                &item.id,
                WorkStatus::Failed,
                StatusDetail::failed(message, retries),
            )
            .await
        {
            error!(work_item_id = %item.id, error = %e, "Failed to persist failure");
        }
        outcome
    }
}

#[async_trait]
impl JobHandler for PublishWorker {
    async fn execute(&self, job: &ScheduledJob) -> JobOutcome {
        self.process(&job.work_item_id).await.job_outcome()
    }

    async fn abandon(&self, job: &ScheduledJob) {
        let item = match self.context.work_items.load_work_item(&job.work_item_id).await {
            Ok(Some(item)) if !item.status.is_terminal() => item,
            Ok(_) => return,
            Err(e) => {
                error!(work_item_id = %job.work_item_id, error = %e, "Failed to load stalled work item");
                return;
            }
        };
        self.fail(&item, item.retry_count, Outcome::TerminalFailure(STALLED_ERROR.to_string()))
            .await;
    }
}
