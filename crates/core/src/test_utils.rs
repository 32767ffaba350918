//! In-memory doubles for the external boundaries.
//!
//! Enabled with the `test-utils` feature. These back the pipeline tests and
//! are handy for embedding the pipeline in other crates' tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cadence_common::{AppError, AppResult};

use crate::media::{MediaResolver, ResolvedMedia};
use crate::model::{
    Credential, MediaRef, NewCredentials, PostContent, PublishPayload, PublishedPost,
    StatusDetail, WorkItem, WorkItemId, WorkStatus,
};
use crate::publisher::{PublishError, Publisher, RefreshError};
use crate::repository::{CredentialRepository, WorkItemRepository};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct RepositoryState {
    items: HashMap<WorkItemId, WorkItem>,
    payloads: HashMap<String, PublishPayload>,
    credentials: HashMap<String, Credential>,
    status_history: Vec<(WorkItemId, WorkStatus)>,
}

/// Work item and credential repository held in memory.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    state: Arc<Mutex<RepositoryState>>,
}

impl MemoryRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a work item and the payload it references.
    pub fn insert_work(&self, item: WorkItem, payload: PublishPayload) {
        let mut state = lock(&self.state);
        state.payloads.insert(item.payload_ref.clone(), payload);
        state.items.insert(item.id.clone(), item);
    }

    /// Insert or replace a credential.
    pub fn insert_credential(&self, account_id: &str, credential: Credential) {
        lock(&self.state)
            .credentials
            .insert(account_id.to_string(), credential);
    }

    /// Overwrite a work item's status, as the application would on cancel.
    pub fn set_status(&self, id: &WorkItemId, status: WorkStatus) {
        if let Some(item) = lock(&self.state).items.get_mut(id) {
            item.status = status;
        }
    }

    /// Current copy of a work item.
    #[must_use]
    pub fn work_item(&self, id: &WorkItemId) -> Option<WorkItem> {
        lock(&self.state).items.get(id).cloned()
    }

    /// Current copy of a credential.
    #[must_use]
    pub fn credential(&self, account_id: &str) -> Option<Credential> {
        lock(&self.state).credentials.get(account_id).cloned()
    }

    /// Every status written through the repository, in order.
    #[must_use]
    pub fn status_history(&self) -> Vec<(WorkItemId, WorkStatus)> {
        lock(&self.state).status_history.clone()
    }
}

#[async_trait]
impl WorkItemRepository for MemoryRepository {
    async fn load_work_item(&self, id: &WorkItemId) -> AppResult<Option<WorkItem>> {
        Ok(lock(&self.state).items.get(id).cloned())
    }

    async fn load_payload(&self, item: &WorkItem) -> AppResult<Option<PublishPayload>> {
        Ok(lock(&self.state).payloads.get(&item.payload_ref).cloned())
    }

    async fn update_work_item_status(
        &self,
        id: &WorkItemId,
        status: WorkStatus,
        detail: StatusDetail,
    ) -> AppResult<()> {
        let mut state = lock(&self.state);
        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("work item {id}")))?;

        item.status = status;
        if detail.external_id.is_some() {
            item.external_id = detail.external_id;
        }
        if detail.url.is_some() {
            item.url = detail.url;
        }
        if detail.last_error.is_some()
            || matches!(status, WorkStatus::Queued | WorkStatus::Published)
        {
            item.last_error = detail.last_error;
        }
        if let Some(retry_count) = detail.retry_count {
            item.retry_count = retry_count;
        }
        state.status_history.push((id.clone(), status));
        Ok(())
    }
}

#[async_trait]
impl CredentialRepository for MemoryRepository {
    async fn load_credential(&self, account_id: &str) -> AppResult<Option<Credential>> {
        Ok(lock(&self.state).credentials.get(account_id).cloned())
    }

    async fn save_credential(&self, account_id: &str, credential: &Credential) -> AppResult<()> {
        lock(&self.state)
            .credentials
            .insert(account_id.to_string(), credential.clone());
        Ok(())
    }
}

/// A recorded call to [`ScriptedPublisher::post`].
#[derive(Debug, Clone)]
pub struct PostCall {
    /// Target account.
    pub account_id: String,
    /// Token presented with the call.
    pub access_token: String,
    /// Content as handed to the publisher.
    pub content: PostContent,
    /// When the call was made.
    pub at: tokio::time::Instant,
}

#[derive(Default)]
struct PublisherState {
    post_script: VecDeque<Result<PublishedPost, PublishError>>,
    refresh_script: VecDeque<Result<NewCredentials, RefreshError>>,
    posts: Vec<PostCall>,
    refreshes: Vec<String>,
}

/// Publisher that replays scripted results and records every call.
///
/// Once the post script runs dry every call succeeds with a generated id.
#[derive(Clone, Default)]
pub struct ScriptedPublisher {
    state: Arc<Mutex<PublisherState>>,
}

impl ScriptedPublisher {
    /// Create a publisher that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue results for upcoming `post` calls.
    #[must_use]
    pub fn with_posts(
        self,
        results: impl IntoIterator<Item = Result<PublishedPost, PublishError>>,
    ) -> Self {
        lock(&self.state).post_script.extend(results);
        self
    }

    /// Queue results for upcoming `refresh_token` calls.
    #[must_use]
    pub fn with_refreshes(
        self,
        results: impl IntoIterator<Item = Result<NewCredentials, RefreshError>>,
    ) -> Self {
        lock(&self.state).refresh_script.extend(results);
        self
    }

    /// Recorded post calls.
    #[must_use]
    pub fn posts(&self) -> Vec<PostCall> {
        lock(&self.state).posts.clone()
    }

    /// Refresh tokens presented so far.
    #[must_use]
    pub fn refreshes(&self) -> Vec<String> {
        lock(&self.state).refreshes.clone()
    }
}

#[async_trait]
impl Publisher for ScriptedPublisher {
    async fn post(
        &self,
        account_id: &str,
        access_token: &str,
        content: &PostContent,
    ) -> Result<PublishedPost, PublishError> {
        let mut state = lock(&self.state);
        state.posts.push(PostCall {
            account_id: account_id.to_string(),
            access_token: access_token.to_string(),
            content: content.clone(),
            at: tokio::time::Instant::now(),
        });
        let n = state.posts.len();
        state.post_script.pop_front().unwrap_or_else(|| {
            Ok(PublishedPost {
                external_id: format!("ext-{n}"),
                url: format!("https://social.example/{account_id}/{n}"),
            })
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<NewCredentials, RefreshError> {
        let mut state = lock(&self.state);
        state.refreshes.push(refresh_token.to_string());
        let n = state.refreshes.len();
        state.refresh_script.pop_front().unwrap_or_else(|| {
            Ok(NewCredentials {
                access_token: format!("access-{n}"),
                refresh_token: Some(format!("refresh-{n}")),
                expires_in: Some(std::time::Duration::from_secs(3600)),
            })
        })
    }
}

/// Media resolver that maps every reference to a fake path and counts
/// resolutions and cleanups.
#[derive(Clone, Default)]
pub struct CountingMediaResolver {
    resolved: Arc<AtomicUsize>,
    cleanups: Arc<AtomicUsize>,
    fail: bool,
}

impl CountingMediaResolver {
    /// Create a resolver that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a resolver whose every resolution fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Number of successful resolutions.
    #[must_use]
    pub fn resolved(&self) -> usize {
        self.resolved.load(Ordering::SeqCst)
    }

    /// Number of cleanup invocations.
    #[must_use]
    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaResolver for CountingMediaResolver {
    async fn resolve(&self, media: &[MediaRef], owner_id: &str) -> AppResult<ResolvedMedia> {
        if self.fail {
            return Err(AppError::ExternalService("media storage offline".to_string()));
        }
        self.resolved.fetch_add(1, Ordering::SeqCst);

        let paths = media
            .iter()
            .enumerate()
            .map(|(i, reference)| match reference {
                MediaRef::Path(path) => path.clone(),
                MediaRef::Url(_) => PathBuf::from(format!("/tmp/{owner_id}/{i}")),
            })
            .collect();
        let cleanups = self.cleanups.clone();
        Ok(ResolvedMedia::new(paths, move || {
            cleanups.fetch_add(1, Ordering::SeqCst);
        }))
    }
}
