//! Persistence boundary.
//!
//! The surrounding application owns the database; the pipeline reads and
//! updates records through these traits and treats each call as durable.

use async_trait::async_trait;
use cadence_common::AppResult;

use crate::model::{Credential, PublishPayload, StatusDetail, WorkItem, WorkItemId, WorkStatus};

/// Work item persistence.
#[async_trait]
pub trait WorkItemRepository: Send + Sync {
    /// Load a work item by id.
    async fn load_work_item(&self, id: &WorkItemId) -> AppResult<Option<WorkItem>>;

    /// Load the business record a work item points at.
    async fn load_payload(&self, item: &WorkItem) -> AppResult<Option<PublishPayload>>;

    /// Persist a status change together with its detail.
    ///
    /// `None` fields leave the stored value unchanged, except that `QUEUED`
    /// and `PUBLISHED` always clear `last_error`.
    async fn update_work_item_status(
        &self,
        id: &WorkItemId,
        status: WorkStatus,
        detail: StatusDetail,
    ) -> AppResult<()>;
}

/// Credential persistence, keyed by account id.
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    /// Load the stored credential for an account.
    async fn load_credential(&self, account_id: &str) -> AppResult<Option<Credential>>;

    /// Replace the stored credential for an account.
    async fn save_credential(&self, account_id: &str, credential: &Credential) -> AppResult<()>;
}
