//! Domain model and external boundaries for cadence.
//!
//! The publish pipeline in `cadence-queue` depends only on the traits defined
//! here; platform clients, the database and media storage are supplied by the
//! surrounding application.

pub mod media;
pub mod model;
pub mod publisher;
pub mod repository;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use media::{HttpMediaResolver, MediaResolver, ResolvedMedia};
pub use model::{
    Credential, MediaRef, NewCredentials, PostContent, PublishPayload, PublishedPost,
    StatusDetail, WorkItem, WorkItemId, WorkStatus,
};
pub use publisher::{PublishError, Publisher, PublisherRegistry, RefreshError};
pub use repository::{CredentialRepository, WorkItemRepository};
