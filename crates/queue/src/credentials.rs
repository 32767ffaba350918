//! Recovery from authentication failures.
//!
//! Exchanges an account's refresh token for new credentials. Refreshes for
//! one account are serialised so concurrent failures trigger a single
//! platform call.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_common::{AppResult, PipelineMetrics};
use cadence_core::{CredentialRepository, Publisher, RefreshError};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clock::Clock;

/// Result of a recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New credentials were obtained and stored.
    Refreshed,
    /// Another worker replaced the failing token while this one waited.
    AlreadyRefreshed,
    /// No automatic recovery is possible; the account is flagged.
    ManualReauthRequired(String),
}

impl RefreshOutcome {
    /// Whether usable credentials are now stored.
    #[must_use]
    pub const fn is_recovered(&self) -> bool {
        matches!(self, Self::Refreshed | Self::AlreadyRefreshed)
    }
}

/// Coordinates token refreshes per account.
pub struct CredentialRefresher {
    credentials: Arc<dyn CredentialRepository>,
    clock: Arc<dyn Clock>,
    metrics: Arc<PipelineMetrics>,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialRefresher {
    /// Create a refresher over the credential store.
    #[must_use]
    pub fn new(
        credentials: Arc<dyn CredentialRepository>,
        clock: Arc<dyn Clock>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            credentials,
            clock,
            metrics,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Recover `account_id` after `publisher` rejected `failed_token`.
    ///
    /// Flags the account for manual reauthorization when there is no refresh
    /// token or the platform rejects it.
    pub async fn recover(
        &self,
        account_id: &str,
        publisher: &dyn Publisher,
        failed_token: &str,
    ) -> AppResult<RefreshOutcome> {
        let lock = self
            .in_flight
            .lock()
            .await
            .entry(account_id.to_string())
            .or_default()
            .clone();

        let outcome = {
            let _guard = lock.lock().await;
            self.recover_locked(account_id, publisher, failed_token).await
        };

        let mut in_flight = self.in_flight.lock().await;
        if Arc::strong_count(&lock) == 2 {
            in_flight.remove(account_id);
        }
        outcome
    }

    async fn recover_locked(
        &self,
        account_id: &str,
        publisher: &dyn Publisher,
        failed_token: &str,
    ) -> AppResult<RefreshOutcome> {
        let Some(mut credential) = self.credentials.load_credential(account_id).await? else {
            warn!(account_id = %account_id, "No credential stored for account");
            return Ok(RefreshOutcome::ManualReauthRequired(
                "no credential stored for account".to_string(),
            ));
        };

        if credential.needs_manual_reauth {
            return Ok(RefreshOutcome::ManualReauthRequired(
                "account requires manual reauthorization".to_string(),
            ));
        }
        if credential.access_token != failed_token {
            info!(account_id = %account_id, "Credential already refreshed by another worker");
            return Ok(RefreshOutcome::AlreadyRefreshed);
        }

        let result = match credential.refresh_token.as_deref() {
            Some(refresh_token) => publisher.refresh_token(refresh_token).await,
            None => Err(RefreshError::NoRefreshToken),
        };

        match result {
            Ok(refreshed) => {
                credential.apply_refresh(refreshed, self.clock.now());
                self.credentials
                    .save_credential(account_id, &credential)
                    .await?;
                self.metrics.record_refresh(true);
                info!(
                    account_id = %account_id,
                    expires_at = ?credential.expires_at,
                    "Refreshed access token"
                );
                Ok(RefreshOutcome::Refreshed)
            }
            Err(e) => {
                credential.mark_needs_manual_reauth();
                self.credentials
                    .save_credential(account_id, &credential)
                    .await?;
                self.metrics.record_refresh(false);
                warn!(
                    account_id = %account_id,
                    error = %e,
                    "Token refresh failed, account needs manual reauthorization"
                );
                Ok(RefreshOutcome::ManualReauthRequired(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use cadence_core::Credential;
    use cadence_core::test_utils::{MemoryRepository, ScriptedPublisher};
    use chrono::Duration;

    const NOW_MS: i64 = 1_700_000_000_000;

    fn refresher(repo: &MemoryRepository) -> (CredentialRefresher, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW_MS));
        let refresher = CredentialRefresher::new(
            Arc::new(repo.clone()),
            clock.clone(),
            Arc::new(PipelineMetrics::new()),
        );
        (refresher, clock)
    }

    #[tokio::test]
    async fn test_successful_refresh_persists_credentials() {
        let repo = MemoryRepository::new();
        repo.insert_credential("acct", Credential::new("stale", Some("r-1".to_string())));
        let publisher = ScriptedPublisher::new();
        let (refresher, clock) = refresher(&repo);

        let outcome = refresher.recover("acct", &publisher, "stale").await.unwrap();

        assert_eq!(outcome, RefreshOutcome::Refreshed);
        assert_eq!(publisher.refreshes(), vec!["r-1"]);
        let stored = repo.credential("acct").unwrap();
        assert_eq!(stored.access_token, "access-1");
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(stored.expires_at, Some(clock.now() + Duration::hours(1)));
        assert!(!stored.needs_manual_reauth);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_flags_account() {
        let repo = MemoryRepository::new();
        repo.insert_credential("acct", Credential::new("stale", None));
        let publisher = ScriptedPublisher::new();
        let (refresher, _) = refresher(&repo);

        let outcome = refresher.recover("acct", &publisher, "stale").await.unwrap();

        assert!(matches!(outcome, RefreshOutcome::ManualReauthRequired(_)));
        assert!(publisher.refreshes().is_empty());
        assert!(repo.credential("acct").unwrap().needs_manual_reauth);
    }

    #[tokio::test]
    async fn test_rejected_refresh_flags_account() {
        let repo = MemoryRepository::new();
        repo.insert_credential("acct", Credential::new("stale", Some("r-1".to_string())));
        let publisher = ScriptedPublisher::new()
            .with_refreshes([Err(RefreshError::RefreshFailed("invalid_grant".to_string()))]);
        let (refresher, _) = refresher(&repo);

        let outcome = refresher.recover("acct", &publisher, "stale").await.unwrap();

        assert_eq!(
            outcome,
            RefreshOutcome::ManualReauthRequired("token refresh failed: invalid_grant".to_string())
        );
        let stored = repo.credential("acct").unwrap();
        assert!(stored.needs_manual_reauth);
        assert_eq!(stored.access_token, "stale");
    }

    #[tokio::test]
    async fn test_concurrent_failures_refresh_once() {
        let repo = MemoryRepository::new();
        repo.insert_credential("acct", Credential::new("stale", Some("r-1".to_string())));
        let publisher = ScriptedPublisher::new();
        let (refresher, _) = refresher(&repo);

        let (a, b) = tokio::join!(
            refresher.recover("acct", &publisher, "stale"),
            refresher.recover("acct", &publisher, "stale"),
        );

        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, RefreshOutcome::AlreadyRefreshed));
        assert_eq!(
            outcomes,
            vec![RefreshOutcome::Refreshed, RefreshOutcome::AlreadyRefreshed]
        );
        assert_eq!(publisher.refreshes().len(), 1);
        assert!(refresher.in_flight.lock().await.is_empty());
    }
}
