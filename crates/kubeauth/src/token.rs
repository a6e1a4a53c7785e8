//! Cached credential state for providers whose credentials expire.

use std::future::Future;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::credential::Credential;
use crate::error::Result;

/// The current credential of a stateful provider and when it stops being
/// usable. `expires_at: None` means no expiry is known and the credential
/// is kept until invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenState {
    pub credential: Credential,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenState {
    pub fn new(credential: Credential, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            credential,
            expires_at,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// Single-flight cache around a [`TokenState`].
///
/// Readers take the fast path through the `RwLock`. Callers that find the
/// state missing or expired queue on `refresh`; the first one refreshes and
/// the rest re-check the state once they get the lock, so they reuse its
/// result instead of refreshing again.
pub(crate) struct TokenCache {
    state: RwLock<Option<TokenState>>,
    refresh: Mutex<()>,
}

impl TokenCache {
    pub(crate) fn empty() -> Self {
        Self {
            state: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    pub(crate) fn seeded(state: TokenState) -> Self {
        Self {
            state: RwLock::new(Some(state)),
            refresh: Mutex::new(()),
        }
    }

    /// The cached credential, if still valid.
    pub(crate) fn current(&self) -> Option<Credential> {
        let now = Utc::now();
        self.state
            .read()
            .as_ref()
            .filter(|state| state.is_valid_at(now))
            .map(|state| state.credential.clone())
    }

    pub(crate) fn snapshot(&self) -> Option<TokenState> {
        self.state.read().clone()
    }

    pub(crate) fn invalidate(&self) {
        *self.state.write() = None;
    }

    pub(crate) async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<Credential>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TokenState>>,
    {
        if let Some(credential) = self.current() {
            return Ok(credential);
        }

        let _guard = self.refresh.lock().await;
        if let Some(credential) = self.current() {
            return Ok(credential);
        }

        let state = refresh().await?;
        let credential = state.credential.clone();
        *self.state.write() = Some(state);
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::TimeDelta;

    use super::*;
    use crate::error::Error;

    fn bearer(token: &str) -> Credential {
        Credential::bearer(token)
    }

    #[test]
    fn state_without_expiry_stays_valid() {
        let state = TokenState::new(bearer("t"), None);
        assert!(state.is_valid_at(Utc::now() + TimeDelta::days(3650)));
    }

    #[test]
    fn expiry_is_exclusive() {
        let now = Utc::now();
        let state = TokenState::new(bearer("t"), Some(now));
        assert!(!state.is_valid_at(now));
        assert!(state.is_valid_at(now - TimeDelta::seconds(1)));
    }

    #[tokio::test]
    async fn valid_state_is_returned_without_refreshing() {
        let cache = TokenCache::seeded(TokenState::new(
            bearer("cached"),
            Some(Utc::now() + TimeDelta::hours(1)),
        ));
        let credential = cache
            .get_or_refresh(|| async { Err(Error::refresh("refresh must not run")) })
            .await
            .expect("cached credential");
        assert_eq!(credential, bearer("cached"));
    }

    #[tokio::test]
    async fn expired_state_is_refreshed_and_stored() {
        let cache = TokenCache::seeded(TokenState::new(
            bearer("old"),
            Some(Utc::now() - TimeDelta::minutes(1)),
        ));
        let credential = cache
            .get_or_refresh(|| async { Ok(TokenState::new(bearer("new"), None)) })
            .await
            .expect("refreshed");
        assert_eq!(credential, bearer("new"));
        assert_eq!(cache.current(), Some(bearer("new")));
    }

    #[tokio::test]
    async fn failed_refresh_leaves_state_untouched() {
        let cache = TokenCache::empty();
        let err = cache
            .get_or_refresh(|| async { Err(Error::refresh("boom")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CredentialRefresh(_)));
        assert!(cache.snapshot().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_refresh() {
        let cache = Arc::new(TokenCache::empty());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_refresh(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(TokenState::new(bearer("shared"), None))
                    })
                    .await
            }));
        }

        for handle in handles {
            let credential = handle.await.expect("join").expect("credential");
            assert_eq!(credential, bearer("shared"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_the_next_refresh() {
        let cache = TokenCache::seeded(TokenState::new(bearer("a"), None));
        cache.invalidate();
        let credential = cache
            .get_or_refresh(|| async { Ok(TokenState::new(bearer("b"), None)) })
            .await
            .expect("refreshed");
        assert_eq!(credential, bearer("b"));
    }
}
