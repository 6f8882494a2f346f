//! Single-flight credential refresh.
//!
//! Any number of callers may ask for a refresh at the same time; exactly one
//! refresh request goes out, and every caller receives its outcome. Callers
//! that arrive once an outcome is being delivered start a new cycle instead of
//! joining the finished one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::api::{ApiRequest, Transport};
use crate::events::SessionEvent;
use crate::models::auth::RefreshBody;
use crate::models::CredentialPair;

use super::CredentialStore;

/// Opaque access token handed to waiters
pub type AccessToken = String;

type Waiter = oneshot::Sender<Result<AccessToken, RefreshError>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh credential stored")]
    NoRefreshCredential,

    #[error("Refresh token rejected: {0}")]
    Rejected(String),

    #[error("Refresh request failed: {0}")]
    Failed(String),

    /// The session this refresh belonged to ended or was replaced meanwhile
    #[error("Session changed during refresh")]
    Superseded,
}

enum RefreshState {
    Idle,
    Refreshing { waiters: VecDeque<Waiter> },
}

struct Inner {
    transport: Arc<dyn Transport>,
    store: CredentialStore,
    refresh_path: String,
    events: broadcast::Sender<SessionEvent>,
    state: Mutex<RefreshState>,
    refresh_calls: AtomicU64,
}

/// Clone is cheap; clones coordinate through the same state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: CredentialStore,
        refresh_path: impl Into<String>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                refresh_path: refresh_path.into(),
                events,
                state: Mutex::new(RefreshState::Idle),
                refresh_calls: AtomicU64::new(0),
            }),
        }
    }

    pub fn refresh_path(&self) -> &str {
        &self.inner.refresh_path
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.inner.lock_state(), RefreshState::Refreshing { .. })
    }

    /// Number of refresh requests sent over the lifetime of this coordinator
    pub fn refresh_count(&self) -> u64 {
        self.inner.refresh_calls.load(Ordering::SeqCst)
    }

    /// Obtain a fresh access token, sharing an in-flight refresh if there is one.
    pub async fn request_refresh(&self) -> Result<AccessToken, RefreshError> {
        let (tx, rx) = oneshot::channel();

        let start_cycle = {
            let mut state = self.inner.lock_state();
            match &mut *state {
                RefreshState::Refreshing { waiters } => {
                    waiters.push_back(tx);
                    debug!(queued = waiters.len(), "Refresh in flight, queued waiter");
                    false
                }
                RefreshState::Idle => {
                    let mut waiters = VecDeque::new();
                    waiters.push_back(tx);
                    *state = RefreshState::Refreshing { waiters };
                    true
                }
            }
        };

        if start_cycle {
            // Runs detached so a dropped initiator cannot strand the queue
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let started_with = inner.store.refresh_token();
                let outcome = inner.perform_refresh(started_with.as_deref()).await;
                inner.finish(outcome, started_with.as_deref());
            });
        }

        rx.await.unwrap_or_else(|_| {
            Err(RefreshError::Failed("refresh task ended without a result".to_string()))
        })
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        // Never held across an await, so a poisoned lock still holds a consistent state
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn perform_refresh(&self, started_with: Option<&str>) -> Result<AccessToken, RefreshError> {
        let Some(refresh_token) = started_with else {
            return Err(RefreshError::NoRefreshCredential);
        };

        let request = ApiRequest::post(self.refresh_path.clone())
            .with_json(&RefreshBody { refresh_token })
            .map_err(|e| RefreshError::Failed(e.to_string()))?;

        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        debug!(path = %self.refresh_path, "Requesting credential refresh");

        let response = self
            .transport
            .execute(&request)
            .await
            .map_err(|e| RefreshError::Failed(e.to_string()))?;

        if response.is_unauthorized() || response.status == 403 {
            return Err(RefreshError::Rejected(format!("status {}", response.status)));
        }
        let pair: CredentialPair = response
            .error_for_status()
            .and_then(|r| r.json())
            .map_err(|e| RefreshError::Failed(e.to_string()))?;

        // Logout or a new login while in flight owns the store now
        let saved = self
            .store
            .replace_if_current(refresh_token, &pair)
            .map_err(|e| RefreshError::Failed(format!("Failed to store refreshed credentials: {}", e)))?;
        if !saved {
            return Err(RefreshError::Superseded);
        }

        Ok(pair.access_token)
    }

    /// Deliver the outcome to every waiter queued in this cycle.
    fn finish(&self, mut outcome: Result<AccessToken, RefreshError>, started_with: Option<&str>) {
        // Only the session this cycle started with may be torn down
        let invalidated = match outcome {
            Ok(_) => false,
            Err(ref error) if *error != RefreshError::Superseded && self.store.clear_if_current(started_with) => {
                warn!(error = %error, "Credential refresh failed, invalidating session");
                true
            }
            Err(ref error) => {
                info!(error = %error, "Refresh outcome belongs to an ended session, leaving store untouched");
                false
            }
        };
        if outcome.is_err() && !invalidated {
            outcome = Err(RefreshError::Superseded);
        }

        // Take the queue and go Idle in one step; later callers start a new cycle
        let waiters = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, RefreshState::Idle) {
                RefreshState::Refreshing { waiters } => waiters,
                RefreshState::Idle => VecDeque::new(),
            }
        };

        match outcome {
            Ok(ref _token) => info!(waiters = waiters.len(), "Credential refresh succeeded"),
            Err(ref error) if invalidated => {
                // No receivers just means nobody is listening yet
                let _ = self.events.send(SessionEvent::Invalidated(error.clone()));
            }
            Err(_) => {}
        }

        for waiter in waiters {
            // A dropped receiver is an abandoned caller; nothing to do
            let _ = waiter.send(outcome.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, ApiResponse};
    use crate::auth::StorageScope;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Refresh endpoint that blocks until released, then answers with a fixed response.
    struct GatedRefresh {
        release: Notify,
        calls: AtomicUsize,
        response: ApiResponse,
    }

    impl GatedRefresh {
        fn new(response: ApiResponse) -> Arc<Self> {
            Arc::new(Self {
                release: Notify::new(),
                calls: AtomicUsize::new(0),
                response,
            })
        }
    }

    #[async_trait]
    impl Transport for GatedRefresh {
        async fn execute(&self, _request: &ApiRequest) -> Result<ApiResponse, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(self.response.clone())
        }
    }

    fn logged_in_store(scope: StorageScope) -> CredentialStore {
        let store = CredentialStore::in_memory();
        store.save(&CredentialPair::new("old", "r1"), scope).unwrap();
        store
    }

    async fn wait_for_queue(coordinator: &RefreshCoordinator, len: usize) {
        for _ in 0..1000 {
            if let RefreshState::Refreshing { waiters } = &*coordinator.inner.lock_state() {
                if waiters.len() == len {
                    return;
                }
            }
            tokio::task::yield_now().await;
        }
        panic!("queue never reached {} waiters", len);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let transport = GatedRefresh::new(ApiResponse::json_body(
            200,
            &json!({"accessToken": "new", "refreshToken": "r2"}),
        ));
        let store = logged_in_store(StorageScope::Ephemeral);
        let coordinator =
            RefreshCoordinator::new(transport.clone(), store.clone(), "/auth/refresh", crate::events::channel());

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let c = coordinator.clone();
                tokio::spawn(async move { c.request_refresh().await })
            })
            .collect();

        wait_for_queue(&coordinator, 5).await;
        assert!(coordinator.is_refreshing());
        transport.release.notify_one();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok("new".to_string()));
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.refresh_count(), 1);
        assert!(!coordinator.is_refreshing());
        // Same scope as before
        assert_eq!(store.active_scope(), Some(StorageScope::Ephemeral));
        assert_eq!(store.load(), Some(CredentialPair::new("new", "r2")));
    }

    #[tokio::test]
    async fn test_waiters_resolve_in_arrival_order() {
        let transport = GatedRefresh::new(ApiResponse::json_body(
            200,
            &json!({"accessToken": "new", "refreshToken": "r2"}),
        ));
        let coordinator = RefreshCoordinator::new(
            transport.clone(),
            logged_in_store(StorageScope::Persistent),
            "/auth/refresh",
            crate::events::channel(),
        );

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for id in 0..4 {
            let c = coordinator.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let result = c.request_refresh().await;
                order.lock().unwrap().push(id);
                result
            }));
            // Make arrival order deterministic
            wait_for_queue(&coordinator, id + 1).await;
        }

        transport.release.notify_one();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_caller_after_completion_starts_new_cycle() {
        let transport = GatedRefresh::new(ApiResponse::json_body(
            200,
            &json!({"accessToken": "new", "refreshToken": "r2"}),
        ));
        let coordinator = RefreshCoordinator::new(
            transport.clone(),
            logged_in_store(StorageScope::Persistent),
            "/auth/refresh",
            crate::events::channel(),
        );

        let first = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.request_refresh().await })
        };
        wait_for_queue(&coordinator, 1).await;
        transport.release.notify_one();
        first.await.unwrap().unwrap();

        let second = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.request_refresh().await })
        };
        wait_for_queue(&coordinator, 1).await;
        transport.release.notify_one();
        second.await.unwrap().unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejection_clears_store_and_broadcasts() {
        let transport = GatedRefresh::new(ApiResponse::new(401, "refresh token expired"));
        let store = logged_in_store(StorageScope::Persistent);
        let events = crate::events::channel();
        let mut rx = events.subscribe();
        let coordinator = RefreshCoordinator::new(transport.clone(), store.clone(), "/auth/refresh", events);

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let c = coordinator.clone();
                tokio::spawn(async move { c.request_refresh().await })
            })
            .collect();
        wait_for_queue(&coordinator, 3).await;
        transport.release.notify_one();

        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(RefreshError::Rejected(_))));
        }
        assert!(store.load().is_none());
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::Invalidated(RefreshError::Rejected(_))
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_fails_fast() {
        let transport = GatedRefresh::new(ApiResponse::new(200, "{}"));
        let events = crate::events::channel();
        let mut rx = events.subscribe();
        let coordinator =
            RefreshCoordinator::new(transport.clone(), CredentialStore::in_memory(), "/auth/refresh", events);

        assert_eq!(coordinator.request_refresh().await, Err(RefreshError::NoRefreshCredential));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::Invalidated(RefreshError::NoRefreshCredential)
        );
    }

    #[tokio::test]
    async fn test_server_error_is_fatal_failure() {
        let transport = GatedRefresh::new(ApiResponse::new(502, "bad gateway"));
        let store = logged_in_store(StorageScope::Persistent);
        let coordinator =
            RefreshCoordinator::new(transport.clone(), store.clone(), "/auth/refresh", crate::events::channel());

        let handle = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.request_refresh().await })
        };
        wait_for_queue(&coordinator, 1).await;
        transport.release.notify_one();

        assert!(matches!(handle.await.unwrap(), Err(RefreshError::Failed(_))));
        assert!(store.load().is_none());
    }

    #[tokio::test]
    async fn test_abandoned_initiator_does_not_strand_waiters() {
        let transport = GatedRefresh::new(ApiResponse::json_body(
            200,
            &json!({"accessToken": "new", "refreshToken": "r2"}),
        ));
        let coordinator = RefreshCoordinator::new(
            transport.clone(),
            logged_in_store(StorageScope::Persistent),
            "/auth/refresh",
            crate::events::channel(),
        );

        let initiator = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.request_refresh().await })
        };
        wait_for_queue(&coordinator, 1).await;
        let follower = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.request_refresh().await })
        };
        wait_for_queue(&coordinator, 2).await;

        initiator.abort();
        transport.release.notify_one();

        assert_eq!(follower.await.unwrap(), Ok("new".to_string()));
    }

    #[tokio::test]
    async fn test_logout_during_refresh_keeps_store_empty() {
        let transport = GatedRefresh::new(ApiResponse::json_body(
            200,
            &json!({"accessToken": "new", "refreshToken": "r2"}),
        ));
        let store = logged_in_store(StorageScope::Persistent);
        let events = crate::events::channel();
        let mut rx = events.subscribe();
        let coordinator = RefreshCoordinator::new(transport.clone(), store.clone(), "/auth/refresh", events);

        let handle = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.request_refresh().await })
        };
        wait_for_queue(&coordinator, 1).await;
        while transport.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        store.clear();
        transport.release.notify_one();

        assert_eq!(handle.await.unwrap(), Err(RefreshError::Superseded));
        assert!(store.load().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_refresh_spares_login_made_meanwhile() {
        let transport = GatedRefresh::new(ApiResponse::new(401, "refresh token expired"));
        let store = logged_in_store(StorageScope::Persistent);
        let events = crate::events::channel();
        let mut rx = events.subscribe();
        let coordinator = RefreshCoordinator::new(transport.clone(), store.clone(), "/auth/refresh", events);

        let handle = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.request_refresh().await })
        };
        wait_for_queue(&coordinator, 1).await;
        while transport.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let fresh = CredentialPair::new("fresh", "fresh-r");
        store.save(&fresh, StorageScope::Ephemeral).unwrap();
        transport.release.notify_one();

        assert_eq!(handle.await.unwrap(), Err(RefreshError::Superseded));
        assert_eq!(store.load(), Some(fresh));
        assert!(rx.try_recv().is_err());
    }
}
