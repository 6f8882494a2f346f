//! Request pipeline wrapping every outgoing API call.
//!
//! Outgoing: the stored access token is attached as a bearer credential.
//! Incoming: a forced-redirect hint is broadcast, and a 401 triggers one
//! refresh-and-replay unless the request targets an auth endpoint or has
//! already been replayed.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::auth::{CredentialStore, RefreshCoordinator};
use crate::events::SessionEvent;

use super::{ApiError, ApiRequest, ApiResponse, Transport};

/// Clone is cheap; clones share the transport, store and coordinator.
#[derive(Clone)]
pub struct RequestPipeline {
    transport: Arc<dyn Transport>,
    store: CredentialStore,
    coordinator: RefreshCoordinator,
    events: broadcast::Sender<SessionEvent>,
    /// Endpoints whose 401s must never trigger a refresh
    no_refresh_paths: Arc<[String]>,
}

impl RequestPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: CredentialStore,
        coordinator: RefreshCoordinator,
        events: broadcast::Sender<SessionEvent>,
        auth_paths: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        // The refresh endpoint is always exempt
        let no_refresh_paths: Arc<[String]> = auth_paths
            .into_iter()
            .map(Into::into)
            .chain(std::iter::once(coordinator.refresh_path().to_string()))
            .collect();
        Self {
            transport,
            store,
            coordinator,
            events,
            no_refresh_paths,
        }
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    fn is_auth_endpoint(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        self.no_refresh_paths.iter().any(|p| path.ends_with(p.as_str()))
    }

    fn should_refresh(&self, request: &ApiRequest) -> bool {
        !request.retried && !self.is_auth_endpoint(&request.path)
    }

    /// Send a request, returning the response on 2xx and the mapped error otherwise.
    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        if request.bearer.is_none() {
            request.bearer = self.store.access_token();
        }

        loop {
            let response = self.transport.execute(&request).await?;

            if let Some(target) = response.redirect_hint() {
                debug!(path = %request.path, target = %target, "Server requested redirect");
                let _ = self.events.send(SessionEvent::ForcedRedirect(target));
            }

            if response.is_unauthorized() && self.should_refresh(&request) {
                debug!(path = %request.path, "Access token rejected, refreshing");
                request.retried = true;
                let token = self.coordinator.request_refresh().await?;
                request.bearer = Some(token);
                continue;
            }

            if response.is_unauthorized() {
                debug!(path = %request.path, retried = request.retried, "Authorization failure not retried");
            }
            return response.error_for_status();
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::post(path).with_json(body)?).await?.json()
    }
}
