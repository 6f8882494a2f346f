//! Scripted transport shared by the unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use crate::api::{ApiError, ApiRequest, ApiResponse, Transport};
use crate::auth::{CredentialStore, RefreshCoordinator};
use crate::events::{self, SessionEvent};

type Handler = Box<dyn Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync>;

/// Records every request and answers through a handler closure.
/// Requests to the gated path block until the gate is notified.
pub(crate) struct MockApi {
    handler: Handler,
    requests: Mutex<Vec<ApiRequest>>,
    gate: Option<(String, Arc<Notify>)>,
}

impl MockApi {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            gate: None,
        })
    }

    pub fn gated<F>(path: &str, gate: Arc<Notify>, handler: F) -> Arc<Self>
    where
        F: Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            gate: Some((path.to_string(), gate)),
        })
    }

    pub fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }
}

#[async_trait]
impl Transport for MockApi {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some((ref path, ref gate)) = self.gate {
            if *path == request.path {
                gate.notified().await;
            }
        }
        (self.handler)(request)
    }
}

pub(crate) fn json(status: u16, body: Value) -> Result<ApiResponse, ApiError> {
    Ok(ApiResponse::json_body(status, &body))
}

pub(crate) fn status(status: u16) -> Result<ApiResponse, ApiError> {
    Ok(ApiResponse::new(status, ""))
}

/// Coordinator wired to `transport` with a fresh event channel.
pub(crate) fn coordinator(
    transport: Arc<MockApi>,
    store: &CredentialStore,
) -> (RefreshCoordinator, tokio::sync::broadcast::Sender<SessionEvent>) {
    let events = events::channel();
    let coordinator = RefreshCoordinator::new(transport, store.clone(), "/auth/refresh", events.clone());
    (coordinator, events)
}
