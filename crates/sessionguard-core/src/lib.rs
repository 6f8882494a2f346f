//! sessionguard-core - authenticated session layer for an HTTP API client.
//!
//! Layers, bottom-up:
//! - [`auth::CredentialStore`]: access/refresh tokens in a persistent or ephemeral scope
//! - [`auth::RefreshCoordinator`]: at most one refresh in flight, outcome shared by all callers
//! - [`api::RequestPipeline`]: bearer attachment plus refresh-and-replay on 401
//! - [`session::SessionContext`]: login, logout, profile and subscription facts

pub mod api;
pub mod auth;
pub mod config;
pub mod events;
pub mod models;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiError, ApiRequest, ApiResponse, RequestPipeline};
pub use auth::{CredentialStore, RefreshCoordinator, RefreshError, StorageScope};
pub use config::Config;
pub use events::SessionEvent;
pub use models::{CredentialPair, LoginCredentials, RegistrationData, SubscriptionStatus, UserProfile};
pub use session::{AuthError, SessionContext, SessionState};
