//! Data models exchanged with the remote API.
//!
//! - `CredentialPair`: opaque access/refresh bearer tokens
//! - `UserProfile`: server-defined profile plus derived subscription facts
//! - `SubscriptionStatus`: client-computed subscription classification

pub mod auth;
pub mod subscription;
pub mod user;

pub use auth::{AuthResponse, CredentialPair, LoginCredentials, RegistrationData};
pub use subscription::SubscriptionStatus;
pub use user::UserProfile;
