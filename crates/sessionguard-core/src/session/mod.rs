//! Session façade consumed by the presentation layer.
//!
//! This module provides:
//! - `SessionContext`: login, registration, logout, profile refresh and
//!   derived subscription facts
//! - `SessionState`: the observable `{user, loading, error}` triple
//! - `AuthError`: failures surfaced to callers, split into fatal and inline

pub mod context;
pub mod error;

pub use context::{SessionContext, SessionState, SESSION_EXPIRED_MESSAGE};
pub use error::AuthError;
