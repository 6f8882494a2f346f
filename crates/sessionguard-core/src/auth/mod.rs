//! Credential storage and refresh coordination.
//!
//! This module provides:
//! - `CredentialStore`: the credential pair and cached profile, kept in
//!   either the persistent or the ephemeral scope
//! - `RefreshCoordinator`: single-flight refresh shared by concurrent callers

pub mod credentials;
pub mod refresh;

pub use credentials::{CredentialStore, FileStore, KeyValueStore, KeyringStore, MemoryStore, StorageScope};
pub use refresh::{AccessToken, RefreshCoordinator, RefreshError};
