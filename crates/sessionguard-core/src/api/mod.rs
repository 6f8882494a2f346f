//! Authenticated request plumbing.
//!
//! Every request the client makes goes through the `RequestPipeline`, which
//! attaches the current access token and recovers from an expired token by
//! refreshing once and replaying the request.

pub mod error;
pub mod pipeline;
pub mod transport;

pub use error::ApiError;
pub use pipeline::RequestPipeline;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
