//! Out-of-band notifications for the presentation layer.

use tokio::sync::broadcast;

use crate::auth::RefreshError;

/// Buffered events per subscriber before slow receivers start lagging
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Refresh failed; credentials have been cleared and the user must sign in again.
    Invalidated(RefreshError),
    /// The server asked the client to navigate somewhere (e.g. an upgrade screen).
    ForcedRedirect(String),
}

pub fn channel() -> broadcast::Sender<SessionEvent> {
    let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}
