//! Re-authentication hook
//!
//! When a request ends in `AuthenticationRequired` the pipeline hands the
//! originally intended destination to a `ReauthHandler`, so the embedding
//! application can route the user to login and restore the destination
//! afterwards.

use tokio::sync::mpsc;
use tracing::warn;

/// Receives the destination of a request that needs re-authentication.
pub trait ReauthHandler: Send + Sync {
    fn on_authentication_required(&self, destination: &str);
}

/// Default handler: logs and does nothing else.
#[derive(Debug, Default)]
pub struct LogReauthHandler;

impl ReauthHandler for LogReauthHandler {
    fn on_authentication_required(&self, destination: &str) {
        warn!(destination, "authentication required, re-authentication needed");
    }
}

/// Forwards destinations over a channel to whatever drives the login flow.
#[derive(Debug, Clone)]
pub struct ChannelReauthHandler {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelReauthHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ReauthHandler for ChannelReauthHandler {
    fn on_authentication_required(&self, destination: &str) {
        if self.tx.send(destination.to_string()).is_err() {
            warn!(destination, "re-authentication receiver dropped");
        }
    }
}
