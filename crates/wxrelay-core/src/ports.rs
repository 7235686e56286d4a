use std::sync::Arc;

use async_trait::async_trait;

use crate::{domain::GroupInfo, lifecycle::ProviderSink, Result};

/// Anything that can list the groups the session currently sees.
#[async_trait]
pub trait GroupSource: Send + Sync {
    async fn list_groups(&self) -> Result<Vec<GroupInfo>>;
}

/// Hexagonal port for the chat session backend.
///
/// One instance represents one login attempt. The lifecycle tears the old
/// instance down (`shutdown`) before constructing the next one.
#[async_trait]
pub trait SessionProvider: GroupSource {
    /// Drive authentication until it succeeds or fails.
    ///
    /// While waiting, report the challenge and scan progress through `sink`.
    /// On success returns the account display name and keeps delivering
    /// inbound events through `sink` until the session ends, at which point the
    /// provider calls [`ProviderSink::terminated`].
    async fn login(&self, sink: ProviderSink) -> Result<String>;

    /// Liveness probe used by the heartbeat.
    async fn alive(&self) -> bool;

    /// Release everything this instance owns. Must be idempotent.
    async fn shutdown(&self);
}

/// Builds a fresh provider instance for each login attempt.
pub trait ProviderFactory: Send + Sync {
    fn create(&self) -> Arc<dyn SessionProvider>;
}

/// Outbound notification channel (mail relay, etc).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<()>;
}
