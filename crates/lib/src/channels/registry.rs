//! Channel registry: register and lookup server-side channel handlers by name.

use crate::channels::context::CallTrace;
use crate::channels::error::ChannelError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One cable connection as seen by channel handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCtx {
    /// Connection id (uuid v4).
    pub id: String,
    /// Identified user; identity itself comes from outside the cable.
    pub user: String,
}

impl ConnectionCtx {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user: user.into(),
        }
    }
}

/// Server-side channel (e.g. "ChatChannel").
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Channel name as it appears in subscription identifiers.
    fn name(&self) -> &str;

    /// Accept or reject a subscription; on accept, returns the topics to stream to it.
    async fn subscribed(
        &self,
        conn: &ConnectionCtx,
        params: &Map<String, Value>,
    ) -> Result<Vec<String>, ChannelError>;

    /// Run `action`. Implementations push a frame onto `trace` for the method they enter
    /// and leave it there when they fail.
    async fn perform(
        &self,
        conn: &ConnectionCtx,
        params: &Map<String, Value>,
        action: &str,
        data: &Map<String, Value>,
        trace: &mut CallTrace,
    ) -> Result<(), ChannelError>;

    /// Called when the subscription ends (unsubscribe or connection close).
    async fn unsubscribed(&self, _conn: &ConnectionCtx, _params: &Map<String, Value>) {}
}

/// Registry of channel names to handlers. Shared across the gateway.
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn ChannelHandler>>>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register under `handler.name()`, replacing any previous handler of that name.
    pub async fn register(&self, handler: Arc<dyn ChannelHandler>) {
        let name = handler.name().to_string();
        let mut g = self.inner.write().await;
        if g.insert(name.clone(), handler).is_some() {
            log::debug!("channel registry: replaced handler for {}", name);
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn ChannelHandler>> {
        let g = self.inner.read().await;
        g.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let g = self.inner.read().await;
        g.keys().cloned().collect()
    }
}
