//! Delivery of events to validator transport sessions.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::messages::ChannelEvent;

/// Sends events to a transport session identified by its channel name.
#[async_trait]
pub trait ChannelLayer: Send + Sync {
    async fn send(&self, channel: &str, event: ChannelEvent) -> Result<(), TransportError>;

    /// Forget a session. Returns whether it was known.
    fn unregister(&self, channel: &str) -> bool;
}

/// Channel layer for sessions living in this process.
#[derive(Debug, Default)]
pub struct LocalChannelLayer {
    channels: Mutex<HashMap<String, mpsc::UnboundedSender<ChannelEvent>>>,
}

impl LocalChannelLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and get the receiving end of its event stream.
    /// A previous session with the same name is replaced.
    pub fn register(&self, channel: impl Into<String>) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut channels) = self.channels.lock() {
            channels.insert(channel.into(), tx);
        }
        rx
    }
}

#[async_trait]
impl ChannelLayer for LocalChannelLayer {
    async fn send(&self, channel: &str, event: ChannelEvent) -> Result<(), TransportError> {
        let sender = self
            .channels
            .lock()
            .ok()
            .and_then(|channels| channels.get(channel).cloned())
            .ok_or_else(|| TransportError::ChannelClosed(channel.to_string()))?;
        sender
            .send(event)
            .map_err(|_| TransportError::ChannelClosed(channel.to_string()))
    }

    fn unregister(&self, channel: &str) -> bool {
        self.channels
            .lock()
            .map(|mut channels| channels.remove(channel).is_some())
            .unwrap_or(false)
    }
}
