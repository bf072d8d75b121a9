use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use courier_core::{Channel, CourierError, Notification};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendReceipt {
    pub provider_message_id: Option<String>,
    pub provider_response: Option<String>,
}

/// A provider for one channel.
#[async_trait]
pub trait Transport: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, notification: &Notification) -> Result<SendReceipt, CourierError>;

    async fn health_check(&self) -> bool;
}

#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<Channel, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any transport already registered for the same channel.
    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.channel(), transport);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn Transport>> {
        self.transports.get(&channel).cloned()
    }

    pub async fn health(&self) -> BTreeMap<&'static str, bool> {
        let mut health = BTreeMap::new();
        for (channel, transport) in &self.transports {
            health.insert(channel.as_str(), transport.health_check().await);
        }
        health
    }
}
