//! NATS-backed broadcast bus for running several server processes.
//!
//! Core NATS publish/subscribe, no JetStream: delivery is best-effort, which
//! is all the bus promises. One subject per channel, JSON payloads. Every
//! logical subscription holds its own NATS subscription on the shared
//! client, so tearing one down never disturbs the others.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parley_core::{ChannelId, Message};
use tracing::{debug, info, warn};

use crate::bus::{
    BroadcastBus, BusError, ListenerCount, ListenerTicket, Subscription, SubscriptionFeed,
    SUBSCRIPTION_QUEUE_CAPACITY,
};

#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    subject_prefix: String,
    capacity: usize,
    listeners: ListenerCount,
}

impl NatsBus {
    /// Connect to a NATS server.
    pub async fn connect(url: &str, subject_prefix: impl Into<String>) -> Result<Self, BusError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Transport(format!("connect to {url}: {e}")))?;
        info!(url, "connected to NATS");
        Ok(Self::new(client, subject_prefix))
    }

    pub fn new(client: async_nats::Client, subject_prefix: impl Into<String>) -> Self {
        Self {
            client,
            subject_prefix: subject_prefix.into(),
            capacity: SUBSCRIPTION_QUEUE_CAPACITY,
            listeners: ListenerCount::default(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.get()
    }

    fn subject(&self, channel_id: &ChannelId) -> Result<String, BusError> {
        channel_subject(&self.subject_prefix, channel_id)
    }
}

/// `{prefix}.channel.{id}`. IDs that would change the subject's token
/// structure are rejected.
fn channel_subject(prefix: &str, channel_id: &ChannelId) -> Result<String, BusError> {
    let id = channel_id.as_str();
    if id.is_empty() || id.contains(['.', '*', '>']) || id.contains(char::is_whitespace) {
        return Err(BusError::Encode(format!(
            "channel id {id:?} is not a valid subject token"
        )));
    }
    Ok(format!("{prefix}.channel.{id}"))
}

#[async_trait]
impl BroadcastBus for NatsBus {
    async fn publish(&self, channel_id: &ChannelId, message: &Message) -> Result<(), BusError> {
        let subject = self.subject(channel_id)?;
        let payload: Bytes = serde_json::to_vec(message)
            .map_err(|e| BusError::Encode(e.to_string()))?
            .into();
        self.client
            .publish(subject, payload)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        debug!(channel_id = %channel_id, message_id = %message.id, "published to NATS");
        Ok(())
    }

    async fn subscribe(&self, channel_id: &ChannelId) -> Result<Subscription, BusError> {
        let subject = self.subject(channel_id)?;
        let subscriber = self
            .client
            .subscribe(subject)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;

        let (subscription, feed) = Subscription::open(channel_id.clone(), self.capacity);
        let ticket = self.listeners.acquire();
        tokio::spawn(forward(channel_id.clone(), subscriber, feed, ticket));
        Ok(subscription)
    }
}

async fn forward(
    channel_id: ChannelId,
    mut subscriber: async_nats::Subscriber,
    feed: SubscriptionFeed,
    _ticket: ListenerTicket,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = feed.closed() => break,
            next = subscriber.next() => next,
        };
        let Some(raw) = next else {
            debug!(channel_id = %channel_id, "NATS subscription ended");
            break;
        };
        let message: Message = match serde_json::from_slice(&raw.payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(channel_id = %channel_id, error = %e, "dropping undecodable bus payload");
                continue;
            }
        };
        if !feed.deliver(message).await {
            break;
        }
    }

    if let Err(e) = subscriber.unsubscribe().await {
        debug!(channel_id = %channel_id, error = %e, "NATS unsubscribe failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_per_channel() {
        let subject = channel_subject("parley", &ChannelId::from_raw("chan_0191")).unwrap();
        assert_eq!(subject, "parley.channel.chan_0191");
    }

    #[test]
    fn wildcards_and_separators_rejected() {
        for bad in ["a.b", "*", "team>", "two words", ""] {
            let err = channel_subject("parley", &ChannelId::from_raw(bad)).unwrap_err();
            assert!(matches!(err, BusError::Encode(_)), "{bad} accepted");
        }
    }
}
