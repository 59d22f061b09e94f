//! In-process broadcast bus.
//!
//! One `tokio::sync::broadcast` topic per channel. Every subscription gets
//! its own forwarder task that drains the topic into the subscription's
//! bounded queue, so a stalled consumer only lags its own topic receiver.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parley_core::{ChannelId, Message};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bus::{
    BroadcastBus, BusError, ListenerCount, ListenerTicket, Subscription, SubscriptionFeed,
    SUBSCRIPTION_QUEUE_CAPACITY,
};

#[derive(Clone, Debug)]
pub struct LocalBusConfig {
    /// Ring size of each channel topic. A forwarder that falls further
    /// behind than this skips messages.
    pub topic_capacity: usize,
    /// Bounded queue per subscription.
    pub subscription_capacity: usize,
}

impl Default for LocalBusConfig {
    fn default() -> Self {
        Self {
            topic_capacity: 256,
            subscription_capacity: SUBSCRIPTION_QUEUE_CAPACITY,
        }
    }
}

type Topics = Arc<DashMap<ChannelId, broadcast::Sender<Message>>>;

/// Single-process bus. Cheap to clone; clones share topics.
#[derive(Clone, Default)]
pub struct LocalBus {
    topics: Topics,
    listeners: ListenerCount,
    config: LocalBusConfig,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LocalBusConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Live listeners across all topics.
    pub fn listener_count(&self) -> usize {
        self.listeners.get()
    }

    /// Topics that currently have at least one listener.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

#[async_trait]
impl BroadcastBus for LocalBus {
    async fn publish(&self, channel_id: &ChannelId, message: &Message) -> Result<(), BusError> {
        let sender = self.topics.get(channel_id).map(|entry| entry.value().clone());
        match sender {
            Some(tx) => match tx.send(message.clone()) {
                Ok(receivers) => {
                    debug!(channel_id = %channel_id, message_id = %message.id, receivers, "published");
                }
                Err(_) => {
                    debug!(channel_id = %channel_id, "topic has no receivers");
                }
            },
            None => debug!(channel_id = %channel_id, "no listeners for channel"),
        }
        Ok(())
    }

    async fn subscribe(&self, channel_id: &ChannelId) -> Result<Subscription, BusError> {
        let rx = self
            .topics
            .entry(channel_id.clone())
            .or_insert_with(|| broadcast::channel(self.config.topic_capacity.max(1)).0)
            .subscribe();

        let (subscription, feed) =
            Subscription::open(channel_id.clone(), self.config.subscription_capacity);
        let ticket = self.listeners.acquire();

        tokio::spawn(forward(
            channel_id.clone(),
            rx,
            feed,
            ticket,
            Arc::clone(&self.topics),
        ));

        Ok(subscription)
    }
}

async fn forward(
    channel_id: ChannelId,
    mut rx: broadcast::Receiver<Message>,
    feed: SubscriptionFeed,
    ticket: ListenerTicket,
    topics: Topics,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = feed.closed() => break,
            next = rx.recv() => next,
        };
        match next {
            Ok(message) => {
                if !feed.deliver(message).await {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(channel_id = %channel_id, skipped, "subscription lagged, dropped messages");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    // Release the receiver before pruning so the count below reflects it
    drop(rx);
    topics.remove_if(&channel_id, |_, tx| tx.receiver_count() == 0);
    drop(ticket);
    debug!(channel_id = %channel_id, "listener released");
}
