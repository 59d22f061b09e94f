//! Broadcast Bus contract.
//!
//! Publishing is best-effort and at most once per call. Each subscription is
//! an independent listener with its own bounded queue: a slow consumer only
//! stalls the forwarder feeding that one queue.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use parley_core::{ChannelId, ChatError, Message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Pending deliveries a single subscription buffers before its producer
/// side waits for the consumer.
pub const SUBSCRIPTION_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("bus closed")]
    Closed,
}

impl From<BusError> for ChatError {
    fn from(e: BusError) -> Self {
        ChatError::Broadcast(e.to_string())
    }
}

/// Channel-scoped publish/subscribe.
#[async_trait]
pub trait BroadcastBus: Send + Sync {
    /// Fan a saved message out to the channel's topic.
    async fn publish(&self, channel_id: &ChannelId, message: &Message) -> Result<(), BusError>;

    /// Open a fresh listener on the channel's topic. The listener is
    /// registered by the time this returns; dropping or tearing down the
    /// subscription releases it.
    async fn subscribe(&self, channel_id: &ChannelId) -> Result<Subscription, BusError>;
}

/// Consumer half of one logical subscription.
pub struct Subscription {
    channel_id: ChannelId,
    rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
}

/// Producer half, owned by the bus-side forwarder.
pub struct SubscriptionFeed {
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Create a connected subscription/feed pair with a bounded queue.
    pub fn open(channel_id: ChannelId, capacity: usize) -> (Subscription, SubscriptionFeed) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        (
            Subscription {
                channel_id,
                rx,
                cancel: cancel.clone(),
            },
            SubscriptionFeed { tx, cancel },
        )
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Next delivered message, or `None` once torn down or the bus side
    /// has gone away.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            msg = self.rx.recv() => msg,
        }
    }

    /// Stop delivery and release the underlying listener. Idempotent.
    pub fn teardown(&self) {
        self.cancel.cancel();
    }

    pub fn is_torn_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel_id", &self.channel_id)
            .field("torn_down", &self.cancel.is_cancelled())
            .finish()
    }
}

impl SubscriptionFeed {
    /// Enqueue a message, waiting for room if the queue is full. Returns
    /// `false` if the subscription went away first; a blocked send never
    /// outlives a teardown.
    pub async fn deliver(&self, message: Message) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.tx.send(message) => res.is_ok(),
        }
    }

    /// Resolves once the consumer tore the subscription down or dropped it.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// Live listener counter shared by a bus and its forwarder tasks.
#[derive(Clone, Debug, Default)]
pub(crate) struct ListenerCount(Arc<AtomicUsize>);

impl ListenerCount {
    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Count one listener until the returned ticket is dropped.
    pub(crate) fn acquire(&self) -> ListenerTicket {
        self.0.fetch_add(1, Ordering::AcqRel);
        ListenerTicket(Arc::clone(&self.0))
    }
}

pub(crate) struct ListenerTicket(Arc<AtomicUsize>);

impl Drop for ListenerTicket {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
