//! Per-process map of live connections and the subscription tasks they own.
//!
//! Created once at startup and passed to whoever accepts connections. Every
//! connection token is a child of the registry's root token, so shutting
//! the registry down reaches every connection and every subscription task.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use parley_core::{ChannelId, ConnectionId, UserId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identity and cancellation scope of one accepted connection.
#[derive(Clone, Debug)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub cancel: CancellationToken,
}

/// A running forwarder task for one (connection, channel) pair.
pub struct SubscriptionHandle {
    pub cancel: CancellationToken,
    pub join: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Cancel the task and wait for it to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            if e.is_panic() {
                warn!(error = %e, "subscription task panicked");
            }
        }
    }
}

struct ConnectionEntry {
    user_id: UserId,
    cancel: CancellationToken,
    /// `None` once a closer has taken the handles.
    subscriptions: Mutex<Option<HashMap<ChannelId, SubscriptionHandle>>>,
    /// Fires after every subscription task has finished.
    closed: CancellationToken,
}

pub struct ConnectionRegistry {
    root: CancellationToken,
    connections: DashMap<ConnectionId, Arc<ConnectionEntry>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            connections: DashMap::new(),
        }
    }

    /// Register a new connection for `user_id`.
    pub fn open(&self, user_id: UserId) -> ConnectionContext {
        let ctx = ConnectionContext {
            id: ConnectionId::new(),
            user_id,
            cancel: self.root.child_token(),
        };
        self.connections.insert(
            ctx.id.clone(),
            Arc::new(ConnectionEntry {
                user_id: ctx.user_id.clone(),
                cancel: ctx.cancel.clone(),
                subscriptions: Mutex::new(Some(HashMap::new())),
                closed: CancellationToken::new(),
            }),
        );
        debug!(connection_id = %ctx.id, user_id = %ctx.user_id, "connection registered");
        ctx
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn is_subscribed(&self, connection_id: &ConnectionId, channel_id: &ChannelId) -> bool {
        self.connections
            .get(connection_id)
            .is_some_and(|entry| {
                entry
                    .subscriptions
                    .lock()
                    .as_ref()
                    .is_some_and(|subs| subs.contains_key(channel_id))
            })
    }

    /// Attach a running subscription to its connection.
    ///
    /// Hands the handle back if the connection is gone or closing, or already
    /// holds a subscription for the channel; the caller must shut it down.
    pub fn attach(
        &self,
        connection_id: &ConnectionId,
        channel_id: ChannelId,
        handle: SubscriptionHandle,
    ) -> Result<(), SubscriptionHandle> {
        let Some(entry) = self.connections.get(connection_id).map(|e| Arc::clone(e.value())) else {
            return Err(handle);
        };
        let mut guard = entry.subscriptions.lock();
        let Some(subs) = guard.as_mut() else {
            return Err(handle);
        };
        if subs.contains_key(&channel_id) {
            return Err(handle);
        }
        subs.insert(channel_id, handle);
        Ok(())
    }

    /// Detach one subscription, leaving the connection open.
    pub fn detach(
        &self,
        connection_id: &ConnectionId,
        channel_id: &ChannelId,
    ) -> Option<SubscriptionHandle> {
        let entry = self.connections.get(connection_id).map(|e| Arc::clone(e.value()))?;
        let handle = entry.subscriptions.lock().as_mut()?.remove(channel_id);
        handle
    }

    /// Cancel everything a connection owns, wait for its subscription tasks
    /// to finish, then remove it. Idempotent; a caller that loses the race to
    /// another closer still returns only after the teardown completes.
    pub async fn close(&self, connection_id: &ConnectionId) {
        let Some(entry) = self
            .connections
            .get(connection_id)
            .map(|e| Arc::clone(e.value()))
        else {
            return;
        };
        entry.cancel.cancel();

        let taken = entry.subscriptions.lock().take();
        let Some(subs) = taken else {
            entry.closed.cancelled().await;
            return;
        };
        let count = subs.len();
        for (_, handle) in subs {
            handle.shutdown().await;
        }
        self.connections.remove(connection_id);
        entry.closed.cancel();
        info!(
            connection_id = %connection_id,
            user_id = %entry.user_id,
            subscriptions = count,
            "connection closed"
        );
    }

    /// Cancel and close every connection. Used at shutdown.
    pub async fn close_all(&self) {
        self.root.cancel();
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Live subscription tasks across all connections.
    pub fn subscription_count(&self) -> usize {
        self.connections
            .iter()
            .map(|e| e.value().subscriptions.lock().as_ref().map_or(0, HashMap::len))
            .sum()
    }
}
