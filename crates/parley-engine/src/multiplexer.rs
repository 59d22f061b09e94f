//! Stream Multiplexer: one inbound receive loop per connection, one
//! forwarder task per joined channel, all writing into a single outbound
//! queue whose consumer is the only writer to the transport.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, Stream, StreamExt};
use parley_core::{ChannelId, ChatError, ConnectionId, InboundFrame, OutboundFrame, UserId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::Subscription;
use crate::registry::{ConnectionContext, ConnectionRegistry, SubscriptionHandle};
use crate::session::ChannelSession;

#[derive(Clone)]
pub struct StreamMultiplexer {
    session: ChannelSession,
    registry: Arc<ConnectionRegistry>,
}

impl StreamMultiplexer {
    pub fn new(session: ChannelSession, registry: Arc<ConnectionRegistry>) -> Self {
        Self { session, registry }
    }

    pub fn session(&self) -> &ChannelSession {
        &self.session
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register a connection for `user_id`.
    pub fn accept(&self, user_id: UserId) -> ConnectionContext {
        self.registry.open(user_id)
    }

    /// Serve one connection until the inbound stream ends, fails, or the
    /// context is cancelled.
    ///
    /// Returns `Ok` on clean end of input (or a recovered panic), the read
    /// error for a failed inbound stream, and `Cancelled` when the context
    /// was cancelled. Every subscription task of the connection has finished
    /// by the time this returns.
    pub async fn serve<S>(
        &self,
        ctx: ConnectionContext,
        inbound: S,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Result<(), ChatError>
    where
        S: Stream<Item = Result<InboundFrame, ChatError>> + Unpin + Send,
    {
        info!(connection_id = %ctx.id, user_id = %ctx.user_id, "connection open");

        let outcome = match AssertUnwindSafe(self.receive_loop(&ctx, inbound, &outbound))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                error!(
                    connection_id = %ctx.id,
                    panic = %panic_message(&panic),
                    "receive loop panicked, closing connection"
                );
                Ok(())
            }
        };

        self.registry.close(&ctx.id).await;

        match &outcome {
            Ok(()) => debug!(connection_id = %ctx.id, "connection finished"),
            Err(ChatError::Cancelled) => debug!(connection_id = %ctx.id, "connection cancelled"),
            Err(e) => warn!(connection_id = %ctx.id, error = %e, "connection failed"),
        }
        outcome
    }

    async fn receive_loop<S>(
        &self,
        ctx: &ConnectionContext,
        mut inbound: S,
        outbound: &mpsc::Sender<OutboundFrame>,
    ) -> Result<(), ChatError>
    where
        S: Stream<Item = Result<InboundFrame, ChatError>> + Unpin + Send,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(ChatError::Cancelled),
                next = inbound.next() => next,
            };

            match next {
                None => return Ok(()),
                Some(Ok(frame)) => self.dispatch(ctx, frame, outbound).await?,
                Some(Err(ChatError::Protocol(reason))) => {
                    let err = ChatError::Protocol(reason);
                    send(ctx, outbound, OutboundFrame::error(&err, None)).await?;
                }
                Some(Err(e)) => return Err(e),
            }
        }
    }

    /// Handle one inbound frame. Only connection-fatal errors come back as
    /// `Err`; everything else is answered with an error frame.
    async fn dispatch(
        &self,
        ctx: &ConnectionContext,
        frame: InboundFrame,
        outbound: &mpsc::Sender<OutboundFrame>,
    ) -> Result<(), ChatError> {
        let reply = match frame {
            InboundFrame::Join { channel_id, user_id } => {
                if let Err(e) = check_identity(ctx, &user_id) {
                    OutboundFrame::error(&e, Some(channel_id))
                } else {
                    self.join(ctx, channel_id, outbound).await
                }
            }
            InboundFrame::Leave { channel_id, user_id } => {
                if let Err(e) = check_identity(ctx, &user_id) {
                    OutboundFrame::error(&e, Some(channel_id))
                } else {
                    self.leave(ctx, channel_id).await
                }
            }
            InboundFrame::Message {
                channel_id,
                user_id,
                body,
                attachment,
            } => {
                let posted = match check_identity(ctx, &user_id) {
                    Ok(()) => {
                        self.session
                            .post_message(&ctx.user_id, &channel_id, &body, attachment)
                            .await
                    }
                    Err(e) => Err(e),
                };
                match posted {
                    Ok(message) => OutboundFrame::posted(&message),
                    Err(e) => {
                        warn!(
                            connection_id = %ctx.id,
                            channel_id = %channel_id,
                            error = %e,
                            "post rejected"
                        );
                        OutboundFrame::error(&e, Some(channel_id))
                    }
                }
            }
            InboundFrame::Unknown { kind } => {
                debug!(connection_id = %ctx.id, kind = %kind, "unknown frame type");
                OutboundFrame::error(
                    &ChatError::Protocol(format!("unknown frame type: {kind}")),
                    None,
                )
            }
        };
        send(ctx, outbound, reply).await
    }

    async fn join(
        &self,
        ctx: &ConnectionContext,
        channel_id: ChannelId,
        outbound: &mpsc::Sender<OutboundFrame>,
    ) -> OutboundFrame {
        if self.registry.is_subscribed(&ctx.id, &channel_id) {
            return OutboundFrame::Joined { channel_id };
        }

        let subscription = match self.session.join_channel(&ctx.user_id, &channel_id).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(
                    connection_id = %ctx.id,
                    channel_id = %channel_id,
                    error = %e,
                    "join rejected"
                );
                return OutboundFrame::error(&e, Some(channel_id));
            }
        };

        let cancel = ctx.cancel.child_token();
        let join = tokio::spawn(forward(
            ctx.id.clone(),
            subscription,
            cancel.clone(),
            outbound.clone(),
        ));
        if let Err(handle) =
            self.registry
                .attach(&ctx.id, channel_id.clone(), SubscriptionHandle { cancel, join })
        {
            handle.shutdown().await;
            return OutboundFrame::error(
                &ChatError::Connection("connection is closing".into()),
                Some(channel_id),
            );
        }

        info!(connection_id = %ctx.id, channel_id = %channel_id, "joined channel");
        OutboundFrame::Joined { channel_id }
    }

    async fn leave(&self, ctx: &ConnectionContext, channel_id: ChannelId) -> OutboundFrame {
        if let Some(handle) = self.registry.detach(&ctx.id, &channel_id) {
            handle.shutdown().await;
            info!(connection_id = %ctx.id, channel_id = %channel_id, "left channel");
        }
        OutboundFrame::Left { channel_id }
    }
}

fn check_identity(ctx: &ConnectionContext, user_id: &UserId) -> Result<(), ChatError> {
    if user_id.is_empty() || user_id == &ctx.user_id {
        Ok(())
    } else {
        Err(ChatError::Protocol(format!(
            "frame user {user_id} does not match connection user {}",
            ctx.user_id
        )))
    }
}

/// Enqueue a frame for the writer. Fails only when the connection is going
/// away, in which case the receive loop should stop.
async fn send(
    ctx: &ConnectionContext,
    outbound: &mpsc::Sender<OutboundFrame>,
    frame: OutboundFrame,
) -> Result<(), ChatError> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(ChatError::Cancelled),
        res = outbound.send(frame) => {
            res.map_err(|_| ChatError::Connection("outbound stream closed".into()))
        }
    }
}

/// Forward one subscription onto the connection until cancelled or the
/// writer goes away. Never fails the connection.
async fn forward(
    connection_id: ConnectionId,
    mut subscription: Subscription,
    cancel: CancellationToken,
    outbound: mpsc::Sender<OutboundFrame>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = subscription.recv() => msg,
        };
        let Some(message) = message else {
            debug!(connection_id = %connection_id, channel_id = %subscription.channel_id(), "subscription ended");
            break;
        };

        let frame = OutboundFrame::delivered(&message);
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = outbound.send(frame) => res.is_ok(),
        };
        if !sent {
            debug!(connection_id = %connection_id, "outbound closed, stopping forwarder");
            break;
        }
    }
    subscription.teardown();
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{fixture, Fixture};
    use crate::session::NewChannel;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio_stream::wrappers::ReceiverStream;

    type Inbound = mpsc::Sender<Result<InboundFrame, ChatError>>;

    struct Conn {
        ctx: ConnectionContext,
        tx: Inbound,
        rx: mpsc::Receiver<OutboundFrame>,
        task: tokio::task::JoinHandle<Result<(), ChatError>>,
    }

    fn connect(mux: &StreamMultiplexer, user: &str) -> Conn {
        let ctx = mux.accept(UserId::from_raw(user));
        let (tx, in_rx) = mpsc::channel(16);
        let (out_tx, rx) = mpsc::channel(16);
        let mux = mux.clone();
        let serve_ctx = ctx.clone();
        let task = tokio::spawn(async move {
            mux.serve(serve_ctx, ReceiverStream::new(in_rx), out_tx).await
        });
        Conn { ctx, tx, rx, task }
    }

    async fn next_frame(rx: &mut mpsc::Receiver<OutboundFrame>) -> OutboundFrame {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no frame within a second")
            .expect("outbound closed")
    }

    fn join(channel: &ChannelId, user: &str) -> Result<InboundFrame, ChatError> {
        Ok(InboundFrame::Join {
            channel_id: channel.clone(),
            user_id: UserId::from_raw(user),
        })
    }

    fn post(channel: &ChannelId, user: &str, body: &str) -> Result<InboundFrame, ChatError> {
        Ok(InboundFrame::Message {
            channel_id: channel.clone(),
            user_id: UserId::from_raw(user),
            body: body.into(),
            attachment: None,
        })
    }

    async fn setup() -> (Fixture, StreamMultiplexer, ChannelId) {
        let f = fixture();
        let channel = f
            .session
            .create_channel(&UserId::from_raw("U1"), NewChannel::new("general", "Ada"))
            .await
            .unwrap();
        let mux = StreamMultiplexer::new(f.session.clone(), Arc::new(ConnectionRegistry::new()));
        (f, mux, channel.id)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn joined_sender_receives_own_message_once() {
        let (f, mux, c1) = setup().await;
        let mut conn = connect(&mux, "U1");

        conn.tx.send(join(&c1, "U1")).await.unwrap();
        assert_eq!(next_frame(&mut conn.rx).await, OutboundFrame::Joined { channel_id: c1.clone() });

        conn.tx.send(post(&c1, "U1", "hello")).await.unwrap();

        let mut posted_id = None;
        let mut delivered = Vec::new();
        while posted_id.is_none() || delivered.is_empty() {
            match next_frame(&mut conn.rx).await {
                OutboundFrame::Posted { message_id, .. } => posted_id = Some(message_id),
                OutboundFrame::Delivered {
                    channel_id,
                    message_id,
                    sender_id,
                    body,
                    ..
                } => {
                    assert_eq!(channel_id, c1);
                    assert_eq!(sender_id.as_str(), "U1");
                    assert_eq!(body, "hello");
                    delivered.push(message_id);
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(delivered, vec![posted_id.unwrap()]);

        // No duplicate delivery
        assert!(
            tokio::time::timeout(Duration::from_millis(100), conn.rx.recv())
                .await
                .is_err()
        );

        let history = f.session.get_history(&c1, 50, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "hello");
    }

    #[tokio::test]
    async fn rejoin_is_idempotent() {
        let (f, mux, c1) = setup().await;
        let mut conn = connect(&mux, "U1");

        for _ in 0..3 {
            conn.tx.send(join(&c1, "U1")).await.unwrap();
            assert!(matches!(next_frame(&mut conn.rx).await, OutboundFrame::Joined { .. }));
        }
        assert_eq!(mux.registry().subscription_count(), 1);
        assert_eq!(f.bus.inner.listener_count(), 1);
    }

    #[tokio::test]
    async fn failed_post_keeps_connection_open() {
        let (f, mux, c1) = setup().await;
        let mut conn = connect(&mux, "U2");

        conn.tx.send(post(&c1, "U2", "intruder")).await.unwrap();
        match next_frame(&mut conn.rx).await {
            OutboundFrame::Error { code, channel_id, .. } => {
                assert_eq!(code, "unauthorized");
                assert_eq!(channel_id, Some(c1.clone()));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        f.store.fail_saves.store(true, Ordering::SeqCst);
        f.session
            .add_member(&UserId::from_raw("U1"), &c1, &UserId::from_raw("U2"), "Bo")
            .await
            .unwrap();
        conn.tx.send(post(&c1, "U2", "lost")).await.unwrap();
        match next_frame(&mut conn.rx).await {
            OutboundFrame::Error { code, .. } => assert_eq!(code, "storage_error"),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(f.bus.publishes.load(Ordering::SeqCst), 0);

        f.store.fail_saves.store(false, Ordering::SeqCst);
        conn.tx.send(post(&c1, "U2", "works now")).await.unwrap();
        assert!(matches!(next_frame(&mut conn.rx).await, OutboundFrame::Posted { .. }));
        assert!(!conn.task.is_finished());
    }

    #[tokio::test]
    async fn unknown_and_mismatched_frames_get_error_frames() {
        let (_f, mux, c1) = setup().await;
        let mut conn = connect(&mux, "U1");

        conn.tx
            .send(Ok(InboundFrame::Unknown { kind: "TYPING".into() }))
            .await
            .unwrap();
        match next_frame(&mut conn.rx).await {
            OutboundFrame::Error { code, .. } => assert_eq!(code, "protocol_error"),
            other => panic!("unexpected frame: {other:?}"),
        }

        conn.tx.send(join(&c1, "U9")).await.unwrap();
        match next_frame(&mut conn.rx).await {
            OutboundFrame::Error { code, .. } => assert_eq!(code, "protocol_error"),
            other => panic!("unexpected frame: {other:?}"),
        }

        conn.tx
            .send(Err(ChatError::Protocol("bad json".into())))
            .await
            .unwrap();
        assert!(next_frame(&mut conn.rx).await.is_error());
        assert_eq!(mux.registry().subscription_count(), 0);
    }

    #[tokio::test]
    async fn leave_releases_only_that_channel() {
        let (f, mux, c1) = setup().await;
        let c2 = f
            .session
            .create_channel(&UserId::from_raw("U1"), NewChannel::new("random", "Ada"))
            .await
            .unwrap()
            .id;
        let mut conn = connect(&mux, "U1");

        conn.tx.send(join(&c1, "U1")).await.unwrap();
        next_frame(&mut conn.rx).await;
        conn.tx.send(join(&c2, "U1")).await.unwrap();
        next_frame(&mut conn.rx).await;
        assert_eq!(f.bus.inner.listener_count(), 2);

        conn.tx
            .send(Ok(InboundFrame::Leave {
                channel_id: c1.clone(),
                user_id: UserId::from_raw("U1"),
            }))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut conn.rx).await, OutboundFrame::Left { channel_id: c1.clone() });
        assert!(!mux.registry().is_subscribed(&conn.ctx.id, &c1));
        assert!(mux.registry().is_subscribed(&conn.ctx.id, &c2));
        let bus = Arc::clone(&f.bus);
        wait_until(|| bus.inner.listener_count() == 1).await;
    }

    #[tokio::test]
    async fn cancellation_releases_every_listener() {
        let (f, mux, c1) = setup().await;
        let c2 = f
            .session
            .create_channel(&UserId::from_raw("U1"), NewChannel::new("random", "Ada"))
            .await
            .unwrap()
            .id;
        let mut conn = connect(&mux, "U1");
        for c in [&c1, &c2] {
            conn.tx.send(join(c, "U1")).await.unwrap();
            next_frame(&mut conn.rx).await;
        }
        assert_eq!(f.bus.inner.listener_count(), 2);

        conn.ctx.cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), conn.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(ChatError::Cancelled));
        assert_eq!(mux.registry().connection_count(), 0);
        assert_eq!(mux.registry().subscription_count(), 0);

        let bus = Arc::clone(&f.bus);
        wait_until(|| bus.inner.listener_count() == 0).await;
    }

    #[tokio::test]
    async fn cancellation_unblocks_forwarder_on_full_queue() {
        let (f, mux, c1) = setup().await;
        let ctx = mux.accept(UserId::from_raw("U1"));
        let (in_tx, in_rx) = mpsc::channel(4);
        // Room for the Joined ack only; nothing drains it afterwards
        let (out_tx, _out_rx) = mpsc::channel(2);
        let serve_ctx = ctx.clone();
        let mux2 = mux.clone();
        let task = tokio::spawn(async move {
            mux2.serve(serve_ctx, ReceiverStream::new(in_rx), out_tx).await
        });

        in_tx.send(join(&c1, "U1")).await.unwrap();
        let registry = Arc::clone(mux.registry());
        let conn_id = ctx.id.clone();
        let channel = c1.clone();
        wait_until(move || registry.is_subscribed(&conn_id, &channel)).await;

        for i in 0..30 {
            f.session
                .post_message(&UserId::from_raw("U1"), &c1, &format!("m{i}"), None)
                .await
                .unwrap();
        }

        ctx.cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("serve blocked on a full queue")
            .unwrap();
        assert_eq!(result, Err(ChatError::Cancelled));
        let bus = Arc::clone(&f.bus);
        wait_until(|| bus.inner.listener_count() == 0).await;
    }

    #[tokio::test]
    async fn clean_eof_closes_without_error() {
        let (f, mux, c1) = setup().await;
        let mut conn = connect(&mux, "U1");
        conn.tx.send(join(&c1, "U1")).await.unwrap();
        next_frame(&mut conn.rx).await;

        drop(conn.tx);
        let result = tokio::time::timeout(Duration::from_secs(1), conn.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Ok(()));
        let bus = Arc::clone(&f.bus);
        wait_until(|| bus.inner.listener_count() == 0).await;
    }

    #[tokio::test]
    async fn read_error_propagates() {
        let (_f, mux, _c1) = setup().await;
        let conn = connect(&mux, "U1");
        conn.tx
            .send(Err(ChatError::Connection("reset by peer".into())))
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), conn.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(ChatError::Connection("reset by peer".into())));
        assert_eq!(mux.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn panic_in_receive_loop_is_contained() {
        let (f, mux, c1) = setup().await;
        let ctx = mux.accept(UserId::from_raw("U1"));
        let (out_tx, mut out_rx) = mpsc::channel(16);

        // Join once, then blow up on the next poll
        let mut polled = 0;
        let inbound = futures::stream::poll_fn(move |_| {
            polled += 1;
            match polled {
                1 => std::task::Poll::Ready(Some(join(&c1, "U1"))),
                _ => panic!("decoder exploded"),
            }
        });

        let result = mux.serve(ctx, inbound, out_tx).await;
        assert_eq!(result, Ok(()));
        assert!(matches!(out_rx.recv().await, Some(OutboundFrame::Joined { .. })));
        assert_eq!(mux.registry().connection_count(), 0);
        let bus = Arc::clone(&f.bus);
        wait_until(|| bus.inner.listener_count() == 0).await;
    }

    #[tokio::test]
    async fn connections_are_isolated() {
        let (f, mux, c1) = setup().await;
        f.session
            .add_member(&UserId::from_raw("U1"), &c1, &UserId::from_raw("U2"), "Bo")
            .await
            .unwrap();
        let mut a = connect(&mux, "U1");
        let mut b = connect(&mux, "U2");
        a.tx.send(join(&c1, "U1")).await.unwrap();
        next_frame(&mut a.rx).await;
        b.tx.send(join(&c1, "U2")).await.unwrap();
        next_frame(&mut b.rx).await;

        // A fails hard; B keeps receiving
        a.tx.send(Err(ChatError::Connection("gone".into()))).await.unwrap();
        assert!(a.task.await.unwrap().is_err());

        f.session
            .post_message(&UserId::from_raw("U1"), &c1, "still here?", None)
            .await
            .unwrap();
        match next_frame(&mut b.rx).await {
            OutboundFrame::Delivered { body, sender_name, .. } => {
                assert_eq!(body, "still here?");
                assert_eq!(sender_name.as_deref(), Some("Ada"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
