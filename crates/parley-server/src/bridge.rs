//! WebSocket Protocol Bridge.
//!
//! Pure translation plus liveness: a reader task decodes text frames into
//! `InboundFrame`s, a writer task encodes `OutboundFrame`s and pings on an
//! interval, and the multiplexer runs between them. The writer is the only
//! task that touches the socket's send half.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use parley_core::{ChatError, InboundFrame, OutboundFrame, UserId};
use parley_engine::ConnectionContext;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use crate::handlers::ApiError;
use crate::server::AppState;
use crate::wire::{decode_client_frame, encode_server_frame};

/// How long the writer may keep flushing after the multiplexer is done.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    #[serde(default)]
    pub user_id: Option<String>,
}

/// `GET /ws?userId=...`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(handshake): Query<Handshake>,
    State(state): State<AppState>,
) -> Response {
    let Some(user_id) = handshake
        .user_id
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
    else {
        return ApiError::MissingIdentity.into_response();
    };

    let max_frame = state.config().max_frame_bytes;
    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| handle_socket(socket, UserId::from_raw(user_id), state))
        .into_response()
}

/// Pong bookkeeping shared by the reader and writer. Times are microseconds
/// since the connection opened; `NO_PONG` until the first pong arrives.
struct Liveness {
    opened: Instant,
    last_pong_us: AtomicU64,
}

const NO_PONG: u64 = u64::MAX;

impl Liveness {
    fn new() -> Self {
        Self {
            opened: Instant::now(),
            last_pong_us: AtomicU64::new(NO_PONG),
        }
    }

    fn now_us(&self) -> u64 {
        self.opened.elapsed().as_micros() as u64
    }

    fn record_pong(&self) {
        self.last_pong_us.store(self.now_us(), Ordering::Relaxed);
    }

    /// Whether a pong arrived at or after the ping sent at `ping_us`.
    fn answered(&self, ping_us: u64) -> bool {
        let last = self.last_pong_us.load(Ordering::Relaxed);
        last != NO_PONG && last >= ping_us
    }
}

/// The oldest ping still waiting for its pong.
#[derive(Clone, Copy)]
struct PendingPing {
    sent_us: u64,
    deadline: Instant,
}

async fn pong_deadline(pending: Option<PendingPing>) {
    match pending {
        Some(p) => tokio::time::sleep_until(p.deadline).await,
        None => std::future::pending().await,
    }
}

async fn handle_socket(socket: WebSocket, user_id: UserId, state: AppState) {
    let ctx = state.multiplexer().accept(user_id);
    let span = tracing::info_span!("connection", connection_id = %ctx.id, user_id = %ctx.user_id);
    run_bridge(socket, ctx, state).instrument(span).await;
}

async fn run_bridge(socket: WebSocket, ctx: ConnectionContext, state: AppState) {
    let config = state.config();
    let (ws_tx, ws_rx) = socket.split();
    let (in_tx, in_rx) = mpsc::channel::<Result<InboundFrame, ChatError>>(config.max_send_queue);
    let (out_tx, out_rx) = mpsc::channel::<OutboundFrame>(config.max_send_queue);
    let liveness = Arc::new(Liveness::new());

    let reader = tokio::spawn(
        read_frames(ws_rx, in_tx, ctx.user_id.clone(), Arc::clone(&liveness)).in_current_span(),
    );
    let mut writer = tokio::spawn(
        write_frames(
            ws_tx,
            out_rx,
            ctx.cancel.clone(),
            liveness,
            config.ping_interval,
            config.pong_timeout,
        )
        .in_current_span(),
    );

    info!("websocket connected");
    let result = state
        .multiplexer()
        .serve(ctx, ReceiverStream::new(in_rx), out_tx)
        .await;
    match &result {
        Ok(()) | Err(ChatError::Cancelled) => debug!("multiplexer finished"),
        Err(e) => warn!(error = %e, "connection ended with error"),
    }

    reader.abort();
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
        warn!("writer did not drain in time");
        writer.abort();
    }
    info!("websocket disconnected");
}

/// Decode client frames until the socket closes or errors. Dropping the
/// sender is the multiplexer's end-of-input.
async fn read_frames(
    mut ws_rx: SplitStream<WebSocket>,
    in_tx: mpsc::Sender<Result<InboundFrame, ChatError>>,
    identity: UserId,
    liveness: Arc<Liveness>,
) {
    while let Some(next) = ws_rx.next().await {
        let item = match next {
            Ok(WsMessage::Text(text)) => decode_client_frame(text.as_str(), &identity),
            Ok(WsMessage::Binary(_)) => Err(ChatError::Protocol(
                "binary frames are not supported".into(),
            )),
            Ok(WsMessage::Pong(_)) => {
                liveness.record_pong();
                trace!("pong");
                continue;
            }
            Ok(WsMessage::Ping(_)) => continue,
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                // Oversized frames land here too
                let _ = in_tx.send(Err(ChatError::Connection(e.to_string()))).await;
                break;
            }
        };
        if in_tx.send(item).await.is_err() {
            break;
        }
    }
}

/// Single writer for the socket: outbound frames plus periodic pings. Any
/// failure, including a ping left unanswered for `pong_timeout`, cancels the
/// connection.
async fn write_frames<W>(
    mut ws_tx: W,
    mut out_rx: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
    liveness: Arc<Liveness>,
    ping_interval: Duration,
    pong_timeout: Duration,
) where
    W: Sink<WsMessage> + Unpin,
{
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;
    let mut pending: Option<PendingPing> = None;

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                let text = match encode_server_frame(frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode frame");
                        continue;
                    }
                };
                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                    debug!("socket send failed");
                    cancel.cancel();
                    return;
                }
            }
            _ = ping.tick() => {
                let sent_us = liveness.now_us();
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    cancel.cancel();
                    return;
                }
                if pending.is_none() {
                    pending = Some(PendingPing { sent_us, deadline: Instant::now() + pong_timeout });
                }
                trace!("ping");
            }
            _ = pong_deadline(pending) => {
                let Some(p) = pending.take() else { continue };
                if !liveness.answered(p.sent_us) {
                    warn!(timeout_ms = pong_timeout.as_millis() as u64, "no pong in time, closing");
                    cancel.cancel();
                    break;
                }
            }
        }
    }

    let _ = ws_tx.send(WsMessage::Close(None)).await;
    let _ = ws_tx.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ChannelId;

    #[tokio::test(start_paused = true)]
    async fn pong_answers_only_earlier_pings() {
        let liveness = Liveness::new();
        tokio::time::advance(Duration::from_secs(40)).await;
        let first = liveness.now_us();
        assert!(!liveness.answered(first));

        liveness.record_pong();
        assert!(liveness.answered(first));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!liveness.answered(liveness.now_us()));
    }

    struct Writer {
        cancel: CancellationToken,
        out_tx: mpsc::Sender<OutboundFrame>,
        sent: futures::channel::mpsc::UnboundedReceiver<WsMessage>,
        liveness: Arc<Liveness>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_writer(ping_interval: Duration, pong_timeout: Duration) -> Writer {
        let (sink, sent) = futures::channel::mpsc::unbounded::<WsMessage>();
        let (out_tx, out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let liveness = Arc::new(Liveness::new());
        let task = tokio::spawn(write_frames(
            sink,
            out_rx,
            cancel.clone(),
            Arc::clone(&liveness),
            ping_interval,
            pong_timeout,
        ));
        Writer { cancel, out_tx, sent, liveness, task }
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_keep_connection_open() {
        // Timeout shorter than the interval: every ping must still be judged
        // against its own pong, not against time since the connection opened
        let mut w = spawn_writer(Duration::from_millis(300), Duration::from_millis(200));

        let mut pings = 0;
        while pings < 5 {
            match w.sent.next().await {
                Some(WsMessage::Ping(_)) => {
                    pings += 1;
                    tokio::time::advance(Duration::from_millis(20)).await;
                    w.liveness.record_pong();
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert!(!w.cancel.is_cancelled());

        let joined = OutboundFrame::Joined {
            channel_id: ChannelId::from_raw("C1"),
        };
        w.out_tx.send(joined).await.unwrap();
        assert!(matches!(w.sent.next().await, Some(WsMessage::Text(_))));
        assert!(!w.cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_ping_closes_after_timeout() {
        let mut w = spawn_writer(Duration::from_secs(30), Duration::from_secs(10));

        assert!(matches!(w.sent.next().await, Some(WsMessage::Ping(_))));
        tokio::time::advance(Duration::from_secs(9)).await;
        tokio::task::yield_now().await;
        assert!(!w.cancel.is_cancelled());

        tokio::time::advance(Duration::from_secs(2)).await;
        w.cancel.cancelled().await;
        assert!(matches!(w.sent.next().await, Some(WsMessage::Close(None))));
        w.task.await.unwrap();
    }

    #[test]
    fn handshake_reads_user_id() {
        let h: Handshake = serde_json::from_str(r#"{"userId":"U1"}"#).unwrap();
        assert_eq!(h.user_id.as_deref(), Some("U1"));
        let h: Handshake = serde_json::from_str("{}").unwrap();
        assert!(h.user_id.is_none());
    }
}
