//! Per-connection request loop over a WebSocket.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use warden_core::ids::ConnectionId;
use warden_core::protocol::{decode, encode, InboundMessage};
use warden_telemetry::MetricsRecorder;

use crate::orchestrator::QueryOrchestrator;

/// Interval between server-initiated Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Gauge of open WebSocket connections; `/health` reads it too.
pub const CONNECTIONS_GAUGE: &str = "connections_active";

/// How long queued frames may take to flush once the loop ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a connection loop needs from the server.
#[derive(Clone)]
pub struct ConnectionContext {
    pub orchestrator: Arc<QueryOrchestrator>,
    pub metrics: Arc<MetricsRecorder>,
    pub shutdown: CancellationToken,
    pub max_send_queue: usize,
}

/// Serve one WebSocket until the peer leaves or the server shuts down.
///
/// Frames are handled strictly one at a time: every response of a query is
/// queued before the next frame is read.
#[instrument(skip_all, fields(connection_id = %connection_id))]
pub async fn run_connection(socket: WebSocket, connection_id: ConnectionId, ctx: ConnectionContext) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(ctx.max_send_queue.max(1));

    info!("client connected");
    ctx.metrics.gauge_inc(CONNECTIONS_GAUGE, &[], 1.0);

    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    match frame {
                        Some(text) => {
                            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = ws_tx.close().await;
                            break;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    trace!("sent ping");
                }
            }
        }
    });

    loop {
        let next = tokio::select! {
            biased;
            () = ctx.shutdown.cancelled() => {
                debug!("server shutting down, closing connection");
                break;
            }
            next = ws_rx.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
            None => break,
        };

        let text = match frame {
            Message::Text(t) => t.to_string(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    warn!(len = data.len(), "dropping non-UTF-8 binary frame");
                    ctx.metrics
                        .counter_inc("frames_rejected_total", &[("kind", "binary")], 1);
                    continue;
                }
            },
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if !handle_frame(&text, &ctx.orchestrator, &ctx.metrics, &out_tx).await {
            debug!("peer no longer reachable");
            break;
        }
    }

    drop(out_tx);
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    ctx.metrics.gauge_inc(CONNECTIONS_GAUGE, &[], -1.0);
    info!("client disconnected");
}

/// Decode and dispatch one inbound frame, queueing any responses on `out`.
///
/// Returns `false` once `out` is closed. A query whose peer has gone is
/// still driven to completion so its session state stays current.
pub async fn handle_frame(
    raw: &str,
    orchestrator: &Arc<QueryOrchestrator>,
    metrics: &MetricsRecorder,
    out: &mpsc::Sender<String>,
) -> bool {
    let message = match decode(raw) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, len = raw.len(), "dropping inbound frame");
            metrics.counter_inc("frames_rejected_total", &[("kind", e.error_kind())], 1);
            return !out.is_closed();
        }
    };

    match message {
        InboundMessage::CloseSession { channel_id } => {
            let _ = orchestrator.close_session(&channel_id).await;
            !out.is_closed()
        }
        InboundMessage::Query(request) => {
            debug!(query_id = %request.query_id, channel_id = %request.channel_id, "query received");
            let mut responses = orchestrator.process_query(request);
            let mut reachable = true;
            while let Some(message) = responses.next().await {
                if !reachable {
                    continue;
                }
                if out.send(encode(&message)).await.is_err() {
                    debug!(
                        query_id = message.query_id(),
                        "peer gone mid-query, draining remaining output"
                    );
                    reachable = false;
                }
            }
            reachable
        }
    }
}
