//! Connection multiplexer: one WebSocket per agent host.
//!
//! The read loop decodes each frame and hands it to the router without
//! waiting on any downstream answer. All outbound traffic for the host goes
//! through one unbounded channel drained by a single writer task, so frames
//! are never interleaved and leave in submission order.

use std::{net::SocketAddr, sync::Arc};

use {
    agentgate_protocol::{FrameHint, Message},
    axum::{
        body::Bytes,
        extract::ws::{Message as WsMessage, WebSocket},
    },
    futures::{SinkExt, StreamExt, stream::SplitSink},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{error::RouteError, router::Router, state::ConnectedClient};

pub async fn handle_connection(socket: WebSocket, router: Router, remote_addr: SocketAddr) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let state = Arc::clone(router.state());
    let client = Arc::new(ConnectedClient::new(
        conn_id.clone(),
        tx,
        Some(remote_addr),
        state.uptime_ms(),
    ));
    state.register_client(Arc::clone(&client)).await;
    info!(conn_id = %conn_id, remote = %remote_addr, "host connected");

    let writer = tokio::spawn(write_loop(
        ws_tx,
        rx,
        conn_id.clone(),
        state.routing.heartbeat_interval(),
    ));

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "websocket read error");
                break;
            },
        };
        client.touch(state.uptime_ms());
        match frame {
            WsMessage::Text(text) => handle_frame(&router, &client, text.as_str()).await,
            WsMessage::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_frame(&router, &client, text).await,
                Err(_) => warn!(conn_id = %conn_id, len = bytes.len(), "non-UTF-8 binary frame ignored"),
            },
            WsMessage::Close(_) => break,
            // Pongs only refresh liveness; axum answers pings itself.
            WsMessage::Ping(_) | WsMessage::Pong(_) => {},
        }
    }

    router.connection_closed(&conn_id).await;
    drop(client);
    writer.abort();
    info!(conn_id = %conn_id, "host disconnected");
}

/// Decode one frame and dispatch it. A frame that fails to decode is
/// answered with a targeted error when its request id can be recovered.
async fn handle_frame(router: &Router, client: &ConnectedClient, raw: &str) {
    match Message::decode(raw) {
        Ok(msg) => router.handle_inbound(client, msg).await,
        Err(e) => {
            warn!(conn_id = %client.conn_id, error = %e, "malformed frame");
            let reply = FrameHint::recover(raw)
                .and_then(|hint| hint.error_reply(RouteError::Malformed(e.to_string()).to_string()));
            if let Some(reply) = reply {
                client.send(reply);
            }
        },
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    conn_id: String,
    heartbeat: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    break;
                };
                let frame = match msg.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(conn_id = %conn_id, error = %e, "dropping unencodable message");
                        continue;
                    },
                };
                if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            },
            _ = ticker.tick() => {
                if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            },
        }
    }
    let _ = ws_tx.close().await;
    debug!(conn_id = %conn_id, "writer stopped");
}
