//! WebSocket transport: accept loop plus one reader and one writer task per
//! connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;

use crate::error::{HubError, Result};
use crate::hub::{DisconnectReason, Hub, InboundHandler, Outbound};

const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// Bind the listener [`serve`] accepts on.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| HubError::Bind { addr, source })
}

/// Accept WebSocket connections until `shutdown` is cancelled, then close
/// every connection.
///
/// The actor behind a connection is taken from the `actorId` query
/// parameter of the upgrade request.
pub async fn serve(
    listener: TcpListener,
    hub: Arc<Hub>,
    handler: Arc<dyn InboundHandler>,
    shutdown: CancellationToken,
) {
    tracing::info!(addr = ?listener.local_addr().ok(), "realtime server listening");
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(handle_connection(
                            stream,
                            peer,
                            Arc::clone(&hub),
                            Arc::clone(&handler),
                        ));
                    }
                    Err(e) => tracing::warn!("accept failed: {e}"),
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.cancelled() => break,
        }
    }

    hub.close_all();
    while connections.join_next().await.is_some() {}
    tracing::info!("realtime server stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<Hub>,
    handler: Arc<dyn InboundHandler>,
) {
    let mut actor_id = None;
    let callback = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        actor_id = request.uri().query().and_then(actor_from_query);
        Ok(response)
    };
    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(%peer, "WebSocket handshake failed: {e}");
            return;
        }
    };

    let registration = hub.register(actor_id);
    let info = registration.info;
    let closed = registration.closed;
    let (ws_write, mut ws_read) = ws.split();
    let mut writer = tokio::spawn(write_loop(ws_write, registration.outbound));

    let reason = loop {
        tokio::select! {
            frame = ws_read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if let Some(command) = hub.handle_text(&info.id, text.as_str()) {
                            handler.handle(&hub, &info, command).await;
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => break DisconnectReason::Closed,
                    Some(Ok(_)) => {
                        // Pongs, pings and binary frames still prove liveness.
                        hub.mark_alive(&info.id);
                    }
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %info.id, "read failed: {e}");
                        break DisconnectReason::TransportError;
                    }
                }
            }
            // Terminated by the hub (heartbeat timeout or shutdown).
            _ = closed.cancelled() => break DisconnectReason::Closed,
        }
    };

    // No-op when the hub already removed it; dropping the sender ends the writer.
    hub.disconnect(&info.id, reason);
    match tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(connection_id = %info.id, "writer task failed: {e}"),
        Err(_) => {
            tracing::debug!(connection_id = %info.id, "writer did not finish in time");
            writer.abort();
        }
    }
}

async fn write_loop(
    mut ws_write: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
    mut outbound: tokio::sync::mpsc::Receiver<Outbound>,
) {
    while let Some(frame) = outbound.recv().await {
        let message = match frame {
            Outbound::Text(text) => tungstenite::Message::text(text.to_string()),
            Outbound::Ping => tungstenite::Message::Ping(Default::default()),
        };
        if let Err(e) = ws_write.send(message).await {
            tracing::debug!("write failed: {e}");
            return;
        }
    }
    let _ = ws_write.send(tungstenite::Message::Close(None)).await;
}

fn actor_from_query(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "actorId")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}
