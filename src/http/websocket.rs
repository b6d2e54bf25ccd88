//! WebSocket sessions.
//!
//! # Responsibilities
//! - Run one dispatch loop per upgraded connection
//! - Binary frames carry full wire messages (header + payload)
//! - Text frames carry a bare request payload; the reply is the bare payload
//!
//! # Design Decisions
//! - Each connection gets its own session id and controller cache
//! - The loop ends on close, error, or server shutdown

use std::net::SocketAddr;

use axum::extract::ws::{Message as WsMessage, WebSocket};

use super::server::HttpState;
use crate::rpc::{Message, SessionInfo};

pub(crate) async fn serve(mut socket: WebSocket, state: HttpState, id: u32, remote: SocketAddr) {
    let session = SessionInfo::new(id, Some(remote));
    let mut shutdown = state.shutdown.subscribe();
    tracing::debug!(session_id = id, remote = %remote, "WebSocket session opened");

    loop {
        let frame = tokio::select! {
            _ = shutdown.recv() => break,
            frame = socket.recv() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::debug!(session_id = id, error = %e, "WebSocket read failed");
                break;
            }
            None => break,
        };

        let reply = match frame {
            WsMessage::Binary(bytes) => match Message::from_bytes(&bytes) {
                Some(request) => state
                    .dispatcher
                    .process(&session, request)
                    .map(|reply| WsMessage::Binary(reply.to_bytes().into())),
                None => {
                    tracing::debug!(session_id = id, bytes = bytes.len(), "Malformed frame dropped");
                    None
                }
            },
            WsMessage::Text(text) => {
                let request = Message::request(state.next_sequence(), text.as_str().as_bytes().to_vec());
                state
                    .dispatcher
                    .process(&session, request)
                    .and_then(|reply| String::from_utf8(reply.payload).ok())
                    .map(|text| WsMessage::Text(text.into()))
            }
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => None,
        };

        if let Some(reply) = reply {
            if socket.send(reply).await.is_err() {
                break;
            }
        }
    }

    tracing::debug!(session_id = id, remote = %remote, "WebSocket session closed");
}
