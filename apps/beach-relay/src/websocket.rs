use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{future, SinkExt, StreamExt};
use std::net::SocketAddr;
use tracing::{debug, error, info};

use crate::error::TransportError;
use crate::media::SharedPeerFactory;
use crate::registry::SharedRegistry;
use crate::session::{ConnectionSession, Frame, SessionSettings};

/// Shared state handed to every route
#[derive(Clone)]
pub struct SignalingState {
    pub registry: SharedRegistry,
    pub peers: SharedPeerFactory,
    pub settings: SessionSettings,
    pub default_session_id: String,
}

/// WebSocket upgrade handler for a named session
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<SignalingState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state, remote_addr))
}

/// WebSocket upgrade handler for clients that do not name a session
pub async fn default_websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<SignalingState>,
) -> Response {
    let session_id = state.default_session_id.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state, remote_addr))
}

fn inbound_frame(msg: Result<Message, axum::Error>) -> Option<Result<Frame, TransportError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
        Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data))),
        Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
        // axum answers pings itself
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Err(e) => Some(Err(TransportError::Read(e.to_string()))),
    }
}

fn outbound_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Close => Message::Close(None),
    }
}

/// Handle a WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    session_id: String,
    state: SignalingState,
    remote_addr: SocketAddr,
) {
    let peer = match state.peers.create_peer().await {
        Ok(peer) => peer,
        Err(e) => {
            error!("Failed to create media peer for {}: {}", remote_addr, e);
            let _ = socket.close().await;
            return;
        }
    };

    let session = ConnectionSession::new(
        session_id.clone(),
        state.registry.clone(),
        peer,
        state.settings,
    );
    let connection_id = session.connection_id().to_string();
    info!(
        "WebSocket connected: connection={} session={} remote={}",
        connection_id, session_id, remote_addr
    );

    let (sender, receiver) = socket.split();
    let reader = receiver.filter_map(|msg| future::ready(inbound_frame(msg)));
    let writer = sender
        .with(|frame: Frame| future::ready(Ok::<_, axum::Error>(outbound_message(frame))))
        .sink_map_err(|e| TransportError::Write(e.to_string()));

    if let Err(e) = session.run(reader, writer).await {
        debug!("Connection {} ended with error: {}", connection_id, e);
    }

    info!(
        "WebSocket disconnected: connection={} session={}",
        connection_id, session_id
    );
}
