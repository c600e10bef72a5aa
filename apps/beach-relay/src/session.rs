use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SignalingError, TransportError};
use crate::media::MediaPeer;
use crate::negotiation::Negotiation;
use crate::registry::{ConnectionTx, SharedRegistry};
use crate::signaling::SignalMessage;

/// Transport-neutral frame exchanged with a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Per-connection behaviour derived from the server config
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Relay every valid inbound message to the other connections of the room
    pub room_relay: bool,
    pub negotiation_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            room_relay: false,
            negotiation_timeout: None,
        }
    }
}

/// Generate a unique connection ID
pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}

/// Room membership of one connection; released exactly once on drop.
struct RoomMembership {
    registry: SharedRegistry,
    session_id: String,
    connection_id: String,
}

impl RoomMembership {
    fn join(
        registry: &SharedRegistry,
        session_id: &str,
        connection_id: &str,
        tx: ConnectionTx,
    ) -> Self {
        registry.join_room(session_id, connection_id, tx);
        Self {
            registry: registry.clone(),
            session_id: session_id.to_string(),
            connection_id: connection_id.to_string(),
        }
    }
}

impl Drop for RoomMembership {
    fn drop(&mut self) {
        self.registry.leave_room(&self.session_id, &self.connection_id);
    }
}

/// Runs the signaling protocol for one accepted connection.
pub struct ConnectionSession {
    connection_id: String,
    session_id: String,
    registry: SharedRegistry,
    negotiation: Negotiation,
    settings: SessionSettings,
}

impl ConnectionSession {
    pub fn new(
        session_id: String,
        registry: SharedRegistry,
        peer: Box<dyn MediaPeer>,
        settings: SessionSettings,
    ) -> Self {
        let connection_id = generate_connection_id();
        let negotiation = Negotiation::new(
            peer,
            registry.clone(),
            session_id.clone(),
            connection_id.clone(),
        );
        Self {
            connection_id,
            session_id,
            registry,
            negotiation,
            settings,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Read frames until the connection closes or fails, then release it.
    ///
    /// Outbound frames go through a dedicated writer task so a slow peer
    /// only ever stalls its own connection.
    pub async fn run<R, W>(mut self, reader: R, writer: W) -> Result<(), TransportError>
    where
        R: Stream<Item = Result<Frame, TransportError>>,
        W: Sink<Frame, Error = TransportError> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<SignalMessage>();
        let writer_task = tokio::spawn(write_loop(rx, writer, self.connection_id.clone()));
        let membership = RoomMembership::join(
            &self.registry,
            &self.session_id,
            &self.connection_id,
            tx.clone(),
        );

        debug!(
            "Connection opened: connection={} session={} members={}",
            self.connection_id,
            self.session_id,
            self.registry.room_size(&self.session_id)
        );

        futures_util::pin_mut!(reader);
        let result = self.read_loop(&mut reader, &tx).await;

        // Drop every sender so the writer drains, closes, and exits.
        drop(membership);
        drop(tx);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!("writer for {} ended: {}", self.connection_id, err),
            Err(err) => warn!("writer task for {} panicked: {}", self.connection_id, err),
        }

        let connection_id = self.connection_id;
        let session_id = self.session_id;
        let rounds = self.negotiation.state().round();
        self.negotiation.close().await;

        match &result {
            Ok(()) => debug!(
                "Connection closed: connection={} session={} rounds={}",
                connection_id, session_id, rounds
            ),
            Err(err) => info!(
                "Connection {} in session {} torn down: {}",
                connection_id, session_id, err
            ),
        }
        result
    }

    async fn read_loop<R>(&mut self, reader: &mut R, tx: &ConnectionTx) -> Result<(), TransportError>
    where
        R: Stream<Item = Result<Frame, TransportError>> + Unpin,
    {
        loop {
            let deadline = self
                .settings
                .negotiation_timeout
                .and_then(|timeout| self.negotiation.stall_deadline(timeout));

            let next = tokio::select! {
                next = reader.next() => next,
                _ = tx.closed() => return Err(TransportError::WriterGone),
                _ = sleep_until(deadline) => {
                    self.negotiation.expire();
                    continue;
                }
            };

            match next {
                None => return Ok(()),
                Some(Err(err)) => return Err(err),
                Some(Ok(Frame::Close)) => {
                    debug!("Received Close frame from connection {}", self.connection_id);
                    return Ok(());
                }
                Some(Ok(Frame::Text(text))) => self.handle_text(&text, tx).await?,
                Some(Ok(Frame::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => self.handle_text(&text, tx).await?,
                    Err(_) => debug!(
                        "Ignoring non-UTF8 Binary frame from connection {}",
                        self.connection_id
                    ),
                },
            }
        }
    }

    async fn handle_text(&mut self, text: &str, tx: &ConnectionTx) -> Result<(), TransportError> {
        let message = match SignalMessage::decode(text) {
            Ok(message) => message,
            Err(SignalingError::UnknownType(kind)) => {
                warn!(
                    "Ignoring unknown message type {:?} from connection {}",
                    kind, self.connection_id
                );
                return Ok(());
            }
            Err(err) => {
                warn!("Dropping frame from connection {}: {}", self.connection_id, err);
                return Ok(());
            }
        };

        if self.settings.room_relay {
            let delivered = self
                .registry
                .relay_except(&self.session_id, &self.connection_id, &message);
            debug!(
                "Relayed {} from {} to {} peers",
                message.kind, self.connection_id, delivered
            );
        }

        match self.negotiation.dispatch(&message).await {
            Ok(replies) => {
                for reply in replies {
                    tx.send(reply).map_err(|_| TransportError::WriterGone)?;
                }
            }
            Err(err) => warn!(
                "Negotiation step failed for connection {} ({}): {}",
                self.connection_id,
                self.negotiation.state().phase(),
                err
            ),
        }
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn write_loop<W>(
    mut rx: mpsc::UnboundedReceiver<SignalMessage>,
    writer: W,
    connection_id: String,
) -> Result<(), TransportError>
where
    W: Sink<Frame, Error = TransportError>,
{
    futures_util::pin_mut!(writer);
    while let Some(message) = rx.recv().await {
        let text = match message.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!("Failed to encode {} for {}: {}", message.kind, connection_id, err);
                continue;
            }
        };
        writer.send(Frame::Text(text)).await?;
    }
    debug!("Message sender task ended for connection {}", connection_id);
    let _ = writer.send(Frame::Close).await;
    writer.close().await
}
