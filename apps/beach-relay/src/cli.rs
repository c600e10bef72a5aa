use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::signaling::{SignalKind, SignalMessage};

#[derive(Parser, Debug)]
#[command(name = "beach-relay")]
#[command(about = "Beach Relay signaling server and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the listening port (BEACH_RELAY_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Log filter used when RUST_LOG is not set (e.g. "info", "beach_relay=debug")
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the signaling server (default)
    Serve,

    /// Send one signaling message and print whatever comes back
    Send {
        /// Relay URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Session ID to join; the server's default session when omitted
        #[arg(short, long)]
        session: Option<String>,

        /// Message type
        #[arg(value_enum)]
        kind: MessageKind,

        /// Opaque payload (SDP or candidate line)
        data: String,

        /// Seconds to keep listening for replies
        #[arg(short, long, default_value_t = 5)]
        wait: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum MessageKind {
    Offer,
    Answer,
    Candidate,
}

impl From<MessageKind> for SignalKind {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Offer => SignalKind::Offer,
            MessageKind::Answer => SignalKind::Answer,
            MessageKind::Candidate => SignalKind::Candidate,
        }
    }
}

pub(crate) fn websocket_url(base: &str, session: Option<&str>) -> String {
    let base = base.trim().trim_end_matches('/');
    match session.map(str::trim).filter(|s| !s.is_empty()) {
        Some(session) => format!("{}/v1/ws/{}", base, session),
        None => format!("{}/v1/ws", base),
    }
}

pub async fn run_send_client(
    url: String,
    session: Option<String>,
    kind: MessageKind,
    data: String,
    wait: u64,
) -> Result<()> {
    let ws_url = websocket_url(&url, session.as_deref());
    debug!("Connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow::anyhow!(
                "Connection timeout - is the relay running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let message = SignalMessage::new(kind.into(), data);
    write.send(Message::Text(message.encode()?.into())).await?;

    let deadline = Instant::now() + Duration::from_secs(wait);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let frame = match timeout(remaining, read.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => {
                debug!("Relay closed the connection");
                break;
            }
            Err(_) => break,
        };
        match frame {
            Message::Text(text) => println!("{}", text.as_str()),
            Message::Close(_) => break,
            other => debug!("Ignoring {:?}", other),
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}
