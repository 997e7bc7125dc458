//! WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing split
//! reader/writer halves for use in `tokio::select!` loops. The
//! session layer never touches `tungstenite` types directly: frames
//! arrive as raw bytes regardless of whether the engine sent them as
//! text or binary, and only the frame payloads, pings, and close
//! notifications surface as [`TransportEvent`]s.

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::error::Result;

/// Concrete WebSocket stream type behind plain TCP or TLS.
type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Transport-level event surfaced to the session loop.
#[derive(Debug)]
pub enum TransportEvent {
    /// Payload of a text or binary frame.
    Frame(Bytes),
    /// Ping payload to echo back.
    Ping(Vec<u8>),
    /// Peer sent a close frame.
    Close {
        /// WebSocket close code, when the peer supplied one.
        code: Option<u16>,
        /// Human-readable close reason, possibly empty.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct TransportWriter {
    sink: SplitSink<WsStream, tungstenite::Message>,
}

impl TransportWriter {
    /// Send a UTF-8 text frame.
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink.send(tungstenite::Message::Text(text)).await?;
        Ok(())
    }

    /// Send a pong frame echoing a ping payload.
    pub async fn send_pong(&mut self, payload: Vec<u8>) -> Result<()> {
        self.sink.send(tungstenite::Message::Pong(payload)).await?;
        Ok(())
    }

    /// Flush pending writes and close the connection.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await?;
        Ok(())
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct TransportReader {
    stream: SplitStream<WsStream>,
}

impl TransportReader {
    /// Receive the next transport event, returning `None` when the
    /// stream ends.
    ///
    /// Pong frames and raw frames are skipped internally.
    pub async fn next_event(&mut self) -> Option<Result<TransportEvent>> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => {
                    return Some(Ok(TransportEvent::Frame(Bytes::from(text))));
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    return Some(Ok(TransportEvent::Frame(Bytes::from(data))));
                }
                Ok(tungstenite::Message::Ping(payload)) => {
                    return Some(Ok(TransportEvent::Ping(payload)));
                }
                Ok(tungstenite::Message::Pong(_)) => continue,
                Ok(tungstenite::Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|frame| (Some(u16::from(frame.code)), frame.reason.to_string()))
                        .unwrap_or((None, String::new()));
                    return Some(Ok(TransportEvent::Close { code, reason }));
                }
                Ok(tungstenite::Message::Frame(_)) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Connect to the engine's WebSocket endpoint and split the stream.
///
/// # Errors
///
/// Returns an error if the URL is invalid, the host is unreachable,
/// or the WebSocket handshake fails.
pub async fn connect(address: &str) -> Result<(TransportWriter, TransportReader)> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(address).await?;
    let (sink, stream) = ws_stream.split();
    Ok((TransportWriter { sink }, TransportReader { stream }))
}
