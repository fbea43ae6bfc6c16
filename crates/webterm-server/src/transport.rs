//! Deadline-aware halves of an upgraded WebSocket.
//!
//! axum sockets have no built-in read/write deadlines, so the reader half
//! carries a rolling absolute deadline (re-armed by every successful read,
//! pongs included) and the writer half applies a fixed timeout per send.
//! The writer is not safe for concurrent use; the session serializes it
//! behind its write-lock.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::time::{timeout, timeout_at, Instant};

/// How long the peer may stay silent before the connection is considered
/// dead. Pongs count as reads, so a live peer answering pings never trips
/// this.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline applied to every outbound send, pings included.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("deadline elapsed")]
    Timeout,
    #[error(transparent)]
    Ws(#[from] axum::Error),
}

/// What a read produced, after stripping transport bookkeeping. The session
/// acts on `Binary` and ignores the rest.
#[derive(Debug)]
pub enum Incoming {
    Binary(Vec<u8>),
    Text,
    Control,
}

pub fn split(socket: WebSocket) -> (TransportWriter, TransportReader) {
    let (sink, stream) = socket.split();
    (
        TransportWriter { sink },
        TransportReader {
            stream,
            deadline: Instant::now() + READ_TIMEOUT,
        },
    )
}

pub struct TransportReader {
    stream: SplitStream<WebSocket>,
    deadline: Instant,
}

impl TransportReader {
    /// Wait for the next message, bounded by the current read deadline.
    /// A close frame or end of stream surfaces as [`TransportError::PeerClosed`].
    pub async fn recv(&mut self) -> Result<Incoming, TransportError> {
        let msg = timeout_at(self.deadline, self.stream.next())
            .await
            .map_err(|_| TransportError::Timeout)?;

        let msg = match msg {
            None => return Err(TransportError::PeerClosed),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(msg)) => msg,
        };

        self.deadline = Instant::now() + READ_TIMEOUT;

        match msg {
            Message::Binary(bytes) => Ok(Incoming::Binary(bytes)),
            Message::Text(_) => Ok(Incoming::Text),
            // axum answers pings itself; pongs only matter for the
            // deadline re-arm above.
            Message::Ping(_) | Message::Pong(_) => Ok(Incoming::Control),
            Message::Close(_) => Err(TransportError::PeerClosed),
        }
    }
}

pub struct TransportWriter {
    sink: SplitSink<WebSocket, Message>,
}

impl TransportWriter {
    pub async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        timeout(WRITE_TIMEOUT, self.sink.send(Message::Binary(bytes)))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::from)
    }

    pub async fn ping(&mut self) -> Result<(), TransportError> {
        timeout(WRITE_TIMEOUT, self.sink.send(Message::Ping(Vec::new())))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::from)
    }

    /// Best-effort close of the outbound half. Safe to call more than once;
    /// errors from an already-closed socket are discarded.
    pub async fn close(&mut self) {
        let _ = timeout(WRITE_TIMEOUT, self.sink.close()).await;
    }
}
