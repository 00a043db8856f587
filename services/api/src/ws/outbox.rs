//! Ordered outbound queue for one connection.
//!
//! Everything the session emits goes through a single channel drained by one
//! writer task, so frames reach the socket in exactly the order they were
//! queued regardless of which task produced them.

use super::protocol::{ServerMessage, Speaker, Status};
use tokio::sync::mpsc;
use tracing::error;

const OUTBOX_CAPACITY: usize = 64;

/// An item for the socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerMessage),
    /// Close the socket after everything queued before it.
    Close,
}

/// The writer side is gone; the client has disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client connection closed")]
pub struct ConnectionClosed;

#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn send(&self, msg: ServerMessage) -> Result<(), ConnectionClosed> {
        self.tx
            .send(Outbound::Frame(msg))
            .await
            .map_err(|_| ConnectionClosed)
    }

    pub async fn transcript(&self, text: &str, speaker: Speaker) -> Result<(), ConnectionClosed> {
        self.send(ServerMessage::transcript(text, speaker)).await
    }

    pub async fn status(&self, status: Status, message: &str) -> Result<(), ConnectionClosed> {
        self.send(ServerMessage::status(status, message)).await
    }

    /// Reports a recoverable failure to the client and the log.
    pub async fn error(&self, message: String) -> Result<(), ConnectionClosed> {
        error!("{}", message);
        self.send(ServerMessage::error(message)).await
    }

    pub async fn close(&self) -> Result<(), ConnectionClosed> {
        self.tx
            .send(Outbound::Close)
            .await
            .map_err(|_| ConnectionClosed)
    }
}
