//! Defines the WebSocket message protocol between the browser client and the API server.
//!
//! Binary frames from the client carry raw PCM audio (16-bit signed, 16 kHz,
//! mono) and are not represented here. Text frames carry the JSON messages below.

use serde::{Deserialize, Serialize};

/// Sample rate of every PCM stream crossing the socket, in both directions.
pub const PCM_SAMPLE_RATE: u32 = 16_000;
/// Deepgram's name for 16-bit little-endian PCM.
pub const PCM_ENCODING: &str = "linear16";

/// Control messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keep-alive ping, answered with `pong`.
    Ping,
    /// Clears the conversation and per-session context.
    Reset,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Connected,
    Thinking,
    Speaking,
    Ready,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    ConversationEnded,
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A finalized line of the conversation, from either side.
    Transcript { text: String, speaker: Speaker },
    /// Progress of the current turn.
    Status { status: Status, message: String },
    /// Synthesized speech for one assistant reply (base64 encoded PCM16).
    Audio {
        data: String,
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        encoding: &'static str,
    },
    /// A recoverable failure; the connection stays open.
    Error { message: String },
    /// The assistant ended the call; the socket closes right after.
    Disconnect { reason: DisconnectReason },
    Pong,
}

impl ServerMessage {
    pub fn transcript(text: impl Into<String>, speaker: Speaker) -> Self {
        Self::Transcript {
            text: text.into(),
            speaker,
        }
    }

    pub fn status(status: Status, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn audio(data: String) -> Self {
        Self::Audio {
            data,
            sample_rate: PCM_SAMPLE_RATE,
            encoding: PCM_ENCODING,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
