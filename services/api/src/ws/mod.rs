//! WebSocket Voice Sessions
//!
//! This module contains the core logic for handling real-time voice sessions
//! over WebSockets. It is structured into submodules for clarity:
//!
//! - `protocol`: Defines the JSON message format for client-server communication.
//! - `outbox`: The ordered outbound queue shared by a session's tasks.
//! - `session`: Manages the WebSocket connection lifecycle, from upgrade to teardown.
//! - `cycle`: The conversation state machine that turns transcripts into replies.
//! - `provider`: Speech-to-text and text-to-speech providers (Deepgram).

pub mod cycle;
pub mod outbox;
pub mod protocol;
pub mod provider;
pub mod session;

pub use session::ws_handler;
